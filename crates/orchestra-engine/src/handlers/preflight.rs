//! Server inspection and the low-level k3s install task.

use crate::handlers::{open_server_session, run_ok, SessionError};
use crate::tasks::{InstallK3sPayload, PreflightPayload};
use crate::EngineContext;
use async_trait::async_trait;
use orchestra_common::models::{ServerRole, ServerStatus};
use orchestra_queue::{TaskError, TaskHandler, TaskMessage};
use orchestra_ssh::run_preflight;
use std::sync::Arc;
use tracing::info;

/// `server:preflight_check`: probes a node and records the verdict.
///
/// `pending|error → preflight`, then `preflight → ready` on a compatible
/// report, `preflight → error` otherwise. Re-running overwrites the report.
pub struct PreflightHandler {
    pub ctx: Arc<EngineContext>,
}

#[async_trait]
impl TaskHandler for PreflightHandler {
    async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError> {
        let payload: PreflightPayload = task.payload_as()?;
        let store = &self.ctx.store;

        info!(server_id = payload.server_id, "Starting pre-flight check");

        let server = store
            .get_server(payload.server_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| TaskError::fatal(format!("server {} not found", payload.server_id)))?;

        store
            .update_server_status(server.id, ServerStatus::Preflight)
            .await
            .map_err(TaskError::retryable)?;

        let session = match open_server_session(&self.ctx, &server).await {
            Ok(session) => session,
            Err(err @ SessionError::Decrypt) => {
                let _ = store.set_server_error(server.id, &err.message()).await;
                return Err(TaskError::fatal(err.message()));
            }
            Err(err @ SessionError::Connect(_)) => {
                let _ = store.set_server_error(server.id, &err.message()).await;
                return Err(TaskError::retryable(anyhow::anyhow!(err.message())));
            }
        };

        let report = match run_preflight(session.as_ref()).await {
            Ok(report) => report,
            Err(e) => {
                session.close().await;
                let message = format!("preflight check failed: {}", e);
                let _ = store.set_server_error(server.id, &message).await;
                return Err(TaskError::retryable(anyhow::anyhow!(message)));
            }
        };
        session.close().await;

        let status = if report.compatible {
            ServerStatus::Ready
        } else {
            ServerStatus::Error
        };

        store
            .record_inspection(
                server.id,
                status,
                &report.os,
                &report.arch,
                report.cpu_cores,
                report.ram_bytes,
                &report.to_json(),
            )
            .await
            .map_err(TaskError::retryable)?;

        if !report.compatible {
            // First probe error becomes the user-visible message. The
            // verdict is data, not a handler failure: no retry.
            let message = report
                .errors
                .first()
                .cloned()
                .unwrap_or_else(|| "server failed preflight".to_string());
            store
                .set_server_error(server.id, &message)
                .await
                .map_err(TaskError::retryable)?;
        }

        info!(
            server_id = payload.server_id,
            compatible = report.compatible,
            "Pre-flight check completed"
        );
        Ok(())
    }
}

/// `server:install_k3s`: installs k3s on a node in the given role.
pub struct InstallK3sHandler {
    pub ctx: Arc<EngineContext>,
}

#[async_trait]
impl TaskHandler for InstallK3sHandler {
    async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError> {
        let payload: InstallK3sPayload = task.payload_as()?;
        let store = &self.ctx.store;

        info!(
            server_id = payload.server_id,
            role = %payload.role,
            "Starting k3s installation"
        );

        let server = store
            .get_server(payload.server_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| TaskError::fatal(format!("server {} not found", payload.server_id)))?;

        let session = match open_server_session(&self.ctx, &server).await {
            Ok(session) => session,
            Err(err @ SessionError::Decrypt) => return Err(TaskError::fatal(err.message())),
            Err(err @ SessionError::Connect(_)) => {
                return Err(TaskError::retryable(anyhow::anyhow!(err.message())))
            }
        };

        let install_cmd = if payload.role == "server" {
            "curl -sfL https://get.k3s.io | INSTALL_K3S_EXEC='server' sh -".to_string()
        } else {
            format!(
                "curl -sfL https://get.k3s.io | K3S_URL='{}' K3S_TOKEN='{}' sh -",
                payload.server_url, payload.token
            )
        };

        let result = run_ok(session.as_ref(), &install_cmd).await;
        session.close().await;
        if let Err(e) = result {
            let message = format!("k3s installation failed: {}", e);
            let _ = store.set_server_error(server.id, &message).await;
            return Err(TaskError::retryable(anyhow::anyhow!(message)));
        }

        let role = if payload.role == "agent" {
            ServerRole::Worker
        } else {
            ServerRole::Manager
        };
        store
            .update_server_role(server.id, role)
            .await
            .map_err(TaskError::retryable)?;

        info!(server_id = payload.server_id, "k3s installation completed");
        Ok(())
    }
}
