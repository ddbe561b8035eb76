//! Manual cluster setup: Docker on every node, no orchestrator.
//!
//! Deliberately looser contract than the k3s/swarm pairs: a node that
//! fails to install is logged and skipped, and the cluster still goes
//! active with whatever joined.

use crate::activity::log_activity;
use crate::handlers::{open_server_session, run_ok};
use crate::tasks::ManualClusterPayload;
use crate::EngineContext;
use async_trait::async_trait;
use orchestra_common::models::{ActivityType, ClusterStatus, ServerRole};
use orchestra_queue::{TaskError, TaskHandler, TaskMessage};
use std::sync::Arc;
use tracing::{info, warn};

const DOCKER_INSTALL_CMD: &str =
    "command -v docker >/dev/null 2>&1 || { curl -fsSL https://get.docker.com | sh; }";

/// `cluster:manual_setup`
pub struct ManualSetupHandler {
    pub ctx: Arc<EngineContext>,
}

#[async_trait]
impl TaskHandler for ManualSetupHandler {
    async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError> {
        let payload: ManualClusterPayload = task.payload_as()?;
        let store = &self.ctx.store;

        info!(cluster_id = payload.cluster_id, "Setting up manual cluster");

        let cluster = store
            .get_cluster(payload.cluster_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| TaskError::fatal(format!("cluster {} not found", payload.cluster_id)))?;

        store
            .update_cluster_status(cluster.id, ClusterStatus::Provisioning)
            .await
            .map_err(TaskError::retryable)?;

        let mut server_ids = vec![payload.manager_server_id];
        server_ids.extend(&payload.worker_server_ids);

        for server_id in server_ids {
            let server = match store.get_server(server_id).await {
                Ok(Some(server)) => server,
                Ok(None) => {
                    warn!(server_id, "Server not found, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(server_id, "Server lookup failed, skipping: {}", e);
                    continue;
                }
            };

            let session = match open_server_session(&self.ctx, &server).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(server_id, "Skipping server: {}", e.message());
                    continue;
                }
            };

            let installed = run_ok(session.as_ref(), DOCKER_INSTALL_CMD).await;
            session.close().await;
            if let Err(e) = installed {
                warn!(server_id, "Docker install failed, skipping: {}", e);
                continue;
            }

            let role = if server_id == payload.manager_server_id {
                ServerRole::Manager
            } else {
                ServerRole::Worker
            };
            if let Err(e) = store.assign_server_role(server_id, role, cluster.id).await {
                warn!(server_id, "Failed to assign role: {}", e);
                continue;
            }

            info!(server_id, cluster_id = cluster.id, "Docker installed");
        }

        store
            .update_cluster_status(cluster.id, ClusterStatus::Active)
            .await
            .map_err(TaskError::retryable)?;

        log_activity(
            store.as_ref(),
            ActivityType::ClusterProvisioned,
            format!("Cluster '{}' provisioned (manual)", cluster.name),
            "cluster",
            cluster.id,
        )
        .await;

        info!(cluster_id = cluster.id, "Manual cluster setup complete");
        Ok(())
    }
}
