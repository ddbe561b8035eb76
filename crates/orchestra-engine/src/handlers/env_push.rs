//! Environment push: materialize a variable set on every node of a
//! cluster. Per-server failures are logged and skipped; the environment
//! is marked synced even on partial success.

use crate::activity::log_activity;
use crate::handlers::open_server_session;
use crate::render::{env_file, heredoc_write};
use crate::tasks::PushEnvPayload;
use crate::EngineContext;
use async_trait::async_trait;
use orchestra_common::models::ActivityType;
use orchestra_common::sanitize;
use orchestra_queue::{TaskError, TaskHandler, TaskMessage};
use std::sync::Arc;
use tracing::{info, warn};

const ENVS_DIR: &str = "/opt/orchestra/envs";

/// `env:push`
pub struct PushEnvHandler {
    pub ctx: Arc<EngineContext>,
}

#[async_trait]
impl TaskHandler for PushEnvHandler {
    async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError> {
        let payload: PushEnvPayload = task.payload_as()?;
        let store = &self.ctx.store;

        let env = store
            .get_environment(payload.environment_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| {
                TaskError::fatal(format!("environment {} not found", payload.environment_id))
            })?;

        let cluster = store
            .get_cluster(env.cluster_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| TaskError::fatal(format!("cluster {} not found", env.cluster_id)))?;

        let servers = store
            .servers_in_cluster(env.cluster_id)
            .await
            .map_err(TaskError::retryable)?;

        if servers.is_empty() {
            info!(cluster_id = env.cluster_id, "No servers in cluster for env push");
            store
                .mark_environment_synced(env.id)
                .await
                .map_err(TaskError::retryable)?;
            return Ok(());
        }

        let content = env_file(&env.variables);
        let env_path = format!(
            "{}/{}-{}.env",
            ENVS_DIR,
            sanitize(&cluster.name),
            env.scope.as_str()
        );

        let mut pushed = 0;
        for server in &servers {
            let session = match open_server_session(&self.ctx, server).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(server_id = server.id, "Skipping server: {}", e.message());
                    continue;
                }
            };

            let _ = session.exec(&format!("mkdir -p {}", ENVS_DIR)).await;
            match session.exec(&heredoc_write(&env_path, &content)).await {
                Ok(output) if output.success() => {
                    pushed += 1;
                    info!(server_id = server.id, path = %env_path, "Pushed env file");
                }
                Ok(output) => warn!(
                    server_id = server.id,
                    "Failed to push env: {}",
                    output.stderr.trim()
                ),
                Err(e) => warn!(server_id = server.id, "Failed to push env: {}", e),
            }
            session.close().await;
        }

        store
            .mark_environment_synced(env.id)
            .await
            .map_err(TaskError::retryable)?;

        log_activity(
            store.as_ref(),
            ActivityType::EnvPushed,
            format!(
                "Environment '{}' pushed to {}/{} servers",
                env.name,
                pushed,
                servers.len()
            ),
            "environment",
            env.id,
        )
        .await;

        info!(
            environment_id = env.id,
            pushed,
            total = servers.len(),
            "Environment push finished"
        );
        Ok(())
    }
}
