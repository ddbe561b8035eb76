//! Docker Swarm cluster assembly. Same shape as the k3s pair; the
//! artifact is the swarm worker join token.

use crate::activity::log_activity;
use crate::handlers::{open_server_session, run_ok, SessionError};
use crate::tasks::ClusterServerPayload;
use crate::EngineContext;
use async_trait::async_trait;
use orchestra_common::models::{ActivityType, ClusterStatus, ServerRole};
use orchestra_queue::{TaskError, TaskHandler, TaskMessage};
use std::sync::Arc;
use tracing::info;

/// Installs Docker when absent; a no-op on re-runs.
const DOCKER_INSTALL_CMD: &str =
    "command -v docker >/dev/null 2>&1 || { curl -fsSL https://get.docker.com | sh; }";

/// `cluster:swarm_init`: initializes the swarm on the manager node and
/// captures the worker join token.
pub struct SwarmInitHandler {
    pub ctx: Arc<EngineContext>,
}

#[async_trait]
impl TaskHandler for SwarmInitHandler {
    async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError> {
        let payload: ClusterServerPayload = task.payload_as()?;
        let store = &self.ctx.store;

        info!(
            cluster_id = payload.cluster_id,
            server_id = payload.server_id,
            "Initializing Docker Swarm"
        );

        let cluster = store
            .get_cluster(payload.cluster_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| TaskError::fatal(format!("cluster {} not found", payload.cluster_id)))?;

        let server = store
            .get_server(payload.server_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| TaskError::fatal(format!("server {} not found", payload.server_id)))?;

        store
            .update_cluster_status(cluster.id, ClusterStatus::Provisioning)
            .await
            .map_err(TaskError::retryable)?;

        let session = match open_server_session(&self.ctx, &server).await {
            Ok(session) => session,
            Err(err @ SessionError::Decrypt) => {
                let _ = store.set_cluster_error(cluster.id, &err.message()).await;
                return Err(TaskError::fatal(err.message()));
            }
            Err(err @ SessionError::Connect(_)) => {
                let _ = store.set_cluster_error(cluster.id, &err.message()).await;
                return Err(TaskError::retryable(anyhow::anyhow!(err.message())));
            }
        };

        let result: Result<String, anyhow::Error> = async {
            run_ok(session.as_ref(), DOCKER_INSTALL_CMD)
                .await
                .map_err(|e| anyhow::anyhow!("Docker install failed: {}", e))?;

            // Idempotent: an already-initialized node reports ALREADY_SWARM.
            let init_cmd = format!(
                "docker swarm init --advertise-addr {} 2>/dev/null || echo ALREADY_SWARM",
                server.address
            );
            run_ok(session.as_ref(), &init_cmd)
                .await
                .map_err(|e| anyhow::anyhow!("swarm init failed: {}", e))?;

            let token = run_ok(session.as_ref(), "docker swarm join-token worker -q")
                .await
                .map_err(|e| anyhow::anyhow!("failed to get swarm join token: {}", e))?
                .stdout
                .trim()
                .to_string();
            if token.is_empty() {
                anyhow::bail!("swarm join token came back empty");
            }
            Ok(token)
        }
        .await;
        session.close().await;

        let token = match result {
            Ok(token) => token,
            Err(e) => {
                let _ = store.set_cluster_error(cluster.id, &e.to_string()).await;
                return Err(TaskError::Retryable(e));
            }
        };

        store
            .store_swarm_token(cluster.id, &token)
            .await
            .map_err(TaskError::retryable)?;
        store
            .assign_server_role(server.id, ServerRole::Manager, cluster.id)
            .await
            .map_err(TaskError::retryable)?;

        log_activity(
            store.as_ref(),
            ActivityType::ClusterProvisioned,
            format!("Cluster '{}' provisioned (swarm manager ready)", cluster.name),
            "cluster",
            cluster.id,
        )
        .await;

        info!(cluster_id = cluster.id, "Docker Swarm initialized");
        Ok(())
    }
}

/// `cluster:swarm_join`: joins a worker using the stored token.
pub struct SwarmJoinHandler {
    pub ctx: Arc<EngineContext>,
}

#[async_trait]
impl TaskHandler for SwarmJoinHandler {
    async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError> {
        let payload: ClusterServerPayload = task.payload_as()?;
        let store = &self.ctx.store;

        info!(
            cluster_id = payload.cluster_id,
            server_id = payload.server_id,
            "Joining worker to swarm"
        );

        let cluster = store
            .get_cluster(payload.cluster_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| TaskError::fatal(format!("cluster {} not found", payload.cluster_id)))?;

        if cluster.swarm_join_token.is_empty() {
            return Err(TaskError::retryable(anyhow::anyhow!(
                "cluster {} has no swarm join token, manager not ready",
                cluster.id
            )));
        }

        let manager = store
            .get_server(cluster.manager_server_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| {
                TaskError::fatal(format!(
                    "manager server {} not found",
                    cluster.manager_server_id
                ))
            })?;

        let worker = store
            .get_server(payload.server_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| TaskError::fatal(format!("server {} not found", payload.server_id)))?;

        let session = match open_server_session(&self.ctx, &worker).await {
            Ok(session) => session,
            Err(err @ SessionError::Decrypt) => return Err(TaskError::fatal(err.message())),
            Err(err @ SessionError::Connect(_)) => {
                return Err(TaskError::retryable(anyhow::anyhow!(err.message())))
            }
        };

        let result: Result<(), anyhow::Error> = async {
            run_ok(session.as_ref(), DOCKER_INSTALL_CMD)
                .await
                .map_err(|e| anyhow::anyhow!("Docker install failed: {}", e))?;

            let join_cmd = format!(
                "docker swarm join --token {} {}:2377",
                cluster.swarm_join_token, manager.address
            );
            run_ok(session.as_ref(), &join_cmd)
                .await
                .map_err(|e| anyhow::anyhow!("swarm join failed: {}", e))?;
            Ok(())
        }
        .await;
        session.close().await;
        result.map_err(TaskError::Retryable)?;

        store
            .assign_server_role(worker.id, ServerRole::Worker, cluster.id)
            .await
            .map_err(TaskError::retryable)?;

        info!(
            cluster_id = cluster.id,
            server_id = worker.id,
            "Worker joined swarm"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::*;
    use crate::tasks::{swarm_init_task, swarm_join_task};
    use orchestra_common::models::{ClusterType, NewCluster};
    use orchestra_store::Store;

    async fn seed_swarm_cluster(
        store: &orchestra_store::MemoryStore,
        manager_id: i64,
    ) -> orchestra_common::models::Cluster {
        store
            .insert_cluster(NewCluster {
                name: "swarm-prod".to_string(),
                cluster_type: ClusterType::Swarm,
                manager_server_id: manager_id,
                cni_plugin: None,
                domain: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_swarm_init_stores_token_and_activates() {
        let session = ScriptedSession::new();
        session.reply("join-token worker -q", "SWMTKN-1-abcdef\n");
        let gateway = ScriptedGateway::new();
        gateway.host("10.1.0.1", session.clone());
        let (ctx, store) = test_context(gateway);
        let server = seed_ready_server(&store, &ctx.vault, "10.1.0.1").await;
        let cluster = seed_swarm_cluster(&store, server.id).await;

        let handler = SwarmInitHandler { ctx };
        handler
            .handle(&swarm_init_task(cluster.id, server.id))
            .await
            .unwrap();

        let loaded = store.get_cluster(cluster.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ClusterStatus::Active);
        assert_eq!(loaded.swarm_join_token, "SWMTKN-1-abcdef");
        assert!(session.saw_command("--advertise-addr 10.1.0.1"));

        let manager = store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(manager.role, ServerRole::Manager);
    }

    #[tokio::test]
    async fn test_swarm_init_empty_token_is_retryable() {
        let session = ScriptedSession::new();
        session.reply("join-token worker -q", "\n");
        let gateway = ScriptedGateway::new();
        gateway.host("10.1.0.2", session);
        let (ctx, store) = test_context(gateway);
        let server = seed_ready_server(&store, &ctx.vault, "10.1.0.2").await;
        let cluster = seed_swarm_cluster(&store, server.id).await;

        let handler = SwarmInitHandler { ctx };
        let result = handler.handle(&swarm_init_task(cluster.id, server.id)).await;
        assert!(matches!(result, Err(TaskError::Retryable(_))));

        let loaded = store.get_cluster(cluster.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ClusterStatus::Error);
    }

    #[tokio::test]
    async fn test_swarm_join_consumes_stored_token() {
        let worker_session = ScriptedSession::new();
        let gateway = ScriptedGateway::new();
        gateway.host("10.1.0.3", worker_session.clone());
        let (ctx, store) = test_context(gateway);
        let manager = seed_ready_server(&store, &ctx.vault, "10.1.0.1").await;
        let worker = seed_ready_server(&store, &ctx.vault, "10.1.0.3").await;
        let cluster = seed_swarm_cluster(&store, manager.id).await;
        store
            .store_swarm_token(cluster.id, "SWMTKN-1-xyz")
            .await
            .unwrap();

        let handler = SwarmJoinHandler { ctx };
        handler
            .handle(&swarm_join_task(cluster.id, worker.id))
            .await
            .unwrap();

        assert!(worker_session.saw_command("docker swarm join --token SWMTKN-1-xyz 10.1.0.1:2377"));
        let joined = store.get_server(worker.id).await.unwrap().unwrap();
        assert_eq!(joined.role, ServerRole::Worker);
        assert_eq!(joined.cluster_id, Some(cluster.id));
    }

    #[tokio::test]
    async fn test_swarm_join_without_token_retries() {
        let (ctx, store) = test_context(ScriptedGateway::new());
        let manager = seed_ready_server(&store, &ctx.vault, "10.1.0.1").await;
        let worker = seed_ready_server(&store, &ctx.vault, "10.1.0.4").await;
        let cluster = seed_swarm_cluster(&store, manager.id).await;

        let handler = SwarmJoinHandler { ctx };
        let result = handler.handle(&swarm_join_task(cluster.id, worker.id)).await;
        assert!(matches!(result, Err(TaskError::Retryable(_))));
    }
}
