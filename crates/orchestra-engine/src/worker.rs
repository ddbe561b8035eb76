//! Worker entrypoint: wire the store, queue, gateway and vault together,
//! register every handler, and run the dispatcher until shutdown.

use crate::config::Config;
use crate::handlers::{
    DeployAppHandler, DesignateManagerHandler, InstallK3sHandler, JoinWorkerHandler,
    ManualSetupHandler, NginxProvisionHandler, PreflightHandler, PushEnvHandler, SwarmInitHandler,
    SwarmJoinHandler,
};
use crate::tasks;
use crate::EngineContext;
use anyhow::Context;
use orchestra_queue::{Dispatcher, DispatcherConfig, HandlerRegistry, QueueBackend, RedisQueue};
use orchestra_ssh::{Gateway, SshGateway};
use orchestra_store::{PgStore, Store};
use orchestra_vault::Vault;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Register one handler per task kind.
pub fn build_registry(ctx: Arc<EngineContext>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.register(
        tasks::TYPE_PREFLIGHT_CHECK,
        Arc::new(PreflightHandler { ctx: ctx.clone() }),
    );
    registry.register(
        tasks::TYPE_INSTALL_K3S,
        Arc::new(InstallK3sHandler { ctx: ctx.clone() }),
    );
    registry.register(
        tasks::TYPE_DESIGNATE_MANAGER,
        Arc::new(DesignateManagerHandler { ctx: ctx.clone() }),
    );
    registry.register(
        tasks::TYPE_JOIN_WORKER,
        Arc::new(JoinWorkerHandler { ctx: ctx.clone() }),
    );
    registry.register(
        tasks::TYPE_SWARM_INIT,
        Arc::new(SwarmInitHandler { ctx: ctx.clone() }),
    );
    registry.register(
        tasks::TYPE_SWARM_JOIN,
        Arc::new(SwarmJoinHandler { ctx: ctx.clone() }),
    );
    registry.register(
        tasks::TYPE_MANUAL_SETUP,
        Arc::new(ManualSetupHandler { ctx: ctx.clone() }),
    );
    registry.register(
        tasks::TYPE_DEPLOY_APP,
        Arc::new(DeployAppHandler { ctx: ctx.clone() }),
    );
    registry.register(
        tasks::TYPE_PUSH_ENV,
        Arc::new(PushEnvHandler { ctx: ctx.clone() }),
    );
    registry.register(
        tasks::TYPE_NGINX_PROVISION,
        Arc::new(NginxProvisionHandler { ctx }),
    );

    registry
}

/// Connect to the store and queue, then run the worker pool until the
/// shutdown signal flips.
pub async fn run_worker(config: Config, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let vault = Arc::new(Vault::new(&config.encryption_key).context("invalid ENCRYPTION_KEY")?);

    let store: Arc<dyn Store> = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("failed to connect to database")?,
    );
    info!("Worker: database connected");

    let backend: Arc<dyn QueueBackend> = Arc::new(
        RedisQueue::connect(&config.redis_addr, &config.redis_password, config.redis_db)
            .context("failed to connect to redis")?,
    );

    let gateway: Arc<dyn Gateway> = Arc::new(SshGateway::new());

    let ctx = Arc::new(EngineContext {
        store,
        gateway,
        vault,
        key_passphrase: config.ssh_key_passphrase.clone(),
    });
    let registry = build_registry(ctx);

    info!("Orchestra worker starting");
    info!("  Tasks: preflight, k3s, swarm, manual, deploy, nginx, env");
    info!("  Queues: provisioning (6), deployment (3), default (1)");

    let dispatcher = Dispatcher::new(backend, Arc::new(registry), DispatcherConfig::default());
    dispatcher.run(shutdown).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::{test_context, ScriptedGateway};

    #[test]
    fn test_registry_covers_every_kind() {
        let (ctx, _store) = test_context(ScriptedGateway::new());
        let registry = build_registry(ctx);

        for kind in [
            tasks::TYPE_PREFLIGHT_CHECK,
            tasks::TYPE_INSTALL_K3S,
            tasks::TYPE_DESIGNATE_MANAGER,
            tasks::TYPE_JOIN_WORKER,
            tasks::TYPE_SWARM_INIT,
            tasks::TYPE_SWARM_JOIN,
            tasks::TYPE_MANUAL_SETUP,
            tasks::TYPE_DEPLOY_APP,
            tasks::TYPE_PUSH_ENV,
            tasks::TYPE_NGINX_PROVISION,
        ] {
            assert!(registry.get(kind).is_some(), "missing handler for {}", kind);
        }
        assert_eq!(registry.kinds().len(), 10);
    }
}
