//! Reverse-proxy exposure: install nginx, write the site config, enable
//! it, reload, and optionally obtain a certificate.

use crate::activity::log_activity;
use crate::handlers::{open_server_session, run_ok, SessionError};
use crate::render::{heredoc_write, nginx_server_block};
use crate::tasks::NginxProvisionPayload;
use crate::EngineContext;
use async_trait::async_trait;
use orchestra_common::models::{ActivityType, NginxConfig};
use orchestra_common::sanitize;
use orchestra_queue::{TaskError, TaskHandler, TaskMessage};
use orchestra_ssh::RemoteSession;
use std::sync::Arc;
use tracing::info;

const NGINX_INSTALL_CMD: &str = "command -v nginx >/dev/null 2>&1 || \
     { apt-get update -qq && apt-get install -y -qq nginx; } || { yum install -y nginx; }";

/// `server:nginx_provision`
pub struct NginxProvisionHandler {
    pub ctx: Arc<EngineContext>,
}

#[async_trait]
impl TaskHandler for NginxProvisionHandler {
    async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError> {
        let payload: NginxProvisionPayload = task.payload_as()?;
        let store = &self.ctx.store;

        let config = store
            .get_nginx_config(payload.nginx_config_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| {
                TaskError::fatal(format!("nginx config {} not found", payload.nginx_config_id))
            })?;

        let server = store
            .get_server(config.server_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| TaskError::fatal(format!("server {} not found", config.server_id)))?;

        info!(
            nginx_config_id = config.id,
            domain = %config.domain,
            server_id = server.id,
            "Provisioning nginx"
        );

        let session = match open_server_session(&self.ctx, &server).await {
            Ok(session) => session,
            Err(err @ SessionError::Decrypt) => {
                let _ = store.update_nginx_status(config.id, "error").await;
                return Err(TaskError::fatal(err.message()));
            }
            Err(err @ SessionError::Connect(_)) => {
                let _ = store.update_nginx_status(config.id, "error").await;
                return Err(TaskError::retryable(anyhow::anyhow!(err.message())));
            }
        };

        let result = self.provision(&config, session.as_ref()).await;
        session.close().await;

        match result {
            Ok(()) => {
                store
                    .update_nginx_status(config.id, "active")
                    .await
                    .map_err(TaskError::retryable)?;
                log_activity(
                    store.as_ref(),
                    ActivityType::NginxProvisioned,
                    format!("Nginx configured for {}", config.domain),
                    "nginx_config",
                    config.id,
                )
                .await;
                info!(domain = %config.domain, "Nginx configured");
                Ok(())
            }
            Err(e) => {
                let _ = store.update_nginx_status(config.id, "error").await;
                Err(TaskError::Retryable(e))
            }
        }
    }
}

impl NginxProvisionHandler {
    async fn provision(
        &self,
        config: &NginxConfig,
        session: &dyn RemoteSession,
    ) -> Result<(), anyhow::Error> {
        let _ = session.exec(NGINX_INSTALL_CMD).await;

        let body = match config.custom_config.as_deref() {
            Some(custom) if !custom.is_empty() => custom.to_string(),
            _ => nginx_server_block(&config.domain, config.upstream_port),
        };

        let site = sanitize(&config.domain);
        let available = format!("/etc/nginx/sites-available/{}", site);
        let enabled = format!("/etc/nginx/sites-enabled/{}", site);

        run_ok(session, &heredoc_write(&available, &body))
            .await
            .map_err(|e| anyhow::anyhow!("failed to write nginx config: {}", e))?;

        let _ = session.exec("mkdir -p /etc/nginx/sites-enabled").await;
        let _ = session
            .exec(&format!("ln -sf {} {}", available, enabled))
            .await;

        run_ok(session, "nginx -t 2>&1 && systemctl reload nginx 2>&1")
            .await
            .map_err(|e| anyhow::anyhow!("nginx reload failed: {}", e))?;

        if config.lets_encrypt && config.ssl_enabled {
            info!(domain = %config.domain, "Requesting Let's Encrypt certificate");
            // Best effort: a failed cert issuance leaves the plain-HTTP
            // site serving.
            let cert_cmd = format!(
                "command -v certbot >/dev/null 2>&1 || \
                 {{ apt-get install -y -qq certbot python3-certbot-nginx; }} && \
                 certbot --nginx -d {domain} --non-interactive --agree-tos --email admin@{domain} 2>&1",
                domain = config.domain
            );
            let _ = session.exec(&cert_cmd).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::*;
    use crate::tasks::nginx_provision_task;
    use chrono::Utc;
    use orchestra_store::Store;

    fn test_config(server_id: i64, domain: &str) -> NginxConfig {
        NginxConfig {
            id: 0,
            server_id,
            domain: domain.to_string(),
            upstream_port: 3000,
            ssl_enabled: false,
            lets_encrypt: false,
            custom_config: None,
            application_id: None,
            status: "pending".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_provision_writes_and_enables_site() {
        let session = ScriptedSession::new();
        let gateway = ScriptedGateway::new();
        gateway.host("10.4.0.1", session.clone());
        let (ctx, store) = test_context(gateway);
        let server = seed_ready_server(&store, &ctx.vault, "10.4.0.1").await;
        let config_id = store.seed_nginx_config(test_config(server.id, "app.example.com"));

        let handler = NginxProvisionHandler { ctx };
        handler.handle(&nginx_provision_task(config_id)).await.unwrap();

        assert!(session.saw_command("/etc/nginx/sites-available/app-example-com"));
        assert!(session.saw_command("proxy_pass http://127.0.0.1:3000;"));
        assert!(session
            .saw_command("ln -sf /etc/nginx/sites-available/app-example-com /etc/nginx/sites-enabled/app-example-com"));
        assert!(session.saw_command("nginx -t"));
        // No certbot without the ssl + lets_encrypt pair
        assert!(!session.saw_command("certbot"));

        let loaded = store.get_nginx_config(config_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, "active");
    }

    #[tokio::test]
    async fn test_provision_custom_config_used_verbatim() {
        let session = ScriptedSession::new();
        let gateway = ScriptedGateway::new();
        gateway.host("10.4.0.1", session.clone());
        let (ctx, store) = test_context(gateway);
        let server = seed_ready_server(&store, &ctx.vault, "10.4.0.1").await;
        let mut config = test_config(server.id, "custom.example.com");
        config.custom_config = Some("server { listen 8443; }".to_string());
        let config_id = store.seed_nginx_config(config);

        let handler = NginxProvisionHandler { ctx };
        handler.handle(&nginx_provision_task(config_id)).await.unwrap();

        assert!(session.saw_command("server { listen 8443; }"));
        assert!(!session.saw_command("proxy_pass"));
    }

    #[tokio::test]
    async fn test_provision_requests_certificate_when_enabled() {
        let session = ScriptedSession::new();
        let gateway = ScriptedGateway::new();
        gateway.host("10.4.0.1", session.clone());
        let (ctx, store) = test_context(gateway);
        let server = seed_ready_server(&store, &ctx.vault, "10.4.0.1").await;
        let mut config = test_config(server.id, "secure.example.com");
        config.ssl_enabled = true;
        config.lets_encrypt = true;
        let config_id = store.seed_nginx_config(config);

        let handler = NginxProvisionHandler { ctx };
        handler.handle(&nginx_provision_task(config_id)).await.unwrap();

        assert!(session.saw_command(
            "certbot --nginx -d secure.example.com --non-interactive --agree-tos --email admin@secure.example.com"
        ));
    }

    #[tokio::test]
    async fn test_provision_reload_failure_sets_error() {
        let session = ScriptedSession::new();
        session.reply_fail("nginx -t", "nginx: configuration file test failed");
        let gateway = ScriptedGateway::new();
        gateway.host("10.4.0.1", session);
        let (ctx, store) = test_context(gateway);
        let server = seed_ready_server(&store, &ctx.vault, "10.4.0.1").await;
        let config_id = store.seed_nginx_config(test_config(server.id, "bad.example.com"));

        let handler = NginxProvisionHandler { ctx };
        let result = handler.handle(&nginx_provision_task(config_id)).await;
        assert!(matches!(result, Err(TaskError::Retryable(_))));

        let loaded = store.get_nginx_config(config_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, "error");
    }
}
