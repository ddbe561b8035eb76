//! Task kinds, wire payloads and constructors.
//!
//! Payload field names are a stable wire format; enqueued tasks may be
//! consumed by a different engine version than the one that produced them.

use orchestra_queue::{TaskMessage, QUEUE_DEPLOYMENT, QUEUE_PROVISIONING};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const TYPE_PREFLIGHT_CHECK: &str = "server:preflight_check";
pub const TYPE_INSTALL_K3S: &str = "server:install_k3s";
pub const TYPE_DESIGNATE_MANAGER: &str = "cluster:designate_manager";
pub const TYPE_JOIN_WORKER: &str = "cluster:join_worker";
pub const TYPE_SWARM_INIT: &str = "cluster:swarm_init";
pub const TYPE_SWARM_JOIN: &str = "cluster:swarm_join";
pub const TYPE_MANUAL_SETUP: &str = "cluster:manual_setup";
pub const TYPE_DEPLOY_APP: &str = "app:deploy";
pub const TYPE_PUSH_ENV: &str = "env:push";
pub const TYPE_NGINX_PROVISION: &str = "server:nginx_provision";

#[derive(Debug, Serialize, Deserialize)]
pub struct PreflightPayload {
    pub server_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstallK3sPayload {
    pub server_id: i64,
    /// "server" or "agent"
    pub role: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub server_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterServerPayload {
    pub cluster_id: i64,
    pub server_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ManualClusterPayload {
    pub cluster_id: i64,
    pub manager_server_id: i64,
    pub worker_server_ids: Vec<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeployAppPayload {
    pub app_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PushEnvPayload {
    pub environment_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NginxProvisionPayload {
    pub nginx_config_id: i64,
}

pub fn preflight_check_task(server_id: i64) -> TaskMessage {
    TaskMessage::new(TYPE_PREFLIGHT_CHECK, json!({ "server_id": server_id }))
        .queue(QUEUE_PROVISIONING)
        .max_retry(3)
}

pub fn install_k3s_task(server_id: i64, role: &str, token: &str, server_url: &str) -> TaskMessage {
    TaskMessage::new(
        TYPE_INSTALL_K3S,
        json!({
            "server_id": server_id,
            "role": role,
            "token": token,
            "server_url": server_url,
        }),
    )
    .queue(QUEUE_PROVISIONING)
    .max_retry(2)
}

pub fn designate_manager_task(cluster_id: i64, server_id: i64) -> TaskMessage {
    TaskMessage::new(
        TYPE_DESIGNATE_MANAGER,
        json!({ "cluster_id": cluster_id, "server_id": server_id }),
    )
    .queue(QUEUE_PROVISIONING)
    .max_retry(2)
}

pub fn join_worker_task(cluster_id: i64, server_id: i64) -> TaskMessage {
    TaskMessage::new(
        TYPE_JOIN_WORKER,
        json!({ "cluster_id": cluster_id, "server_id": server_id }),
    )
    .queue(QUEUE_PROVISIONING)
    .max_retry(2)
}

pub fn swarm_init_task(cluster_id: i64, server_id: i64) -> TaskMessage {
    TaskMessage::new(
        TYPE_SWARM_INIT,
        json!({ "cluster_id": cluster_id, "server_id": server_id }),
    )
    .queue(QUEUE_PROVISIONING)
    .max_retry(2)
}

pub fn swarm_join_task(cluster_id: i64, server_id: i64) -> TaskMessage {
    TaskMessage::new(
        TYPE_SWARM_JOIN,
        json!({ "cluster_id": cluster_id, "server_id": server_id }),
    )
    .queue(QUEUE_PROVISIONING)
    .max_retry(3)
}

pub fn manual_setup_task(cluster_id: i64, manager_id: i64, worker_ids: &[i64]) -> TaskMessage {
    TaskMessage::new(
        TYPE_MANUAL_SETUP,
        json!({
            "cluster_id": cluster_id,
            "manager_server_id": manager_id,
            "worker_server_ids": worker_ids,
        }),
    )
    .queue(QUEUE_PROVISIONING)
    .max_retry(2)
}

pub fn deploy_app_task(app_id: i64) -> TaskMessage {
    TaskMessage::new(TYPE_DEPLOY_APP, json!({ "app_id": app_id }))
        .queue(QUEUE_DEPLOYMENT)
        .max_retry(2)
}

pub fn push_env_task(environment_id: i64) -> TaskMessage {
    TaskMessage::new(TYPE_PUSH_ENV, json!({ "environment_id": environment_id }))
        .queue(QUEUE_PROVISIONING)
        .max_retry(2)
}

pub fn nginx_provision_task(nginx_config_id: i64) -> TaskMessage {
    TaskMessage::new(
        TYPE_NGINX_PROVISION,
        json!({ "nginx_config_id": nginx_config_id }),
    )
    .queue(QUEUE_PROVISIONING)
    .max_retry(2)
}
