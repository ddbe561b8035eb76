//! State store: durable persistence of entities and their state fields.
//!
//! The `Store` trait abstracts the backend. `PgStore` is the production
//! implementation (PostgreSQL via sqlx); `MemoryStore` backs tests.
//! A successful write is durable before the call returns.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use orchestra_common::models::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Row-scoped persistence operations used by the task engine.
#[async_trait]
pub trait Store: Send + Sync {
    // Servers
    async fn insert_server(&self, server: NewServer) -> Result<Server>;
    async fn get_server(&self, id: i64) -> Result<Option<Server>>;
    async fn list_servers(&self) -> Result<Vec<Server>>;
    async fn servers_in_cluster(&self, cluster_id: i64) -> Result<Vec<Server>>;
    async fn update_server_status(&self, id: i64, status: ServerStatus) -> Result<()>;
    async fn set_server_error(&self, id: i64, message: &str) -> Result<()>;
    /// Persist inspection results: derived hardware fields plus the full
    /// JSON report, and the resulting status in one write.
    async fn record_inspection(
        &self,
        id: i64,
        status: ServerStatus,
        os: &str,
        arch: &str,
        cpu_cores: i32,
        ram_bytes: i64,
        report_json: &str,
    ) -> Result<()>;
    async fn assign_server_role(&self, id: i64, role: ServerRole, cluster_id: i64) -> Result<()>;
    /// Role change without touching the cluster reference; used by the
    /// low-level install task whose payload carries no cluster.
    async fn update_server_role(&self, id: i64, role: ServerRole) -> Result<()>;

    // Clusters
    async fn insert_cluster(&self, cluster: NewCluster) -> Result<Cluster>;
    async fn get_cluster(&self, id: i64) -> Result<Option<Cluster>>;
    async fn update_cluster_status(&self, id: i64, status: ClusterStatus) -> Result<()>;
    async fn set_cluster_error(&self, id: i64, message: &str) -> Result<()>;
    /// Persist the k8s artifacts produced by the manager task and mark the
    /// cluster active in one write.
    async fn store_kube_artifacts(
        &self,
        id: i64,
        kubeconfig_encrypted: &[u8],
        node_token: &str,
    ) -> Result<()>;
    /// Persist the swarm join token and mark the cluster active.
    async fn store_swarm_token(&self, id: i64, token: &str) -> Result<()>;

    // Applications
    async fn get_application(&self, id: i64) -> Result<Option<Application>>;
    async fn update_application_status(&self, id: i64, status: AppStatus) -> Result<()>;

    // Deployments
    async fn insert_deployment(
        &self,
        application_id: i64,
        version: &str,
        status: DeploymentStatus,
    ) -> Result<Deployment>;
    async fn count_deployments(&self, application_id: i64) -> Result<i64>;
    async fn update_deployment_status(&self, id: i64, status: DeploymentStatus) -> Result<()>;
    async fn mark_deployment_live(&self, id: i64, image_tag: &str) -> Result<()>;
    /// Atomic read-modify-write append:
    /// `logs := coalesce(logs,'') || line || '\n'`.
    async fn append_deployment_log(&self, id: i64, line: &str) -> Result<()>;
    async fn deployments_for_application(&self, application_id: i64) -> Result<Vec<Deployment>>;

    // Environments
    async fn get_environment(&self, id: i64) -> Result<Option<Environment>>;
    async fn mark_environment_synced(&self, id: i64) -> Result<()>;

    // Nginx configs
    async fn get_nginx_config(&self, id: i64) -> Result<Option<NginxConfig>>;
    async fn update_nginx_status(&self, id: i64, status: &str) -> Result<()>;

    // Activity log
    async fn record_activity(&self, activity: NewActivity) -> Result<()>;
    async fn recent_activities(&self, limit: i64) -> Result<Vec<Activity>>;
}
