use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Server lifecycle status
///
/// Progress through states: Pending → Preflight → Ready
///
/// - `Pending`: registered, nothing verified yet
/// - `Preflight`: inspection in progress
/// - `Ready`: inspection passed, eligible for cluster assignment
/// - `Error`: inspection or provisioning failed (see `error_message`)
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Pending,
    Preflight,
    Ready,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Pending => "pending",
            ServerStatus::Preflight => "preflight",
            ServerStatus::Ready => "ready",
            ServerStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ServerStatus::Pending),
            "preflight" => Some(ServerStatus::Preflight),
            "ready" => Some(ServerStatus::Ready),
            "error" => Some(ServerStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role a server plays inside its cluster. `None` iff the server is
/// unassigned.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    None,
    Manager,
    Worker,
}

impl ServerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRole::None => "none",
            ServerRole::Manager => "manager",
            ServerRole::Worker => "worker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ServerRole::None),
            "manager" => Some(ServerRole::Manager),
            "worker" => Some(ServerRole::Worker),
            _ => None,
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A registered physical server.
///
/// The private key is stored encrypted; plaintext key bytes never hit the
/// database.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Server {
    pub id: i64,
    pub hostname: Option<String>,
    /// Network address; unique across the inventory.
    pub address: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    #[serde(skip_serializing)]
    pub ssh_key_encrypted: Vec<u8>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub cpu_cores: Option<i32>,
    pub ram_bytes: Option<i64>,
    pub disk_info: Option<String>,
    pub status: ServerStatus,
    pub role: ServerRole,
    /// Serialized JSON of the last inspection report.
    pub preflight_report: Option<String>,
    pub cluster_id: Option<i64>,
    pub team_id: Option<i64>,
    pub created_by_user_id: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a new server.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub hostname: Option<String>,
    pub address: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_key_encrypted: Vec<u8>,
    pub team_id: Option<i64>,
    pub created_by_user_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Pending,
    Provisioning,
    Active,
    Degraded,
    Error,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Pending => "pending",
            ClusterStatus::Provisioning => "provisioning",
            ClusterStatus::Active => "active",
            ClusterStatus::Degraded => "degraded",
            ClusterStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ClusterStatus::Pending),
            "provisioning" => Some(ClusterStatus::Provisioning),
            "active" => Some(ClusterStatus::Active),
            "degraded" => Some(ClusterStatus::Degraded),
            "error" => Some(ClusterStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which orchestrator runs on the cluster's nodes.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    K8s,
    Swarm,
    Manual,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::K8s => "k8s",
            ClusterType::Swarm => "swarm",
            ClusterType::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "k8s" => Some(ClusterType::K8s),
            "swarm" => Some(ClusterType::Swarm),
            "manual" => Some(ClusterType::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A group of servers running one orchestrator.
///
/// Exactly one manager. Workers may only join once the join token for the
/// cluster type is non-empty (`node_token` for k8s, `swarm_join_token` for
/// swarm).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Cluster {
    pub id: i64,
    pub name: String,
    pub cluster_type: ClusterType,
    pub manager_server_id: i64,
    #[serde(skip_serializing)]
    pub kubeconfig_encrypted: Vec<u8>,
    #[serde(skip_serializing)]
    pub node_token: String,
    #[serde(skip_serializing)]
    pub swarm_join_token: String,
    pub cni_plugin: Option<String>,
    pub domain: Option<String>,
    pub status: ClusterStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// The worker-join secret for this cluster's type, if produced yet.
    pub fn join_token(&self) -> &str {
        match self.cluster_type {
            ClusterType::K8s => &self.node_token,
            ClusterType::Swarm => &self.swarm_join_token,
            ClusterType::Manual => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCluster {
    pub name: String,
    pub cluster_type: ClusterType,
    pub manager_server_id: i64,
    pub cni_plugin: Option<String>,
    pub domain: Option<String>,
}

/// How an application's source is obtained.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Git,
    Manual,
    DockerImage,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Git => "git",
            SourceType::Manual => "manual",
            SourceType::DockerImage => "docker_image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "git" => Some(SourceType::Git),
            "manual" => Some(SourceType::Manual),
            "docker_image" => Some(SourceType::DockerImage),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Pending,
    Building,
    Deploying,
    Running,
    Failed,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Pending => "pending",
            AppStatus::Building => "building",
            AppStatus::Deploying => "deploying",
            AppStatus::Running => "running",
            AppStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AppStatus::Pending),
            "building" => Some(AppStatus::Building),
            "deploying" => Some(AppStatus::Deploying),
            "running" => Some(AppStatus::Running),
            "failed" => Some(AppStatus::Failed),
            _ => None,
        }
    }
}

/// Environment variable maps keyed by scope.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ScopedEnvs {
    #[serde(default)]
    pub production: HashMap<String, String>,
    #[serde(default)]
    pub preview: HashMap<String, String>,
}

/// A deployable workload bound to a cluster.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub cluster_id: i64,
    pub namespace: String,
    pub source_type: SourceType,
    pub repo_url: Option<String>,
    pub branch: String,
    pub docker_image: Option<String>,
    pub manual_path: Option<String>,
    /// Buildpack tag: node, go, python, rust, nextjs-static, or docker.
    pub build_type: String,
    pub build_cmd: Option<String>,
    pub start_cmd: Option<String>,
    pub port: u16,
    pub env_vars: ScopedEnvs,
    pub replicas: u32,
    pub status: AppStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Deploying,
    Live,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Live => "live",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeploymentStatus::Pending),
            "building" => Some(DeploymentStatus::Building),
            "deploying" => Some(DeploymentStatus::Deploying),
            "live" => Some(DeploymentStatus::Live),
            "failed" => Some(DeploymentStatus::Failed),
            "rolled_back" => Some(DeploymentStatus::RolledBack),
            _ => None,
        }
    }
}

/// One attempt to realize an application at a point in time.
///
/// Versions are `v1`, `v2`, … and strictly increase per application.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Deployment {
    pub id: i64,
    pub application_id: i64,
    pub version: String,
    pub image_tag: Option<String>,
    pub status: DeploymentStatus,
    pub logs: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvScope {
    Production,
    Preview,
    Staging,
}

impl EnvScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvScope::Production => "production",
            EnvScope::Preview => "preview",
            EnvScope::Staging => "staging",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "production" => Some(EnvScope::Production),
            "preview" => Some(EnvScope::Preview),
            "staging" => Some(EnvScope::Staging),
            _ => None,
        }
    }
}

/// A named variable set scoped to a cluster.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Environment {
    pub id: i64,
    pub cluster_id: i64,
    pub scope: EnvScope,
    pub name: String,
    pub variables: HashMap<String, String>,
    /// Whether the variables have been materialized on the cluster's nodes.
    pub synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A reverse-proxy directive bound to a server.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NginxConfig {
    pub id: i64,
    pub server_id: i64,
    pub domain: String,
    pub upstream_port: u16,
    pub ssl_enabled: bool,
    pub lets_encrypt: bool,
    pub custom_config: Option<String>,
    pub application_id: Option<i64>,
    /// pending, active, error
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    ServerRegistered,
    ClusterCreated,
    ClusterProvisioned,
    AppDeployed,
    DeploymentFailed,
    EnvPushed,
    NginxProvisioned,
    UserLogin,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::ServerRegistered => "server_registered",
            ActivityType::ClusterCreated => "cluster_created",
            ActivityType::ClusterProvisioned => "cluster_provisioned",
            ActivityType::AppDeployed => "app_deployed",
            ActivityType::DeploymentFailed => "deployment_failed",
            ActivityType::EnvPushed => "env_pushed",
            ActivityType::NginxProvisioned => "nginx_provisioned",
            ActivityType::UserLogin => "user_login",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "server_registered" => Some(ActivityType::ServerRegistered),
            "cluster_created" => Some(ActivityType::ClusterCreated),
            "cluster_provisioned" => Some(ActivityType::ClusterProvisioned),
            "app_deployed" => Some(ActivityType::AppDeployed),
            "deployment_failed" => Some(ActivityType::DeploymentFailed),
            "env_pushed" => Some(ActivityType::EnvPushed),
            "nginx_provisioned" => Some(ActivityType::NginxProvisioned),
            "user_login" => Some(ActivityType::UserLogin),
            _ => None,
        }
    }
}

/// Append-only audit entry.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Activity {
    pub id: i64,
    pub activity_type: ActivityType,
    pub message: String,
    /// server, cluster, application, deployment, environment, nginx_config
    pub entity: String,
    pub entity_id: i64,
    pub user_id: Option<i64>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub activity_type: ActivityType,
    pub message: String,
    pub entity: String,
    pub entity_id: i64,
    pub user_id: Option<i64>,
    pub metadata: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for s in ["pending", "preflight", "ready", "error"] {
            assert_eq!(ServerStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["pending", "provisioning", "active", "degraded", "error"] {
            assert_eq!(ClusterStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["pending", "building", "deploying", "live", "failed", "rolled_back"] {
            assert_eq!(DeploymentStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(ServerStatus::parse("bogus").is_none());
    }

    #[test]
    fn test_join_token_by_cluster_type() {
        let mut cluster = Cluster {
            id: 1,
            name: "prod".to_string(),
            cluster_type: ClusterType::K8s,
            manager_server_id: 1,
            kubeconfig_encrypted: Vec::new(),
            node_token: "k3s-token".to_string(),
            swarm_join_token: "swarm-token".to_string(),
            cni_plugin: Some("flannel".to_string()),
            domain: None,
            status: ClusterStatus::Active,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(cluster.join_token(), "k3s-token");
        cluster.cluster_type = ClusterType::Swarm;
        assert_eq!(cluster.join_token(), "swarm-token");
        cluster.cluster_type = ClusterType::Manual;
        assert_eq!(cluster.join_token(), "");
    }

    #[test]
    fn test_scoped_envs_deserialize_partial() {
        let envs: ScopedEnvs = serde_json::from_str(r#"{"production":{"A":"1"}}"#).unwrap();
        assert_eq!(envs.production.get("A").map(String::as_str), Some("1"));
        assert!(envs.preview.is_empty());
    }

    #[test]
    fn test_server_status_serde_lowercase() {
        let json = serde_json::to_string(&ServerStatus::Ready).unwrap();
        assert_eq!(json, "\"ready\"");
    }
}
