//! In-memory store for tests.
//!
//! Mirrors the PostgreSQL semantics that matter to the engine: unique
//! server addresses and cluster names, append-only deployments, row-scoped
//! updates.

use crate::{Result, Store, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use orchestra_common::models::*;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    servers: Vec<Server>,
    clusters: Vec<Cluster>,
    applications: Vec<Application>,
    deployments: Vec<Deployment>,
    environments: Vec<Environment>,
    nginx_configs: Vec<NginxConfig>,
    activities: Vec<Activity>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an application directly; tests use this instead of the
    /// out-of-scope application CRUD API.
    pub fn seed_application(&self, mut app: Application) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        app.id = inner.next_id();
        let id = app.id;
        inner.applications.push(app);
        id
    }

    pub fn seed_environment(&self, mut env: Environment) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        env.id = inner.next_id();
        let id = env.id;
        inner.environments.push(env);
        id
    }

    pub fn seed_nginx_config(&self, mut cfg: NginxConfig) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        cfg.id = inner.next_id();
        let id = cfg.id;
        inner.nginx_configs.push(cfg);
        id
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_server(&self, server: NewServer) -> Result<Server> {
        let mut inner = self.inner.lock().unwrap();
        if inner.servers.iter().any(|s| s.address == server.address) {
            return Err(StoreError::Conflict(format!(
                "server address '{}' already registered",
                server.address
            )));
        }

        let now = Utc::now();
        let record = Server {
            id: inner.next_id(),
            hostname: server.hostname,
            address: server.address,
            ssh_port: server.ssh_port,
            ssh_user: server.ssh_user,
            ssh_key_encrypted: server.ssh_key_encrypted,
            os: None,
            arch: None,
            cpu_cores: None,
            ram_bytes: None,
            disk_info: None,
            status: ServerStatus::Pending,
            role: ServerRole::None,
            preflight_report: None,
            cluster_id: None,
            team_id: server.team_id,
            created_by_user_id: server.created_by_user_id,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        inner.servers.push(record.clone());
        Ok(record)
    }

    async fn get_server(&self, id: i64) -> Result<Option<Server>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.servers.iter().find(|s| s.id == id).cloned())
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.servers.clone())
    }

    async fn servers_in_cluster(&self, cluster_id: i64) -> Result<Vec<Server>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .servers
            .iter()
            .filter(|s| s.cluster_id == Some(cluster_id))
            .cloned()
            .collect())
    }

    async fn update_server_status(&self, id: i64, status: ServerStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(server) = inner.servers.iter_mut().find(|s| s.id == id) {
            server.status = status;
            server.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_server_error(&self, id: i64, message: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(server) = inner.servers.iter_mut().find(|s| s.id == id) {
            server.status = ServerStatus::Error;
            server.error_message = Some(message.to_string());
            server.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_inspection(
        &self,
        id: i64,
        status: ServerStatus,
        os: &str,
        arch: &str,
        cpu_cores: i32,
        ram_bytes: i64,
        report_json: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(server) = inner.servers.iter_mut().find(|s| s.id == id) {
            server.status = status;
            server.os = Some(os.to_string());
            server.arch = Some(arch.to_string());
            server.cpu_cores = Some(cpu_cores);
            server.ram_bytes = Some(ram_bytes);
            server.preflight_report = Some(report_json.to_string());
            server.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn assign_server_role(&self, id: i64, role: ServerRole, cluster_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(server) = inner.servers.iter_mut().find(|s| s.id == id) {
            server.role = role;
            server.cluster_id = Some(cluster_id);
            server.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_server_role(&self, id: i64, role: ServerRole) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(server) = inner.servers.iter_mut().find(|s| s.id == id) {
            server.role = role;
            server.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_cluster(&self, cluster: NewCluster) -> Result<Cluster> {
        let mut inner = self.inner.lock().unwrap();
        if inner.clusters.iter().any(|c| c.name == cluster.name) {
            return Err(StoreError::Conflict(format!(
                "cluster name '{}' already exists",
                cluster.name
            )));
        }

        let now = Utc::now();
        let record = Cluster {
            id: inner.next_id(),
            name: cluster.name,
            cluster_type: cluster.cluster_type,
            manager_server_id: cluster.manager_server_id,
            kubeconfig_encrypted: Vec::new(),
            node_token: String::new(),
            swarm_join_token: String::new(),
            cni_plugin: cluster.cni_plugin,
            domain: cluster.domain,
            status: ClusterStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        inner.clusters.push(record.clone());
        Ok(record)
    }

    async fn get_cluster(&self, id: i64) -> Result<Option<Cluster>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.clusters.iter().find(|c| c.id == id).cloned())
    }

    async fn update_cluster_status(&self, id: i64, status: ClusterStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cluster) = inner.clusters.iter_mut().find(|c| c.id == id) {
            cluster.status = status;
            cluster.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_cluster_error(&self, id: i64, message: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cluster) = inner.clusters.iter_mut().find(|c| c.id == id) {
            cluster.status = ClusterStatus::Error;
            cluster.error_message = Some(message.to_string());
            cluster.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn store_kube_artifacts(
        &self,
        id: i64,
        kubeconfig_encrypted: &[u8],
        node_token: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cluster) = inner.clusters.iter_mut().find(|c| c.id == id) {
            cluster.kubeconfig_encrypted = kubeconfig_encrypted.to_vec();
            cluster.node_token = node_token.to_string();
            cluster.status = ClusterStatus::Active;
            cluster.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn store_swarm_token(&self, id: i64, token: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cluster) = inner.clusters.iter_mut().find(|c| c.id == id) {
            cluster.swarm_join_token = token.to_string();
            cluster.status = ClusterStatus::Active;
            cluster.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_application(&self, id: i64) -> Result<Option<Application>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.applications.iter().find(|a| a.id == id).cloned())
    }

    async fn update_application_status(&self, id: i64, status: AppStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(app) = inner.applications.iter_mut().find(|a| a.id == id) {
            app.status = status;
            app.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn insert_deployment(
        &self,
        application_id: i64,
        version: &str,
        status: DeploymentStatus,
    ) -> Result<Deployment> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let record = Deployment {
            id: inner.next_id(),
            application_id,
            version: version.to_string(),
            image_tag: None,
            status,
            logs: String::new(),
            created_at: now,
            updated_at: now,
        };
        inner.deployments.push(record.clone());
        Ok(record)
    }

    async fn count_deployments(&self, application_id: i64) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .deployments
            .iter()
            .filter(|d| d.application_id == application_id)
            .count() as i64)
    }

    async fn update_deployment_status(&self, id: i64, status: DeploymentStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(dep) = inner.deployments.iter_mut().find(|d| d.id == id) {
            dep.status = status;
            dep.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_deployment_live(&self, id: i64, image_tag: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(dep) = inner.deployments.iter_mut().find(|d| d.id == id) {
            dep.status = DeploymentStatus::Live;
            dep.image_tag = Some(image_tag.to_string());
            dep.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn append_deployment_log(&self, id: i64, line: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(dep) = inner.deployments.iter_mut().find(|d| d.id == id) {
            dep.logs.push_str(line);
            dep.logs.push('\n');
            dep.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn deployments_for_application(&self, application_id: i64) -> Result<Vec<Deployment>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .deployments
            .iter()
            .filter(|d| d.application_id == application_id)
            .cloned()
            .collect())
    }

    async fn get_environment(&self, id: i64) -> Result<Option<Environment>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.environments.iter().find(|e| e.id == id).cloned())
    }

    async fn mark_environment_synced(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(env) = inner.environments.iter_mut().find(|e| e.id == id) {
            env.synced = true;
            env.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_nginx_config(&self, id: i64) -> Result<Option<NginxConfig>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.nginx_configs.iter().find(|c| c.id == id).cloned())
    }

    async fn update_nginx_status(&self, id: i64, status: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cfg) = inner.nginx_configs.iter_mut().find(|c| c.id == id) {
            cfg.status = status.to_string();
            cfg.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_activity(&self, activity: NewActivity) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = Activity {
            id: inner.next_id(),
            activity_type: activity.activity_type,
            message: activity.message,
            entity: activity.entity,
            entity_id: activity.entity_id,
            user_id: activity.user_id,
            metadata: activity.metadata,
            created_at: Utc::now(),
        };
        inner.activities.push(record);
        Ok(())
    }

    async fn recent_activities(&self, limit: i64) -> Result<Vec<Activity>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .activities
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
