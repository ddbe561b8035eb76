//! PostgreSQL store.
//!
//! Hand-written SQL throughout; every mutation is a row-scoped UPDATE so
//! concurrent workers never clobber more than the columns they own.

use crate::{Result, Store, StoreError};
use async_trait::async_trait;
use orchestra_common::models::*;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

const CONNECT_ATTEMPTS: u32 = 15;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(3);

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with retries (the database may still be starting), then run
    /// the ordered migration.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let mut last_err = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    info!("Connected to PostgreSQL database");
                    let store = Self { pool };
                    store.migrate().await?;
                    return Ok(store);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max = CONNECT_ATTEMPTS,
                        "Database connection failed: {}",
                        e
                    );
                    last_err = Some(e);
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
        Err(StoreError::Database(last_err.expect("at least one attempt")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run schema migration in dependency order. FKs for the cluster↔server
    /// cycle are not declared; the entity layer stores ids and resolves on
    /// read. The column-type fixes are idempotent (jsonb → text for rows
    /// written by earlier releases).
    async fn migrate(&self) -> Result<()> {
        for statement in migration_statements() {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        for fix in COLUMN_FIXES {
            if let Err(e) = sqlx::query(fix).execute(&self.pool).await {
                warn!("Column fix warning: {}", e);
            }
        }

        info!("Database migrations completed");
        Ok(())
    }
}

/// CREATE TABLE statements in topological order:
/// users → server-teams → servers → memberships → clusters → applications →
/// app-memberships → deployments → activities → environments → nginx-configs.
fn migration_statements() -> &'static [&'static str] {
    &[
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BIGSERIAL PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT,
            password_hash TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS server_teams (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS servers (
            id BIGSERIAL PRIMARY KEY,
            hostname TEXT,
            address TEXT NOT NULL UNIQUE,
            ssh_port INTEGER NOT NULL DEFAULT 22,
            ssh_user TEXT NOT NULL,
            ssh_key_encrypted BYTEA NOT NULL,
            os TEXT,
            arch TEXT,
            cpu_cores INTEGER,
            ram_bytes BIGINT,
            disk_info TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            role TEXT NOT NULL DEFAULT 'none',
            preflight_report TEXT,
            cluster_id BIGINT,
            team_id BIGINT REFERENCES server_teams(id),
            created_by_user_id BIGINT REFERENCES users(id),
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS server_memberships (
            id BIGSERIAL PRIMARY KEY,
            user_id BIGINT NOT NULL REFERENCES users(id),
            team_id BIGINT NOT NULL REFERENCES server_teams(id),
            role TEXT NOT NULL DEFAULT 'viewer',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (user_id, team_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS clusters (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            cluster_type TEXT NOT NULL DEFAULT 'k8s',
            manager_server_id BIGINT NOT NULL,
            kubeconfig_encrypted BYTEA NOT NULL DEFAULT '\x'::bytea,
            node_token TEXT NOT NULL DEFAULT '',
            swarm_join_token TEXT NOT NULL DEFAULT '',
            cni_plugin TEXT,
            domain TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS applications (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            cluster_id BIGINT NOT NULL REFERENCES clusters(id),
            namespace TEXT NOT NULL DEFAULT 'default',
            source_type TEXT NOT NULL DEFAULT 'git',
            repo_url TEXT,
            branch TEXT NOT NULL DEFAULT 'main',
            docker_image TEXT,
            manual_path TEXT,
            build_type TEXT NOT NULL DEFAULT 'docker',
            build_cmd TEXT,
            start_cmd TEXT,
            port INTEGER NOT NULL DEFAULT 0,
            env_vars TEXT NOT NULL DEFAULT '{}',
            replicas INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS application_memberships (
            id BIGSERIAL PRIMARY KEY,
            user_id BIGINT NOT NULL REFERENCES users(id),
            application_id BIGINT NOT NULL REFERENCES applications(id),
            role TEXT NOT NULL DEFAULT 'viewer',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE (user_id, application_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS deployments (
            id BIGSERIAL PRIMARY KEY,
            application_id BIGINT NOT NULL REFERENCES applications(id),
            version TEXT NOT NULL,
            image_tag TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            logs TEXT NOT NULL DEFAULT '',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS activities (
            id BIGSERIAL PRIMARY KEY,
            activity_type TEXT NOT NULL,
            message TEXT NOT NULL,
            entity TEXT NOT NULL,
            entity_id BIGINT NOT NULL,
            user_id BIGINT,
            metadata TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS environments (
            id BIGSERIAL PRIMARY KEY,
            cluster_id BIGINT NOT NULL REFERENCES clusters(id),
            scope TEXT NOT NULL DEFAULT 'production',
            name TEXT NOT NULL,
            variables TEXT NOT NULL DEFAULT '{}',
            synced BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS nginx_configs (
            id BIGSERIAL PRIMARY KEY,
            server_id BIGINT NOT NULL REFERENCES servers(id),
            domain TEXT NOT NULL,
            upstream_port INTEGER NOT NULL,
            ssl_enabled BOOLEAN NOT NULL DEFAULT FALSE,
            lets_encrypt BOOLEAN NOT NULL DEFAULT FALSE,
            custom_config TEXT,
            application_id BIGINT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ]
}

/// Idempotent jsonb → text migrations for columns written by earlier
/// releases. A no-op when the column is already text.
const COLUMN_FIXES: [&str; 2] = [
    r#"DO $$ BEGIN ALTER TABLE servers ALTER COLUMN preflight_report TYPE text USING preflight_report::text; EXCEPTION WHEN undefined_table THEN NULL; END $$;"#,
    r#"DO $$ BEGIN ALTER TABLE activities ALTER COLUMN metadata TYPE text USING metadata::text; EXCEPTION WHEN undefined_table THEN NULL; END $$;"#,
];

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn parse_server_status(s: &str) -> Result<ServerStatus> {
    ServerStatus::parse(s).ok_or_else(|| StoreError::Corrupt(format!("server status '{}'", s)))
}

fn parse_server_role(s: &str) -> Result<ServerRole> {
    ServerRole::parse(s).ok_or_else(|| StoreError::Corrupt(format!("server role '{}'", s)))
}

fn parse_cluster_status(s: &str) -> Result<ClusterStatus> {
    ClusterStatus::parse(s).ok_or_else(|| StoreError::Corrupt(format!("cluster status '{}'", s)))
}

fn parse_cluster_type(s: &str) -> Result<ClusterType> {
    ClusterType::parse(s).ok_or_else(|| StoreError::Corrupt(format!("cluster type '{}'", s)))
}

fn map_server_row(row: &PgRow) -> Result<Server> {
    let status: String = row.try_get("status")?;
    let role: String = row.try_get("role")?;
    let ssh_port: i32 = row.try_get("ssh_port")?;

    Ok(Server {
        id: row.try_get("id")?,
        hostname: row.try_get("hostname")?,
        address: row.try_get("address")?,
        ssh_port: ssh_port as u16,
        ssh_user: row.try_get("ssh_user")?,
        ssh_key_encrypted: row.try_get("ssh_key_encrypted")?,
        os: row.try_get("os")?,
        arch: row.try_get("arch")?,
        cpu_cores: row.try_get("cpu_cores")?,
        ram_bytes: row.try_get("ram_bytes")?,
        disk_info: row.try_get("disk_info")?,
        status: parse_server_status(&status)?,
        role: parse_server_role(&role)?,
        preflight_report: row.try_get("preflight_report")?,
        cluster_id: row.try_get("cluster_id")?,
        team_id: row.try_get("team_id")?,
        created_by_user_id: row.try_get("created_by_user_id")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_cluster_row(row: &PgRow) -> Result<Cluster> {
    let status: String = row.try_get("status")?;
    let cluster_type: String = row.try_get("cluster_type")?;

    Ok(Cluster {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        cluster_type: parse_cluster_type(&cluster_type)?,
        manager_server_id: row.try_get("manager_server_id")?,
        kubeconfig_encrypted: row.try_get("kubeconfig_encrypted")?,
        node_token: row.try_get("node_token")?,
        swarm_join_token: row.try_get("swarm_join_token")?,
        cni_plugin: row.try_get("cni_plugin")?,
        domain: row.try_get("domain")?,
        status: parse_cluster_status(&status)?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_application_row(row: &PgRow) -> Result<Application> {
    let source_type: String = row.try_get("source_type")?;
    let status: String = row.try_get("status")?;
    let env_vars: String = row.try_get("env_vars")?;
    let port: i32 = row.try_get("port")?;
    let replicas: i32 = row.try_get("replicas")?;

    Ok(Application {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        cluster_id: row.try_get("cluster_id")?,
        namespace: row.try_get("namespace")?,
        source_type: SourceType::parse(&source_type)
            .ok_or_else(|| StoreError::Corrupt(format!("source type '{}'", source_type)))?,
        repo_url: row.try_get("repo_url")?,
        branch: row.try_get("branch")?,
        docker_image: row.try_get("docker_image")?,
        manual_path: row.try_get("manual_path")?,
        build_type: row.try_get("build_type")?,
        build_cmd: row.try_get("build_cmd")?,
        start_cmd: row.try_get("start_cmd")?,
        port: port as u16,
        env_vars: serde_json::from_str(&env_vars)
            .map_err(|e| StoreError::Corrupt(format!("env_vars: {}", e)))?,
        replicas: replicas as u32,
        status: AppStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("app status '{}'", status)))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_deployment_row(row: &PgRow) -> Result<Deployment> {
    let status: String = row.try_get("status")?;

    Ok(Deployment {
        id: row.try_get("id")?,
        application_id: row.try_get("application_id")?,
        version: row.try_get("version")?,
        image_tag: row.try_get("image_tag")?,
        status: DeploymentStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("deployment status '{}'", status)))?,
        logs: row.try_get("logs")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_environment_row(row: &PgRow) -> Result<Environment> {
    let scope: String = row.try_get("scope")?;
    let variables: String = row.try_get("variables")?;

    Ok(Environment {
        id: row.try_get("id")?,
        cluster_id: row.try_get("cluster_id")?,
        scope: EnvScope::parse(&scope)
            .ok_or_else(|| StoreError::Corrupt(format!("env scope '{}'", scope)))?,
        name: row.try_get("name")?,
        variables: serde_json::from_str::<HashMap<String, String>>(&variables)
            .map_err(|e| StoreError::Corrupt(format!("variables: {}", e)))?,
        synced: row.try_get("synced")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_nginx_row(row: &PgRow) -> Result<NginxConfig> {
    let upstream_port: i32 = row.try_get("upstream_port")?;

    Ok(NginxConfig {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        domain: row.try_get("domain")?,
        upstream_port: upstream_port as u16,
        ssl_enabled: row.try_get("ssl_enabled")?,
        lets_encrypt: row.try_get("lets_encrypt")?,
        custom_config: row.try_get("custom_config")?,
        application_id: row.try_get("application_id")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const SERVER_COLUMNS: &str = "id, hostname, address, ssh_port, ssh_user, ssh_key_encrypted, os, arch, \
     cpu_cores, ram_bytes, disk_info, status, role, preflight_report, cluster_id, \
     team_id, created_by_user_id, error_message, created_at, updated_at";

const CLUSTER_COLUMNS: &str = "id, name, cluster_type, manager_server_id, kubeconfig_encrypted, node_token, \
     swarm_join_token, cni_plugin, domain, status, error_message, created_at, updated_at";

#[async_trait]
impl Store for PgStore {
    async fn insert_server(&self, server: NewServer) -> Result<Server> {
        let row = sqlx::query(&format!(
            "INSERT INTO servers (hostname, address, ssh_port, ssh_user, ssh_key_encrypted, team_id, created_by_user_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {SERVER_COLUMNS}"
        ))
        .bind(&server.hostname)
        .bind(&server.address)
        .bind(server.ssh_port as i32)
        .bind(&server.ssh_user)
        .bind(&server.ssh_key_encrypted)
        .bind(server.team_id)
        .bind(server.created_by_user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!("server address '{}' already registered", server.address))
            } else {
                StoreError::Database(e)
            }
        })?;

        map_server_row(&row)
    }

    async fn get_server(&self, id: i64) -> Result<Option<Server>> {
        let row = sqlx::query(&format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_server_row).transpose()
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        let rows = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_server_row).collect()
    }

    async fn servers_in_cluster(&self, cluster_id: i64) -> Result<Vec<Server>> {
        let rows = sqlx::query(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE cluster_id = $1 ORDER BY id"
        ))
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_server_row).collect()
    }

    async fn update_server_status(&self, id: i64, status: ServerStatus) -> Result<()> {
        sqlx::query("UPDATE servers SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_server_error(&self, id: i64, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE servers SET status = 'error', error_message = $1, updated_at = now() WHERE id = $2",
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;
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
        sqlx::query(
            "UPDATE servers SET status = $1, os = $2, arch = $3, cpu_cores = $4, \
             ram_bytes = $5, preflight_report = $6, updated_at = now() WHERE id = $7",
        )
        .bind(status.as_str())
        .bind(os)
        .bind(arch)
        .bind(cpu_cores)
        .bind(ram_bytes)
        .bind(report_json)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn assign_server_role(&self, id: i64, role: ServerRole, cluster_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE servers SET role = $1, cluster_id = $2, updated_at = now() WHERE id = $3",
        )
        .bind(role.as_str())
        .bind(cluster_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_server_role(&self, id: i64, role: ServerRole) -> Result<()> {
        sqlx::query("UPDATE servers SET role = $1, updated_at = now() WHERE id = $2")
            .bind(role.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_cluster(&self, cluster: NewCluster) -> Result<Cluster> {
        let row = sqlx::query(&format!(
            "INSERT INTO clusters (name, cluster_type, manager_server_id, cni_plugin, domain) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {CLUSTER_COLUMNS}"
        ))
        .bind(&cluster.name)
        .bind(cluster.cluster_type.as_str())
        .bind(cluster.manager_server_id)
        .bind(&cluster.cni_plugin)
        .bind(&cluster.domain)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!("cluster name '{}' already exists", cluster.name))
            } else {
                StoreError::Database(e)
            }
        })?;

        map_cluster_row(&row)
    }

    async fn get_cluster(&self, id: i64) -> Result<Option<Cluster>> {
        let row = sqlx::query(&format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_cluster_row).transpose()
    }

    async fn update_cluster_status(&self, id: i64, status: ClusterStatus) -> Result<()> {
        sqlx::query("UPDATE clusters SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_cluster_error(&self, id: i64, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE clusters SET status = 'error', error_message = $1, updated_at = now() WHERE id = $2",
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_kube_artifacts(
        &self,
        id: i64,
        kubeconfig_encrypted: &[u8],
        node_token: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE clusters SET kubeconfig_encrypted = $1, node_token = $2, \
             status = 'active', updated_at = now() WHERE id = $3",
        )
        .bind(kubeconfig_encrypted)
        .bind(node_token)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_swarm_token(&self, id: i64, token: &str) -> Result<()> {
        sqlx::query(
            "UPDATE clusters SET swarm_join_token = $1, status = 'active', updated_at = now() WHERE id = $2",
        )
        .bind(token)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_application(&self, id: i64) -> Result<Option<Application>> {
        let row = sqlx::query(
            "SELECT id, name, cluster_id, namespace, source_type, repo_url, branch, \
             docker_image, manual_path, build_type, build_cmd, start_cmd, port, env_vars, \
             replicas, status, created_at, updated_at FROM applications WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_application_row).transpose()
    }

    async fn update_application_status(&self, id: i64, status: AppStatus) -> Result<()> {
        sqlx::query("UPDATE applications SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_deployment(
        &self,
        application_id: i64,
        version: &str,
        status: DeploymentStatus,
    ) -> Result<Deployment> {
        let row = sqlx::query(
            "INSERT INTO deployments (application_id, version, status) VALUES ($1, $2, $3) \
             RETURNING id, application_id, version, image_tag, status, logs, created_at, updated_at",
        )
        .bind(application_id)
        .bind(version)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;

        map_deployment_row(&row)
    }

    async fn count_deployments(&self, application_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM deployments WHERE application_id = $1")
                .bind(application_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn update_deployment_status(&self, id: i64, status: DeploymentStatus) -> Result<()> {
        sqlx::query("UPDATE deployments SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_deployment_live(&self, id: i64, image_tag: &str) -> Result<()> {
        sqlx::query(
            "UPDATE deployments SET status = 'live', image_tag = $1, updated_at = now() WHERE id = $2",
        )
        .bind(image_tag)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_deployment_log(&self, id: i64, line: &str) -> Result<()> {
        sqlx::query(
            "UPDATE deployments SET logs = COALESCE(logs, '') || $1, updated_at = now() WHERE id = $2",
        )
        .bind(format!("{}\n", line))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deployments_for_application(&self, application_id: i64) -> Result<Vec<Deployment>> {
        let rows = sqlx::query(
            "SELECT id, application_id, version, image_tag, status, logs, created_at, updated_at \
             FROM deployments WHERE application_id = $1 ORDER BY id",
        )
        .bind(application_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_deployment_row).collect()
    }

    async fn get_environment(&self, id: i64) -> Result<Option<Environment>> {
        let row = sqlx::query(
            "SELECT id, cluster_id, scope, name, variables, synced, created_at, updated_at \
             FROM environments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_environment_row).transpose()
    }

    async fn mark_environment_synced(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE environments SET synced = TRUE, updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_nginx_config(&self, id: i64) -> Result<Option<NginxConfig>> {
        let row = sqlx::query(
            "SELECT id, server_id, domain, upstream_port, ssl_enabled, lets_encrypt, \
             custom_config, application_id, status, created_at, updated_at \
             FROM nginx_configs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_nginx_row).transpose()
    }

    async fn update_nginx_status(&self, id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE nginx_configs SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_activity(&self, activity: NewActivity) -> Result<()> {
        sqlx::query(
            "INSERT INTO activities (activity_type, message, entity, entity_id, user_id, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(activity.activity_type.as_str())
        .bind(&activity.message)
        .bind(&activity.entity)
        .bind(activity.entity_id)
        .bind(activity.user_id)
        .bind(&activity.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_activities(&self, limit: i64) -> Result<Vec<Activity>> {
        let rows = sqlx::query(
            "SELECT id, activity_type, message, entity, entity_id, user_id, metadata, created_at \
             FROM activities ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let activity_type: String = row.try_get("activity_type")?;
                Ok(Activity {
                    id: row.try_get("id")?,
                    activity_type: ActivityType::parse(&activity_type).ok_or_else(|| {
                        StoreError::Corrupt(format!("activity type '{}'", activity_type))
                    })?,
                    message: row.try_get("message")?,
                    entity: row.try_get("entity")?,
                    entity_id: row.try_get("entity_id")?,
                    user_id: row.try_get("user_id")?,
                    metadata: row.try_get("metadata")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_statement_order() {
        let statements = migration_statements();
        let tables: Vec<&str> = statements
            .iter()
            .map(|s| {
                s.trim()
                    .strip_prefix("CREATE TABLE IF NOT EXISTS ")
                    .unwrap()
                    .split_whitespace()
                    .next()
                    .unwrap()
            })
            .collect();

        assert_eq!(
            tables,
            [
                "users",
                "server_teams",
                "servers",
                "server_memberships",
                "clusters",
                "applications",
                "application_memberships",
                "deployments",
                "activities",
                "environments",
                "nginx_configs",
            ]
        );
    }

    #[test]
    fn test_cyclic_references_carry_no_constraints() {
        let statements = migration_statements();
        let servers = statements[2];
        let clusters = statements[4];

        // cluster_id on servers and manager_server_id on clusters form a
        // cycle; neither side declares a foreign key.
        assert!(servers.contains("cluster_id BIGINT,"));
        assert!(!servers.contains("cluster_id BIGINT REFERENCES"));
        assert!(clusters.contains("manager_server_id BIGINT NOT NULL,"));
        assert!(!clusters.contains("manager_server_id BIGINT NOT NULL REFERENCES"));
    }
}
