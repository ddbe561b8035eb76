//! Application deployment: fetch source, build an image, hand it to the
//! cluster's orchestrator.
//!
//! The version is derived from a live count of the application's
//! deployments, so every run (including a retry) appends a new
//! deployment row. Stricter semantics would carry the version in the
//! payload instead.

use crate::activity::log_activity;
use crate::buildpack::generate_dockerfile;
use crate::handlers::{open_server_session, run_ok, SessionError};
use crate::render::{env_args, heredoc_write, k8s_manifest, port_mapping};
use crate::tasks::DeployAppPayload;
use crate::EngineContext;
use async_trait::async_trait;
use orchestra_common::models::{
    ActivityType, AppStatus, Application, Cluster, ClusterType, DeploymentStatus, SourceType,
};
use orchestra_common::sanitize;
use orchestra_queue::{TaskError, TaskHandler, TaskMessage};
use orchestra_ssh::RemoteSession;
use std::sync::Arc;
use tracing::info;

const APPS_ROOT: &str = "/opt/orchestra/apps";

/// `app:deploy`
pub struct DeployAppHandler {
    pub ctx: Arc<EngineContext>,
}

#[async_trait]
impl TaskHandler for DeployAppHandler {
    async fn handle(&self, task: &TaskMessage) -> Result<(), TaskError> {
        let payload: DeployAppPayload = task.payload_as()?;
        let store = &self.ctx.store;

        info!(app_id = payload.app_id, "Starting deployment");

        let app = store
            .get_application(payload.app_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| TaskError::fatal(format!("application {} not found", payload.app_id)))?;

        let cluster = store
            .get_cluster(app.cluster_id)
            .await
            .map_err(TaskError::retryable)?
            .ok_or_else(|| TaskError::fatal(format!("cluster {} not found", app.cluster_id)))?;

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

        // Version from the live count; each run appends a new row.
        let count = store
            .count_deployments(app.id)
            .await
            .map_err(TaskError::retryable)?;
        let version = format!("v{}", count + 1);

        let deployment = store
            .insert_deployment(app.id, &version, DeploymentStatus::Building)
            .await
            .map_err(TaskError::retryable)?;
        store
            .update_application_status(app.id, AppStatus::Building)
            .await
            .map_err(TaskError::retryable)?;

        let session = match open_server_session(&self.ctx, &manager).await {
            Ok(session) => session,
            Err(err @ SessionError::Decrypt) => {
                self.fail(deployment.id, app.id, "Failed to decrypt manager SSH key")
                    .await;
                return Err(TaskError::fatal(err.message()));
            }
            Err(err @ SessionError::Connect(_)) => {
                self.fail(
                    deployment.id,
                    app.id,
                    &format!("SSH to manager failed: {}", err.message()),
                )
                .await;
                return Err(TaskError::retryable(anyhow::anyhow!(err.message())));
            }
        };

        let result = self
            .deploy(&app, &cluster, deployment.id, &version, session.as_ref())
            .await;
        session.close().await;

        match result {
            Ok(image) => {
                store
                    .mark_deployment_live(deployment.id, &image)
                    .await
                    .map_err(TaskError::retryable)?;
                store
                    .update_application_status(app.id, AppStatus::Running)
                    .await
                    .map_err(TaskError::retryable)?;
                let _ = store
                    .append_deployment_log(
                        deployment.id,
                        &format!("Deployment {} is live!", version),
                    )
                    .await;
                log_activity(
                    store.as_ref(),
                    ActivityType::AppDeployed,
                    format!("Application '{}' deployed ({})", app.name, version),
                    "application",
                    app.id,
                )
                .await;
                info!(app_id = app.id, version = %version, "Deployment complete");
                Ok(())
            }
            Err(e) => {
                self.fail(deployment.id, app.id, &e.to_string()).await;
                Err(TaskError::Retryable(e))
            }
        }
    }
}

impl DeployAppHandler {
    async fn log(&self, deployment_id: i64, line: &str) {
        let _ = self
            .ctx
            .store
            .append_deployment_log(deployment_id, line)
            .await;
    }

    async fn fail(&self, deployment_id: i64, app_id: i64, message: &str) {
        let store = &self.ctx.store;
        self.log(deployment_id, &format!("ERROR: {}", message)).await;
        let _ = store
            .update_deployment_status(deployment_id, DeploymentStatus::Failed)
            .await;
        let _ = store.update_application_status(app_id, AppStatus::Failed).await;
        log_activity(
            store.as_ref(),
            ActivityType::DeploymentFailed,
            message.to_string(),
            "deployment",
            deployment_id,
        )
        .await;
    }

    async fn deploy(
        &self,
        app: &Application,
        cluster: &Cluster,
        deployment_id: i64,
        version: &str,
        session: &dyn RemoteSession,
    ) -> Result<String, anyhow::Error> {
        let store = &self.ctx.store;
        let name = sanitize(&app.name);
        let app_dir = format!("{}/{}", APPS_ROOT, name);
        let mut image = format!("orchestra/{}:{}", name, version);

        let _ = session.exec(&format!("mkdir -p {}", app_dir)).await;

        // Fetch source
        match app.source_type {
            SourceType::Git => {
                let repo_url = app
                    .repo_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("application has no repository URL"))?;
                self.log(
                    deployment_id,
                    &format!("Cloning {} (branch: {})...", repo_url, app.branch),
                )
                .await;
                let clone_cmd = format!(
                    "cd {} && rm -rf src && git clone --depth 1 --branch {} {} src 2>&1",
                    app_dir, app.branch, repo_url
                );
                run_ok(session, &clone_cmd)
                    .await
                    .map_err(|e| anyhow::anyhow!("Git clone failed: {}", e))?;
                self.log(deployment_id, "Clone complete.").await;
            }
            SourceType::DockerImage => {
                let docker_image = app
                    .docker_image
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("application has no docker image"))?;
                self.log(
                    deployment_id,
                    &format!("Pulling Docker image: {}", docker_image),
                )
                .await;
                image = docker_image.to_string();
                run_ok(session, &format!("docker pull {} 2>&1", docker_image))
                    .await
                    .map_err(|e| anyhow::anyhow!("Docker pull failed: {}", e))?;
                self.log(deployment_id, "Pull complete.").await;
            }
            SourceType::Manual => {
                let manual_path = app
                    .manual_path
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("application has no manual path"))?;
                self.log(deployment_id, &format!("Using manual path: {}", manual_path))
                    .await;
                let _ = session
                    .exec(&format!("cd {} && ln -sfn {} src", app_dir, manual_path))
                    .await;
            }
        }

        // Build (unless the image came from a registry)
        if app.source_type != SourceType::DockerImage {
            let src_dir = format!("{}/src", app_dir);

            let check = session
                .exec(&format!(
                    "test -f {}/Dockerfile && echo YES || echo NO",
                    src_dir
                ))
                .await?;
            let has_dockerfile = check.stdout.trim() == "YES";

            if !has_dockerfile && !app.build_type.is_empty() && app.build_type != "docker" {
                let dockerfile = generate_dockerfile(
                    &app.build_type,
                    app.build_cmd.as_deref().unwrap_or(""),
                    app.start_cmd.as_deref().unwrap_or(""),
                );
                if !dockerfile.is_empty() {
                    self.log(deployment_id, "Generating Dockerfile from buildpack...")
                        .await;
                    let write_cmd =
                        heredoc_write(&format!("{}/Dockerfile", src_dir), &dockerfile);
                    let _ = session.exec(&write_cmd).await;
                }
            }

            self.log(deployment_id, "Building Docker image...").await;
            let build_cmd = format!("cd {} && docker build -t {} . 2>&1", src_dir, image);
            run_ok(session, &build_cmd)
                .await
                .map_err(|e| anyhow::anyhow!("Docker build failed: {}", e))?;
            self.log(deployment_id, "Build complete.").await;
        }

        store
            .update_deployment_status(deployment_id, DeploymentStatus::Deploying)
            .await?;
        store
            .update_application_status(app.id, AppStatus::Deploying)
            .await?;

        let env = env_args(&app.env_vars.production);
        let ports = port_mapping(app.port);

        match cluster.cluster_type {
            ClusterType::K8s => {
                self.deploy_k8s(app, deployment_id, &image, &name, session)
                    .await?
            }
            ClusterType::Swarm => {
                self.deploy_swarm(app, deployment_id, &image, &name, &env, &ports, session)
                    .await?
            }
            ClusterType::Manual => {
                self.deploy_docker(deployment_id, &image, &name, &env, &ports, session)
                    .await?
            }
        }

        Ok(image)
    }

    async fn deploy_k8s(
        &self,
        app: &Application,
        deployment_id: i64,
        image: &str,
        name: &str,
        session: &dyn RemoteSession,
    ) -> Result<(), anyhow::Error> {
        self.log(deployment_id, "Deploying to Kubernetes...").await;

        let manifest = k8s_manifest(
            name,
            &app.namespace,
            image,
            app.replicas,
            &app.env_vars.production,
            app.port,
        );
        let manifest_path = format!("/tmp/{}.yaml", name);
        let _ = session.exec(&heredoc_write(&manifest_path, &manifest)).await;

        run_ok(session, &format!("kubectl apply -f {} 2>&1", manifest_path))
            .await
            .map_err(|e| anyhow::anyhow!("kubectl apply failed: {}", e))?;
        self.log(deployment_id, "Kubernetes deployment applied.").await;
        Ok(())
    }

    async fn deploy_swarm(
        &self,
        app: &Application,
        deployment_id: i64,
        image: &str,
        name: &str,
        env: &str,
        ports: &str,
        session: &dyn RemoteSession,
    ) -> Result<(), anyhow::Error> {
        self.log(deployment_id, "Deploying to Docker Swarm...").await;

        // Best-effort removal of the previous service
        let _ = session
            .exec(&format!("docker service rm {} 2>/dev/null", name))
            .await;

        let create_cmd = format!(
            "docker service create --name {} --replicas {} {} {} {} 2>&1",
            name, app.replicas, env, ports, image
        );
        run_ok(session, &create_cmd)
            .await
            .map_err(|e| anyhow::anyhow!("Swarm deploy failed: {}", e))?;
        self.log(deployment_id, "Swarm service created.").await;
        Ok(())
    }

    async fn deploy_docker(
        &self,
        deployment_id: i64,
        image: &str,
        name: &str,
        env: &str,
        ports: &str,
        session: &dyn RemoteSession,
    ) -> Result<(), anyhow::Error> {
        self.log(deployment_id, "Deploying with Docker...").await;

        let _ = session
            .exec(&format!(
                "docker stop {} 2>/dev/null; docker rm {} 2>/dev/null",
                name, name
            ))
            .await;

        let run_cmd = format!(
            "docker run -d --name {} --restart unless-stopped {} {} {} 2>&1",
            name, env, ports, image
        );
        run_ok(session, &run_cmd)
            .await
            .map_err(|e| anyhow::anyhow!("Docker run failed: {}", e))?;
        self.log(deployment_id, "Docker container started.").await;
        Ok(())
    }
}
