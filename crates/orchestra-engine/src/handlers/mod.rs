//! Task handlers: one small state machine per task kind.
//!
//! Handlers are re-runnable on the same payload (delivery is
//! at-least-once) and classify failures per the engine's retry policy:
//! missing rows and undecryptable secrets are terminal, transport
//! problems retry, malformed payloads skip the retry budget entirely.

pub mod app;
pub mod env_push;
pub mod k8s;
pub mod manual;
pub mod nginx;
pub mod preflight;
pub mod swarm;

#[cfg(test)]
pub(crate) mod testutil;

pub use app::DeployAppHandler;
pub use env_push::PushEnvHandler;
pub use k8s::{DesignateManagerHandler, JoinWorkerHandler};
pub use manual::ManualSetupHandler;
pub use nginx::NginxProvisionHandler;
pub use preflight::{InstallK3sHandler, PreflightHandler};
pub use swarm::{SwarmInitHandler, SwarmJoinHandler};

use crate::EngineContext;
use orchestra_common::models::Server;
use orchestra_ssh::{Credential, ExecOutput, RemoteSession, SshError, SshTarget};
use tracing::debug;

/// Why a session could not be opened; decides the caller's failure policy.
pub(crate) enum SessionError {
    /// Wrong key or corrupted ciphertext. Retrying cannot help.
    Decrypt,
    /// Network or SSH transport problem.
    Connect(SshError),
}

impl SessionError {
    pub(crate) fn message(&self) -> String {
        match self {
            SessionError::Decrypt => "failed to decrypt SSH key".to_string(),
            SessionError::Connect(e) => format!("SSH connection failed: {}", e),
        }
    }
}

/// Decrypt the server's key and open a session to it.
pub(crate) async fn open_server_session(
    ctx: &EngineContext,
    server: &Server,
) -> Result<Box<dyn RemoteSession>, SessionError> {
    let private_key = ctx
        .vault
        .decrypt(&server.ssh_key_encrypted)
        .map_err(|_| SessionError::Decrypt)?;

    let target = SshTarget {
        host: server.address.clone(),
        port: server.ssh_port,
        user: server.ssh_user.clone(),
    };
    let credential = Credential::Key {
        private_key,
        passphrase: ctx.key_passphrase.clone(),
    };

    debug!(server_id = server.id, address = %server.address, "Connecting to server");
    ctx.gateway
        .connect(&target, &credential)
        .await
        .map_err(SessionError::Connect)
}

/// Run a command, treating transport failure and non-zero exit alike as an
/// error carrying the remote stderr. For commands where a non-zero exit is
/// expected, call `session.exec` directly.
pub(crate) async fn run_ok(
    session: &dyn RemoteSession,
    command: &str,
) -> Result<ExecOutput, anyhow::Error> {
    let output = session.exec(command).await?;
    if !output.success() {
        anyhow::bail!(
            "command exited {}: {}",
            output.exit_code,
            output.stderr.trim()
        );
    }
    Ok(output)
}
