use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: russh::Error,
    },

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("authentication failed for {user}@{host}")]
    AuthFail { user: String, host: String },

    #[error("failed to parse private key: {0}")]
    InvalidKey(String),

    #[error("transport error: {0}")]
    Transport(#[from] russh::Error),

    #[error("session closed before command completed")]
    SessionClosed,
}
