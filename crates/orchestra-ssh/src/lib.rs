pub mod client;
pub mod error;
pub mod preflight;

pub use client::{Credential, ExecOutput, Gateway, RemoteSession, SshGateway, SshTarget};
pub use error::SshError;
pub use preflight::{run_preflight, PreflightReport, SUPPORTED_DISTROS};
