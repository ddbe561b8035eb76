//! The Orchestra task engine: per-kind state machines over the state
//! store, the remote shell gateway and the secret vault, plus the
//! orchestration services that turn user intent into enqueued tasks.

pub mod activity;
pub mod buildpack;
pub mod config;
pub mod handlers;
pub mod render;
pub mod service;
pub mod tasks;
pub mod worker;

pub use config::Config;
pub use worker::{build_registry, run_worker};

use orchestra_ssh::Gateway;
use orchestra_store::Store;
use orchestra_vault::Vault;
use std::sync::Arc;

/// Shared dependencies handed to every task handler.
pub struct EngineContext {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn Gateway>,
    pub vault: Arc<Vault>,
    /// Optional passphrase for the stored private keys.
    pub key_passphrase: Option<String>,
}
