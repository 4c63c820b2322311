//! Persistent state.
//!
//! Everything dockyard remembers between runs goes through a
//! [`PropertyStore`]: the deployment record list, the image ids produced for
//! each application, and per-image classpath snapshot flags.
//!
//! - [`props`]: the key/value store trait and its file and memory backends
//! - [`ledger`]: per-application image lineage on top of a property store
//! - [`deployments`]: the observable, persisted [`DeploymentStore`]

pub mod deployments;
pub mod ledger;
pub mod props;

pub use deployments::{DeploymentEvent, DeploymentListener, DeploymentStore, ListenerId};
pub use ledger::ImageLedger;
pub use props::{FilePropertyStore, MemoryPropertyStore, PropertyStore};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Property store and persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// File system error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Atomic replace of the backing file failed
    #[error("Failed to persist {path}: {message}")]
    Persist {
        /// Target file
        path: PathBuf,
        /// Underlying failure
        message: String,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store configuration (`[store]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `properties.json`; defaults to `<workspace>/.dockyard`
    pub state_dir: Option<PathBuf>,
    /// Delay coalescing record changes into one write
    pub persist_debounce_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            persist_debounce_ms: 200,
        }
    }
}

impl StoreConfig {
    /// Configured state directory, or the default one under `workspace`.
    pub fn state_dir_for(&self, workspace: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| crate::env::dockyard_dir_path(workspace))
    }

    /// Persist debounce delay.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}
