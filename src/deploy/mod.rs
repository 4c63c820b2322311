//! Desired-state reconciliation.
//!
//! A [`DeploymentRecord`] in the [`DeploymentStore`](crate::store::DeploymentStore)
//! describes what should run. The [`Deployer`] turns store events into
//! scheduled [`AppReconciler::synchronize`] calls, one reconciler per
//! application, and each reconciler drives the runtime until the live
//! containers match the record.

pub mod app;
pub mod deployer;
pub mod params;
pub mod record;
pub mod scheduler;

pub use app::AppReconciler;
pub use deployer::{AppStatus, Deployer};
pub use params::ContainerParams;
pub use record::{DeploymentRecord, RunState, new_build_id, parse_system_properties};
pub use scheduler::{Job, KeyedScheduler, SchedulerSlot, TaskScheduler};

use crate::build::BuildError;
use crate::runtime::RuntimeError;
use crate::store::StoreError;
use std::collections::BTreeSet;
use std::fmt;

/// Optional operation an application, image or container may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Stream logs
    Log,
    /// Attach a remote debugger
    Debug,
    /// Connect Spring Boot devtools
    ConnectDevtools,
    /// Delete
    Delete,
    /// Restart
    Restart,
    /// Pause and resume
    Pause,
    /// Connect over JMX
    Jmx,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Log => "log",
            Capability::Debug => "debug",
            Capability::ConnectDevtools => "connect-devtools",
            Capability::Delete => "delete",
            Capability::Restart => "restart",
            Capability::Pause => "pause",
            Capability::Jmx => "jmx",
        };
        f.write_str(name)
    }
}

/// The set of operations an entity supports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    /// Set containing `caps`.
    pub fn of(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    /// Add a capability.
    pub fn insert(&mut self, cap: Capability) {
        self.0.insert(cap);
    }

    /// Whether `cap` is supported.
    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    /// Fail unless `cap` is supported.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Unsupported`] when `cap` is absent.
    pub fn require(&self, cap: Capability) -> Result<()> {
        if self.contains(cap) {
            Ok(())
        } else {
            Err(DeployError::Unsupported(cap))
        }
    }

    /// Supported capabilities in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

/// Reconciliation errors.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// The entity does not support the requested operation
    #[error("Operation not supported: {0}")]
    Unsupported(Capability),

    /// A system property value cannot be passed on a JVM command line
    #[error("System property {key} has a value with whitespace or control characters: {value:?}")]
    InvalidSystemProperty {
        /// Property name
        key: String,
        /// Offending value
        value: String,
    },

    /// The project directory of an application does not exist
    #[error("The project '{0}' is not accessible")]
    ProjectNotAccessible(String),

    /// No deployment record exists for the application
    #[error("No deployment named '{0}'")]
    UnknownApp(String),

    /// The state cannot be requested as a goal
    #[error("'{0}' is not a valid goal state")]
    InvalidGoalState(RunState),

    /// Image build failed
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Runtime call failed
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Persisting state failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_capability() {
        let caps = Capabilities::of([Capability::Log, Capability::Delete]);
        assert!(caps.require(Capability::Log).is_ok());
        assert!(matches!(
            caps.require(Capability::Jmx),
            Err(DeployError::Unsupported(Capability::Jmx))
        ));
        assert_eq!(
            caps.iter().collect::<Vec<_>>(),
            vec![Capability::Log, Capability::Delete]
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            DeployError::Unsupported(Capability::ConnectDevtools).to_string(),
            "Operation not supported: connect-devtools"
        );
        assert_eq!(
            DeployError::ProjectNotAccessible("demo".into()).to_string(),
            "The project 'demo' is not accessible"
        );
    }
}
