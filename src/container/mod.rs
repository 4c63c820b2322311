//! Live runtime objects.
//!
//! Handles here are thin views over runtime snapshots. They are never
//! persisted: every listing re-derives them from the runtime, and they are
//! correlated back to applications through container labels.
//!
//! ## Architecture
//!
//! - [`handle`]: one container, its goal-state transitions and details
//! - [`image`]: one image built for an application, its child containers and
//!   cascading deletion
//! - [`logs`]: demultiplexing a container log stream into console sinks
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dockyard::container::ContainerHandle;
//! use dockyard::deploy::RunState;
//! use dockyard::runtime::{ContainerFilter, InMemoryRuntime, RuntimeTarget};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let target = Arc::new(RuntimeTarget::builder(Arc::new(InMemoryRuntime::new())).build());
//!
//!     let filter = ContainerFilter::all().label("dockyard.app.name", "demo");
//!     for snapshot in target.runtime().list_containers(&filter).await? {
//!         let container = ContainerHandle::new(target.clone(), snapshot);
//!         container.set_goal_state(RunState::Inactive).await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod handle;
pub mod image;
pub mod logs;

pub use handle::ContainerHandle;
pub use image::ImageHandle;
pub use logs::{LogBridge, active_handlers, started_streams};

use crate::deploy::RunState;
use crate::env::labels;
use crate::runtime::ContainerSnapshot;

/// Run state of a container snapshot.
///
/// A running container created with a debug port reports [`RunState::Debugging`].
pub fn run_state_of(snapshot: &ContainerSnapshot) -> RunState {
    RunState::from_runtime(&snapshot.state, snapshot.label(labels::DEBUG_PORT).is_some())
}

/// First 12 characters of an id, without a `sha256:` prefix.
pub fn short_hash(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_of_debug_container() {
        let mut snapshot = ContainerSnapshot {
            state: "running".to_string(),
            ..Default::default()
        };
        assert_eq!(run_state_of(&snapshot), RunState::Running);

        snapshot
            .labels
            .insert(labels::DEBUG_PORT.to_string(), "5005".to_string());
        assert_eq!(run_state_of(&snapshot), RunState::Debugging);

        snapshot.state = "exited".to_string();
        assert_eq!(run_state_of(&snapshot), RunState::Inactive);
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("sha256:0123456789abcdef"), "0123456789ab");
        assert_eq!(short_hash("abc"), "abc");
    }
}
