//! Container runtime abstraction.
//!
//! The reconciler talks to Docker/Podman exclusively through the
//! [`ContainerRuntime`] trait so that the convergence logic can run against a
//! real daemon ([`DockerRuntime`], via bollard) or entirely in process
//! ([`InMemoryRuntime`]).
//!
//! ## Architecture
//!
//! - [`docker`]: bollard-backed runtime with Docker/Podman connection fallback
//! - [`memory`]: in-process runtime with a call journal
//! - [`target`]: the [`RuntimeTarget`] that owns the runtime handle, network and session id
//! - [`retry`]: bounded convergence polling
//! - [`ports`]: free host port probing

#[cfg(feature = "docker")]
mod docker;
mod memory;
pub mod ports;
pub mod retry;
mod target;

#[cfg(feature = "docker")]
pub use docker::{DockerRuntime, DockerRuntimeConfig, DockerRuntimeFactory};
pub use memory::InMemoryRuntime;
pub use ports::{FreePortFinder, PortAllocator, SequentialPorts};
pub use retry::PollPolicy;
pub use target::{
    DedicatedRuntimeFactory, Ownership, RuntimeConfig, RuntimeTarget, RuntimeTargetBuilder,
};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Container runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Docker/Podman API error
    #[cfg(feature = "docker")]
    #[error("Container API error: {0}")]
    ApiError(#[from] bollard::errors::Error),

    /// Container, image or network not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested state change was already in effect (HTTP 304)
    #[error("Not modified: {0}")]
    NotModified(String),

    /// The request conflicts with the current state of the object
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Runtime is not reachable
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),

    /// General error
    #[error("Runtime error: {0}")]
    Other(String),
}

impl RuntimeError {
    /// Whether this error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            RuntimeError::NotFound(_) => true,
            #[cfg(feature = "docker")]
            RuntimeError::ApiError(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => true,
            _ => false,
        }
    }

    /// Whether this error means the state change was already in effect.
    pub fn is_not_modified(&self) -> bool {
        match self {
            RuntimeError::NotModified(_) => true,
            #[cfg(feature = "docker")]
            RuntimeError::ApiError(bollard::errors::Error::DockerResponseServerError {
                status_code: 304,
                ..
            }) => true,
            _ => false,
        }
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Snapshot of a container as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSnapshot {
    /// Container ID
    pub id: String,
    /// Container names (as reported, usually with a leading `/`)
    pub names: Vec<String>,
    /// Image the container was created from
    pub image: String,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Lifecycle state (`created`, `running`, `paused`, `exited`, ...)
    pub state: String,
}

impl ContainerSnapshot {
    /// Get a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Snapshot of an image as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSnapshot {
    /// Image ID
    pub id: String,
    /// Repository tags
    pub repo_tags: Vec<String>,
}

/// Snapshot of a network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSnapshot {
    /// Network ID
    pub id: String,
    /// Network name
    pub name: String,
    /// Network driver
    pub driver: String,
}

/// Container listing filter.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    /// Include stopped containers
    pub all: bool,
    /// Label constraints (`key=value`)
    pub labels: Vec<(String, String)>,
    /// Restrict to descendants of this image
    pub ancestor: Option<String>,
}

impl ContainerFilter {
    /// All containers, running or not.
    pub fn all() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }

    /// Add a label constraint.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    /// Restrict to containers created from an image.
    pub fn ancestor(mut self, image: impl Into<String>) -> Self {
        self.ancestor = Some(image.into());
        self
    }

    /// Check a snapshot against this filter.
    pub fn matches(&self, container: &ContainerSnapshot, image_id: Option<&str>) -> bool {
        if !self.all && container.state != "running" {
            return false;
        }
        let labels_match = self
            .labels
            .iter()
            .all(|(k, v)| container.label(k) == Some(v.as_str()));
        let ancestor_match = match &self.ancestor {
            Some(ancestor) => container.image == *ancestor || image_id == Some(ancestor.as_str()),
            None => true,
        };
        labels_match && ancestor_match
    }

    /// Render as runtime filter map.
    pub fn to_filter_map(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        if !self.labels.is_empty() {
            filters.insert(
                "label".to_string(),
                self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
            );
        }
        if let Some(ref ancestor) = self.ancestor {
            filters.insert("ancestor".to_string(), vec![ancestor.clone()]);
        }
        filters
    }
}

/// Host port binding of a container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Host interface
    pub host_ip: String,
    /// Host port
    pub host_port: u16,
    /// Container port (tcp)
    pub container_port: u16,
}

impl PortMapping {
    /// Bind on all interfaces.
    pub fn any_interface(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: "0.0.0.0".to_string(),
            host_port,
            container_port,
        }
    }

    /// Port key in `<port>/tcp` form.
    pub fn container_port_key(&self) -> String {
        format!("{}/tcp", self.container_port)
    }
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerSpec {
    /// Image name or ID
    pub image: String,
    /// Labels, in assembly order
    pub labels: Vec<(String, String)>,
    /// Environment variables (`KEY=value`)
    pub env: Vec<String>,
    /// Exposed container ports (`<port>/tcp`)
    pub exposed_ports: Vec<String>,
    /// Host port bindings
    pub port_bindings: Vec<PortMapping>,
    /// Network to join
    pub network: Option<String>,
    /// Network aliases within that network
    pub aliases: Vec<String>,
}

/// Options for attaching to a container log stream.
#[derive(Debug, Clone)]
pub struct LogStreamOptions {
    /// Include stdout frames
    pub stdout: bool,
    /// Include stderr frames
    pub stderr: bool,
    /// Keep the stream open for new output
    pub follow: bool,
    /// Only frames newer than this unix timestamp (seconds)
    pub since: Option<i64>,
}

impl Default for LogStreamOptions {
    fn default() -> Self {
        Self {
            stdout: true,
            stderr: true,
            follow: true,
            since: None,
        }
    }
}

/// One multiplexed log frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFrame {
    /// Payload written to stdout
    StdOut(Vec<u8>),
    /// Payload written to stderr
    StdErr(Vec<u8>),
    /// Payload echoed from stdin
    StdIn(Vec<u8>),
    /// Raw console (tty) payload
    Console(Vec<u8>),
}

/// Stream of log frames.
pub type LogStream = BoxStream<'static, Result<LogFrame>>;

/// Primitive operations the reconciler needs from a container runtime.
///
/// Equivalent to a subset of the Docker Engine API.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verify connectivity.
    async fn ping(&self) -> Result<()>;

    /// List containers matching a filter.
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSnapshot>>;

    /// Create a container, returning its ID.
    async fn create_container(&self, spec: &CreateContainerSpec) -> Result<String>;

    /// Start a container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container, killing it after `timeout`.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Restart a container.
    async fn restart_container(&self, id: &str) -> Result<()>;

    /// Pause a container.
    async fn pause_container(&self, id: &str) -> Result<()>;

    /// Unpause a container.
    async fn unpause_container(&self, id: &str) -> Result<()>;

    /// Remove a container.
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    /// Inspect a container.
    async fn inspect_container(&self, id: &str) -> Result<ContainerSnapshot>;

    /// List images, optionally restricted to a reference.
    async fn list_images(&self, reference: Option<&str>) -> Result<Vec<ImageSnapshot>>;

    /// Inspect an image by name or ID.
    async fn inspect_image(&self, name: &str) -> Result<ImageSnapshot>;

    /// Remove an image.
    async fn remove_image(&self, id: &str, force: bool, noprune: bool) -> Result<()>;

    /// List networks with the given name.
    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkSnapshot>>;

    /// Create a bridge network, returning its ID.
    async fn create_network(&self, name: &str) -> Result<String>;

    /// Attach to the combined log frame stream of a container.
    async fn logs(&self, id: &str, options: &LogStreamOptions) -> Result<LogStream>;

    /// Release the connection. Only called on exclusively owned handles.
    fn shutdown(&self) {}
}

/// Shared runtime handle.
pub type SharedRuntime = Arc<dyn ContainerRuntime>;

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(state: &str, labels: &[(&str, &str)]) -> ContainerSnapshot {
        ContainerSnapshot {
            id: "c1".to_string(),
            image: "demo:latest".to_string(),
            state: state.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_labels_and_state() {
        let filter = ContainerFilter::all().label("app", "demo");
        assert!(filter.matches(&snapshot("exited", &[("app", "demo")]), None));
        assert!(!filter.matches(&snapshot("running", &[("app", "other")]), None));

        let running_only = ContainerFilter::default().label("app", "demo");
        assert!(!running_only.matches(&snapshot("exited", &[("app", "demo")]), None));
    }

    #[test]
    fn test_filter_ancestor_by_id() {
        let filter = ContainerFilter::all().ancestor("sha256:abc");
        assert!(filter.matches(&snapshot("running", &[]), Some("sha256:abc")));
        assert!(!filter.matches(&snapshot("running", &[]), Some("sha256:def")));
    }

    #[test]
    fn test_filter_map() {
        let map = ContainerFilter::all()
            .label("app", "demo")
            .ancestor("img")
            .to_filter_map();
        assert_eq!(map["label"], vec!["app=demo".to_string()]);
        assert_eq!(map["ancestor"], vec!["img".to_string()]);
    }
}
