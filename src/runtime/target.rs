//! Runtime target: the connection epoch every reconciliation runs against.

use super::ports::{FreePortFinder, PortAllocator};
use super::retry::PollPolicy;
use super::{Result, RuntimeError, SharedRuntime};
use crate::build::{BuildCache, BuildConfig};
use crate::console::{ConsoleProvider, StdConsoleProvider};
use crate::project::{ProjectAccessor, WorkspaceProjects};
use crate::store::{MemoryPropertyStore, PropertyStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runtime configuration (`[runtime]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Network every application container joins
    pub network: String,
    /// Grace period before a stopped container is killed
    pub stop_timeout_secs: u64,
    /// Delay between convergence polls
    pub poll_interval_ms: u64,
    /// Convergence poll attempt budget
    pub poll_attempts: u32,
    /// Open a dedicated runtime connection per log stream
    pub dedicated_log_client: bool,
    /// Port the application listens on inside the container
    pub app_port: u16,
    /// Publish a JMX port for every container
    pub jmx_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            network: "dockyard-network".to_string(),
            stop_timeout_secs: 20,
            poll_interval_ms: 100,
            poll_attempts: 200,
            dedicated_log_client: false,
            app_port: 8080,
            jmx_enabled: false,
        }
    }
}

impl RuntimeConfig {
    /// Stop grace period.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Convergence polling policy.
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(self.poll_interval_ms), self.poll_attempts)
    }
}

/// Opens exclusively owned runtime connections.
#[async_trait]
pub trait DedicatedRuntimeFactory: Send + Sync {
    /// Open a new connection.
    async fn open(&self) -> Result<SharedRuntime>;
}

#[async_trait]
impl<F> DedicatedRuntimeFactory for F
where
    F: Fn() -> SharedRuntime + Send + Sync,
{
    async fn open(&self) -> Result<SharedRuntime> {
        Ok(self())
    }
}

/// A runtime handle together with who is responsible for releasing it.
#[derive(Clone)]
pub enum Ownership {
    /// Exclusively owned; released when the holder is done with it
    Owned(SharedRuntime),
    /// Shared with the rest of the process; never released by the holder
    Borrowed(SharedRuntime),
}

impl Ownership {
    /// The runtime handle.
    pub fn runtime(&self) -> &SharedRuntime {
        match self {
            Ownership::Owned(runtime) | Ownership::Borrowed(runtime) => runtime,
        }
    }

    /// Whether the holder must release the handle.
    pub fn is_owned(&self) -> bool {
        matches!(self, Ownership::Owned(_))
    }

    /// Release the handle if it is owned.
    pub fn release(&self) {
        if let Ownership::Owned(runtime) = self {
            runtime.shutdown();
        }
    }
}

/// The runtime connection plus every collaborator a reconciliation needs.
///
/// A fresh session id is minted each time a target is built. Deployment
/// records carrying another session id describe a previous connection epoch.
pub struct RuntimeTarget {
    runtime: SharedRuntime,
    dedicated: Option<Arc<dyn DedicatedRuntimeFactory>>,
    session_id: String,
    props: Arc<dyn PropertyStore>,
    consoles: Arc<dyn ConsoleProvider>,
    projects: Arc<dyn ProjectAccessor>,
    ports: Arc<dyn PortAllocator>,
    build_cache: Arc<BuildCache>,
    config: RuntimeConfig,
    build_config: BuildConfig,
}

impl RuntimeTarget {
    /// Start building a target around a shared runtime handle.
    pub fn builder(runtime: SharedRuntime) -> RuntimeTargetBuilder {
        RuntimeTargetBuilder::new(runtime)
    }

    /// Shared runtime handle.
    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    /// Session id of this connection epoch.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Persistent property store.
    pub fn props(&self) -> &Arc<dyn PropertyStore> {
        &self.props
    }

    /// Console provider.
    pub fn consoles(&self) -> &Arc<dyn ConsoleProvider> {
        &self.consoles
    }

    /// Project accessor.
    pub fn projects(&self) -> &Arc<dyn ProjectAccessor> {
        &self.projects
    }

    /// Host port allocator.
    pub fn ports(&self) -> &Arc<dyn PortAllocator> {
        &self.ports
    }

    /// Process-wide build cache.
    pub fn build_cache(&self) -> &Arc<BuildCache> {
        &self.build_cache
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Build configuration.
    pub fn build_config(&self) -> &BuildConfig {
        &self.build_config
    }

    /// Network name every application container joins.
    pub fn network(&self) -> &str {
        &self.config.network
    }

    /// Make sure the application network exists, creating a bridge network if absent.
    ///
    /// # Errors
    ///
    /// Returns error if the network cannot be listed or created.
    pub async fn ensure_network(&self) -> Result<String> {
        let name = self.config.network.as_str();
        if !self.runtime.list_networks(name).await?.is_empty() {
            debug!("Network {} already exists", name);
            return Ok(name.to_string());
        }

        match self.runtime.create_network(name).await {
            Ok(id) => {
                info!("Created network {} ({})", name, id);
                Ok(name.to_string())
            }
            // Lost a creation race
            Err(RuntimeError::Conflict(_)) => Ok(name.to_string()),
            Err(e) => Err(e),
        }
    }

    /// Runtime handle for a log stream.
    ///
    /// With `dedicated_log_client` enabled this opens an owned connection so
    /// long-lived streams do not tie up the shared connection pool; otherwise,
    /// or if opening fails, the shared handle is borrowed.
    pub async fn log_runtime(&self) -> Ownership {
        if self.config.dedicated_log_client
            && let Some(factory) = &self.dedicated
        {
            match factory.open().await {
                Ok(runtime) => return Ownership::Owned(runtime),
                Err(e) => warn!("Falling back to shared runtime for logs: {}", e),
            }
        }
        Ownership::Borrowed(self.runtime.clone())
    }
}

/// Builder for [`RuntimeTarget`].
pub struct RuntimeTargetBuilder {
    runtime: SharedRuntime,
    dedicated: Option<Arc<dyn DedicatedRuntimeFactory>>,
    session_id: Option<String>,
    props: Option<Arc<dyn PropertyStore>>,
    consoles: Option<Arc<dyn ConsoleProvider>>,
    projects: Option<Arc<dyn ProjectAccessor>>,
    ports: Option<Arc<dyn PortAllocator>>,
    build_cache: Option<Arc<BuildCache>>,
    config: RuntimeConfig,
    build_config: BuildConfig,
}

impl RuntimeTargetBuilder {
    fn new(runtime: SharedRuntime) -> Self {
        Self {
            runtime,
            dedicated: None,
            session_id: None,
            props: None,
            consoles: None,
            projects: None,
            ports: None,
            build_cache: None,
            config: RuntimeConfig::default(),
            build_config: BuildConfig::default(),
        }
    }

    /// Factory for dedicated log connections.
    pub fn dedicated(mut self, factory: Arc<dyn DedicatedRuntimeFactory>) -> Self {
        self.dedicated = Some(factory);
        self
    }

    /// Use a fixed session id instead of minting one.
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Persistent property store.
    pub fn props(mut self, props: Arc<dyn PropertyStore>) -> Self {
        self.props = Some(props);
        self
    }

    /// Console provider.
    pub fn consoles(mut self, consoles: Arc<dyn ConsoleProvider>) -> Self {
        self.consoles = Some(consoles);
        self
    }

    /// Project accessor.
    pub fn projects(mut self, projects: Arc<dyn ProjectAccessor>) -> Self {
        self.projects = Some(projects);
        self
    }

    /// Host port allocator.
    pub fn ports(mut self, ports: Arc<dyn PortAllocator>) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Build cache shared with other targets.
    pub fn build_cache(mut self, cache: Arc<BuildCache>) -> Self {
        self.build_cache = Some(cache);
        self
    }

    /// Runtime configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build configuration.
    pub fn build_config(mut self, config: BuildConfig) -> Self {
        self.build_config = config;
        self
    }

    /// Finish the target.
    pub fn build(self) -> RuntimeTarget {
        let session_id = self
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        debug!("Runtime session {}", session_id);

        RuntimeTarget {
            runtime: self.runtime,
            dedicated: self.dedicated,
            session_id,
            props: self
                .props
                .unwrap_or_else(|| Arc::new(MemoryPropertyStore::new())),
            consoles: self
                .consoles
                .unwrap_or_else(|| Arc::new(StdConsoleProvider)),
            projects: self.projects.unwrap_or_else(|| {
                Arc::new(WorkspaceProjects::new(
                    std::env::current_dir().unwrap_or_else(|_| ".".into()),
                ))
            }),
            ports: self
                .ports
                .unwrap_or_else(|| Arc::new(FreePortFinder::default())),
            build_cache: self
                .build_cache
                .unwrap_or_else(|| Arc::new(BuildCache::new())),
            config: self.config,
            build_config: self.build_config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerRuntime, InMemoryRuntime};

    #[tokio::test]
    async fn test_ensure_network_creates_once() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let target = RuntimeTarget::builder(runtime.clone()).build();

        assert_eq!(target.ensure_network().await.unwrap(), "dockyard-network");
        assert_eq!(target.ensure_network().await.unwrap(), "dockyard-network");
        assert_eq!(runtime.calls("create_network").len(), 1);
        assert_eq!(runtime.networks().len(), 1);
    }

    #[test]
    fn test_session_ids_differ_per_target() {
        let runtime: SharedRuntime = Arc::new(InMemoryRuntime::new());
        let a = RuntimeTarget::builder(runtime.clone()).build();
        let b = RuntimeTarget::builder(runtime).build();
        assert_ne!(a.session_id(), b.session_id());
    }

    #[tokio::test]
    async fn test_log_runtime_ownership() {
        let shared = Arc::new(InMemoryRuntime::new());
        let dedicated = Arc::new(InMemoryRuntime::new());
        let factory_handle = dedicated.clone();
        let factory = move || -> SharedRuntime { factory_handle.clone() };

        let borrowed = RuntimeTarget::builder(shared.clone())
            .dedicated(Arc::new(factory.clone()))
            .build();
        assert!(!borrowed.log_runtime().await.is_owned());

        let owned = RuntimeTarget::builder(shared)
            .dedicated(Arc::new(factory))
            .config(RuntimeConfig {
                dedicated_log_client: true,
                ..Default::default()
            })
            .build();
        let handle = owned.log_runtime().await;
        assert!(handle.is_owned());
        handle.runtime().ping().await.unwrap();
        handle.release();
        assert_eq!(dedicated.shutdown_count(), 1);
        assert_eq!(dedicated.calls("ping").len(), 1);
    }
}
