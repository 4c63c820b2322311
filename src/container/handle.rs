//! One live container.

use super::logs::LogBridge;
use super::{run_state_of, short_hash};
use crate::deploy::{Capabilities, Capability, Result, RunState, parse_system_properties};
use crate::env::{boot, labels};
use crate::runtime::{ContainerSnapshot, RuntimeError, RuntimeTarget, retry};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A container as last listed from the runtime.
///
/// Label-derived details (ports, properties, capabilities) come from the
/// snapshot; run state can be re-fetched with [`ContainerHandle::fetch_run_state`].
#[derive(Clone)]
pub struct ContainerHandle {
    target: Arc<RuntimeTarget>,
    snapshot: ContainerSnapshot,
}

impl ContainerHandle {
    /// Wrap a runtime snapshot.
    pub fn new(target: Arc<RuntimeTarget>, snapshot: ContainerSnapshot) -> Self {
        Self { target, snapshot }
    }

    /// Container id.
    pub fn id(&self) -> &str {
        &self.snapshot.id
    }

    /// Snapshot this handle was created from.
    pub fn snapshot(&self) -> &ContainerSnapshot {
        &self.snapshot
    }

    /// Application the container was created for.
    pub fn app_name(&self) -> Option<&str> {
        self.snapshot.label(labels::APP_NAME)
    }

    /// Build id the container was created with.
    pub fn build_id(&self) -> Option<&str> {
        self.snapshot.label(labels::BUILD_ID)
    }

    /// First 12 characters of the id.
    pub fn short_id(&self) -> &str {
        short_hash(&self.snapshot.id)
    }

    /// `name (shortid)`, or just the short id for unnamed containers.
    pub fn display_name(&self) -> String {
        match self.snapshot.names.first() {
            Some(name) => format!("{} ({})", name.trim_start_matches('/'), self.short_id()),
            None => self.short_id().to_string(),
        }
    }

    /// Run state as of the snapshot.
    pub fn run_state(&self) -> RunState {
        run_state_of(&self.snapshot)
    }

    /// Current run state, asked from the runtime.
    ///
    /// A container that no longer exists is [`RunState::Inactive`]; any other
    /// failure yields [`RunState::Unknown`].
    pub async fn fetch_run_state(&self) -> RunState {
        match self.probe_state().await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => RunState::Inactive,
            Err(e) => {
                warn!("Failed to fetch state of container {}: {}", self.short_id(), e);
                RunState::Unknown
            }
        }
    }

    async fn probe_state(&self) -> std::result::Result<RunState, RuntimeError> {
        let snapshot = self.target.runtime().inspect_container(self.id()).await?;
        Ok(run_state_of(&snapshot))
    }

    fn label_port(&self, key: &str) -> Option<u16> {
        self.snapshot
            .label(key)
            .and_then(|port| port.parse().ok())
            .filter(|port| *port > 0)
    }

    /// Local ports the application is reachable on.
    pub fn ports(&self) -> Vec<u16> {
        self.label_port(labels::APP_LOCAL_PORT).into_iter().collect()
    }

    /// Local remote-debug port, while the container is active.
    pub fn debug_port(&self) -> Option<u16> {
        if self.run_state().is_active() {
            self.label_port(labels::DEBUG_PORT)
        } else {
            None
        }
    }

    /// Local JMX port.
    pub fn jmx_port(&self) -> Option<u16> {
        self.label_port(labels::JMX_PORT)
    }

    /// JMX service URL.
    pub fn jmx_url(&self) -> Option<String> {
        self.jmx_port().map(jmx_url)
    }

    /// System properties the container was created with.
    pub fn system_properties(&self) -> BTreeMap<String, String> {
        self.snapshot
            .label(labels::SYSTEM_PROPS)
            .map(parse_system_properties)
            .unwrap_or_default()
    }

    /// Devtools remote secret the container was created with.
    pub fn devtools_secret(&self) -> Option<String> {
        self.system_properties().remove(boot::DEVTOOLS_SECRET_PROP)
    }

    /// Supported operations.
    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::of([
            Capability::Log,
            Capability::Delete,
            Capability::Restart,
            Capability::Pause,
        ]);
        if self.snapshot.label(labels::DEBUG_PORT).is_some() {
            caps.insert(Capability::Debug);
        }
        if self.jmx_port().is_some() {
            caps.insert(Capability::Jmx);
        }
        if self.devtools_secret().is_some() {
            caps.insert(Capability::ConnectDevtools);
        }
        caps
    }

    /// Drive the container towards `goal`.
    ///
    /// | current | active goal | `Inactive` | `Paused` |
    /// |---|---|---|---|
    /// | `Paused` | unpause | stop | nothing |
    /// | other | start | stop | pause |
    ///
    /// After the action the state is polled until it converges or the poll
    /// budget runs out. This is best effort: failures are logged, never
    /// returned.
    pub async fn set_goal_state(&self, goal: RunState) {
        let current = self.fetch_run_state().await;
        if current == goal {
            return;
        }

        let runtime = self.target.runtime();
        let id = self.id();
        let (action, outcome) = if goal.is_active() {
            if current == RunState::Paused {
                ("resume", runtime.unpause_container(id).await)
            } else {
                ("start", runtime.start_container(id).await)
            }
        } else if goal == RunState::Inactive {
            let timeout = self.target.config().stop_timeout();
            ("stop", runtime.stop_container(id, timeout).await)
        } else if goal == RunState::Paused {
            ("pause", runtime.pause_container(id).await)
        } else {
            warn!("Ignoring goal state {} for container {}", goal, self.short_id());
            return;
        };

        match outcome {
            Ok(()) => info!("Container {}: {}", self.display_name(), action),
            Err(e) if e.is_not_modified() => {
                debug!("Container {} already in effect: {}", self.short_id(), action)
            }
            Err(e) => {
                warn!("Failed to {} container {}: {}", action, self.short_id(), e);
                return;
            }
        }

        self.await_state(goal).await;
    }

    /// Poll until the state satisfies `goal`; an active goal accepts either active state.
    async fn await_state(&self, goal: RunState) -> Option<RunState> {
        let policy = self.target.config().poll_policy();
        let reached = |state: RunState| {
            if goal.is_active() {
                state.is_active()
            } else {
                state == goal
            }
        };
        match retry::until(&policy, || self.probe_state(), |r| matches!(r, Ok(s) if reached(*s))).await {
            Ok(Ok(state)) => Some(state),
            Ok(Err(_)) => None,
            Err(exhausted) => {
                warn!(
                    "Container {} did not reach {}: {}",
                    self.short_id(),
                    goal,
                    exhausted
                );
                None
            }
        }
    }

    /// Restart the container and wait for it to run again.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime refuses the restart.
    pub async fn restart(&self) -> Result<()> {
        self.capabilities().require(Capability::Restart)?;
        self.target.runtime().restart_container(self.id()).await?;
        self.await_state(RunState::Running).await;
        Ok(())
    }

    /// Force-remove the container and wait until the runtime no longer knows it.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime refuses the removal.
    pub async fn delete(&self) -> Result<()> {
        self.capabilities().require(Capability::Delete)?;
        let runtime = self.target.runtime();
        match runtime.remove_container(self.id(), true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let policy = self.target.config().poll_policy();
        let gone = retry::until(
            &policy,
            || runtime.inspect_container(self.id()),
            |r| matches!(r, Err(e) if e.is_not_found()),
        )
        .await;
        if let Err(exhausted) = gone {
            warn!("Container {} still present after delete: {}", self.short_id(), exhausted);
        }
        info!("Deleted container {}", self.display_name());
        Ok(())
    }

    /// Stream the container's logs to the console of its application.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::Unsupported`](crate::deploy::DeployError::Unsupported)
    /// if logs cannot be streamed.
    pub async fn connect_log(&self, include_history: bool) -> Result<LogBridge> {
        self.capabilities().require(Capability::Log)?;
        let console_name = match self.app_name() {
            Some(app) => app.to_string(),
            None => self.display_name(),
        };
        let console = self.target.consoles().console(&console_name);
        Ok(LogBridge::connect(&self.target, self.id(), console.as_ref(), include_history).await)
    }
}

/// JMX service URL for a local port.
pub fn jmx_url(port: u16) -> String {
    format!("service:jmx:rmi:///jndi/rmi://localhost:{}/jmxrmi", port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerRuntime, CreateContainerSpec, InMemoryRuntime, RuntimeConfig};
    use std::collections::HashMap;

    fn fixture() -> (Arc<InMemoryRuntime>, Arc<RuntimeTarget>) {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.add_image("sha256:aaa", &["demo:latest"]);
        let target = RuntimeTarget::builder(runtime.clone())
            .config(RuntimeConfig {
                poll_interval_ms: 1,
                poll_attempts: 5,
                ..Default::default()
            })
            .build();
        (runtime, Arc::new(target))
    }

    async fn create(
        runtime: &InMemoryRuntime,
        target: &Arc<RuntimeTarget>,
        extra_labels: &[(&str, &str)],
    ) -> ContainerHandle {
        let id = runtime
            .create_container(&CreateContainerSpec {
                image: "demo".to_string(),
                labels: extra_labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            })
            .await
            .unwrap();
        let snapshot = runtime.inspect_container(&id).await.unwrap();
        ContainerHandle::new(target.clone(), snapshot)
    }

    #[tokio::test]
    async fn test_goal_state_transitions() {
        let (runtime, target) = fixture();
        let container = create(&runtime, &target, &[]).await;
        assert_eq!(container.fetch_run_state().await, RunState::Starting);

        container.set_goal_state(RunState::Running).await;
        assert_eq!(container.fetch_run_state().await, RunState::Running);

        container.set_goal_state(RunState::Paused).await;
        assert_eq!(container.fetch_run_state().await, RunState::Paused);

        runtime.clear_journal();
        container.set_goal_state(RunState::Running).await;
        assert_eq!(runtime.calls("unpause_container").len(), 1);
        assert!(runtime.calls("start_container").is_empty());

        container.set_goal_state(RunState::Inactive).await;
        assert_eq!(container.fetch_run_state().await, RunState::Inactive);
    }

    #[tokio::test]
    async fn test_goal_state_already_reached_is_noop() {
        let (runtime, target) = fixture();
        let container = create(&runtime, &target, &[]).await;
        container.set_goal_state(RunState::Running).await;

        runtime.clear_journal();
        container.set_goal_state(RunState::Running).await;
        assert_eq!(runtime.journal(), vec![format!("inspect_container {}", container.id())]);
    }

    #[tokio::test]
    async fn test_debug_container_reaches_debugging() {
        let (runtime, target) = fixture();
        let container = create(&runtime, &target, &[(labels::DEBUG_PORT, "5005")]).await;
        container.set_goal_state(RunState::Debugging).await;
        assert_eq!(container.fetch_run_state().await, RunState::Debugging);
        assert!(container.capabilities().contains(Capability::Debug));
        // Snapshot predates the start
        assert_eq!(container.debug_port(), None);
    }

    #[tokio::test]
    async fn test_delete_waits_for_removal() {
        let (runtime, target) = fixture();
        let container = create(&runtime, &target, &[]).await;
        container.set_goal_state(RunState::Running).await;

        container.delete().await.unwrap();
        assert!(runtime.containers().is_empty());
        assert_eq!(container.fetch_run_state().await, RunState::Inactive);
        // Already gone
        container.delete().await.unwrap();
    }

    #[test]
    fn test_label_details() {
        let (_, target) = fixture();
        let container_labels: HashMap<String, String> = [
            (labels::APP_NAME, "demo"),
            (labels::APP_LOCAL_PORT, "45000"),
            (labels::DEBUG_PORT, "45001"),
            (labels::JMX_PORT, "45002"),
            (labels::SYSTEM_PROPS, r#"{"spring.devtools.remote.secret":"s3cr3t"}"#),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let container = ContainerHandle::new(
            target,
            ContainerSnapshot {
                id: "0123456789abcdef".to_string(),
                names: vec!["/demo-1".to_string()],
                labels: container_labels,
                state: "running".to_string(),
                ..Default::default()
            },
        );

        assert_eq!(container.display_name(), "demo-1 (0123456789ab)");
        assert_eq!(container.ports(), vec![45000]);
        assert_eq!(container.debug_port(), Some(45001));
        assert_eq!(
            container.jmx_url().as_deref(),
            Some("service:jmx:rmi:///jndi/rmi://localhost:45002/jmxrmi")
        );
        assert_eq!(container.devtools_secret().as_deref(), Some("s3cr3t"));
        assert_eq!(container.run_state(), RunState::Debugging);
        assert!(container.capabilities().contains(Capability::ConnectDevtools));
    }
}
