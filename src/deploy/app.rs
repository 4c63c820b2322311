//! Per-application reconciliation.

use super::params::{ContainerParams, validate_system_property};
use super::{Capabilities, Capability, DeployError, DeploymentRecord, Result, RunState};
use crate::build::BuildPipeline;
use crate::build::command::render_run_command;
use crate::console::{AppConsole, LogType};
use crate::container::handle::jmx_url;
use crate::container::{ContainerHandle, ImageHandle, LogBridge};
use crate::env::{boot, labels};
use crate::runtime::{ContainerFilter, RuntimeTarget};
use crate::store::{DeploymentStore, ImageLedger};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives the containers of one application towards its deployment record.
///
/// Desired-state changes go through the [`DeploymentStore`]; the runtime is
/// only touched by [`AppReconciler::synchronize`] and the teardown helpers.
/// Callers are expected to serialize calls per application.
pub struct AppReconciler {
    name: String,
    target: Arc<RuntimeTarget>,
    store: DeploymentStore,
    ledger: Arc<ImageLedger>,
    log_bridge: Mutex<Option<LogBridge>>,
}

impl AppReconciler {
    /// Reconciler for the application `name`.
    pub fn new(
        name: impl Into<String>,
        target: Arc<RuntimeTarget>,
        store: DeploymentStore,
        ledger: Arc<ImageLedger>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            store,
            ledger,
            log_bridge: Mutex::new(None),
        }
    }

    /// Application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current deployment record, if the application is deployed.
    pub fn record(&self) -> Option<DeploymentRecord> {
        self.store.get(&self.name)
    }

    fn console(&self) -> Arc<dyn AppConsole> {
        self.target.consoles().console(&self.name)
    }

    /// Converge the live containers of the application on `record`.
    ///
    /// A record from another runtime session is ignored. For an inactive
    /// record every container is stopped. For an active record containers
    /// created from another build id or other system properties are stopped,
    /// and a new image is built and run unless a matching container already
    /// is in the desired state.
    ///
    /// # Errors
    ///
    /// Returns error if containers cannot be listed, the project is not
    /// accessible, or building or creating the new container fails.
    pub async fn synchronize(&self, record: &DeploymentRecord) -> Result<()> {
        if record.is_stale(self.target.session_id()) {
            debug!(
                "Ignoring {} record from session {}",
                record.name, record.session_id
            );
            return Ok(());
        }

        let containers = self.fetch_containers().await?;
        let desired = record.desired_run_state;
        match desired {
            RunState::Inactive => {
                for container in &containers {
                    container.set_goal_state(RunState::Inactive).await;
                }
                Ok(())
            }
            RunState::Running | RunState::Debugging => {
                let mut converged = false;
                for container in &containers {
                    if record.matches_labels(&container.snapshot().labels) {
                        converged |= container.fetch_run_state().await == desired;
                    } else {
                        debug!("Stopping superseded container {}", container.display_name());
                        container.set_goal_state(RunState::Inactive).await;
                    }
                }
                if converged {
                    debug!("{} already {}", self.name, desired);
                    return Ok(());
                }
                self.start(record).await.map(|_| ())
            }
            other => Err(DeployError::InvalidGoalState(other)),
        }
    }

    async fn start(&self, record: &DeploymentRecord) -> Result<ContainerHandle> {
        if !self.target.projects().is_accessible(&self.name) {
            return Err(DeployError::ProjectNotAccessible(self.name.clone()));
        }

        let console = self.console();
        console.write(&format!("Deploying Docker app {}...", self.name), LogType::Stdout);
        let image = match BuildPipeline::new(&self.target, &self.ledger)
            .build(record, console.as_ref())
            .await
        {
            Ok(image) => image,
            Err(e) => {
                console.write(&e.to_string(), LogType::Stderr);
                return Err(e.into());
            }
        };
        self.run(record, &image, console.as_ref()).await
    }

    async fn run(
        &self,
        record: &DeploymentRecord,
        image: &str,
        console: &dyn AppConsole,
    ) -> Result<ContainerHandle> {
        let network = self.target.ensure_network().await?;
        let java_version = self
            .target
            .projects()
            .java_major_version(&self.name)
            .or(self.target.build_config().default_java_version);
        let params = ContainerParams::assemble(
            record,
            image,
            &network,
            self.target.config(),
            self.target.ports().as_ref(),
            java_version,
        )?;

        console.write(&format!("Running container with '{}'", image), LogType::Stdout);
        if let Some(port) = params.jmx_port {
            console.write(&format!("JMX URL = {}", jmx_url(port)), LogType::Stdout);
        }
        if let Some(port) = params.debug_port {
            console.write(&format!("Debug Port = {}", port), LogType::Stdout);
        }
        if let Some(opts) = &params.java_opts {
            console.write(&format!("JAVA_OPTS={}", opts), LogType::Stdout);
        }

        let runtime = self.target.runtime();
        let id = runtime.create_container(&params.spec).await?;
        console.write(&format!("Container created: {}", id), LogType::Stdout);
        console.log_command(&render_run_command(&params.spec));

        console.write(&format!("Starting container: {}", id), LogType::Stdout);
        let snapshot = runtime.inspect_container(&id).await?;
        let container = ContainerHandle::new(self.target.clone(), snapshot);
        container.set_goal_state(record.desired_run_state).await;

        if let Some(port) = params.app_port {
            console.write(
                &format!("Ports: {}->{}", port, self.target.config().app_port),
                LogType::Stdout,
            );
        }
        console.write(&format!("Container Network: {}", network), LogType::Stdout);
        console.write(&format!("Network alias: {}", self.name), LogType::Stdout);

        self.attach_logs(&container).await;
        console.write(&format!("DONE Deploying Docker app {}", self.name), LogType::Stdout);
        info!("Deployed {} as container {}", self.name, container.short_id());
        Ok(container)
    }

    async fn attach_logs(&self, container: &ContainerHandle) {
        match container.connect_log(true).await {
            Ok(bridge) => {
                if let Some(previous) = lock(&self.log_bridge).replace(bridge) {
                    previous.close();
                }
            }
            Err(e) => warn!("Not streaming logs of {}: {}", container.display_name(), e),
        }
    }

    /// Close the log stream of the last container started, if any.
    pub fn close_logs(&self) {
        if let Some(bridge) = lock(&self.log_bridge).take() {
            bridge.close();
        }
    }

    /// Log bridge of the last container started.
    pub fn log_bridge(&self) -> Option<LogBridge> {
        lock(&self.log_bridge).clone()
    }

    fn require_record(&self) -> Result<DeploymentRecord> {
        self.record()
            .ok_or_else(|| DeployError::UnknownApp(self.name.clone()))
    }

    /// Request a fresh build in `state` within the current session.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::InvalidGoalState`] unless `state` is active and
    /// [`DeployError::UnknownApp`] if the application is not deployed.
    pub fn restart(&self, state: RunState) -> Result<DeploymentRecord> {
        if !state.is_active() {
            return Err(DeployError::InvalidGoalState(state));
        }
        self.capabilities().require(Capability::Restart)?;
        let session = self.target.session_id().to_string();
        self.store
            .modify(&self.name, |record| *record = record.redeployed(state, &session))
            .ok_or_else(|| DeployError::UnknownApp(self.name.clone()))
    }

    /// Change the desired run state. Nothing happens when it already is `state`.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::InvalidGoalState`] for a state that is only ever
    /// observed and [`DeployError::UnknownApp`] if the application is not deployed.
    pub fn set_goal_state(&self, state: RunState) -> Result<DeploymentRecord> {
        if !state.is_desirable() {
            return Err(DeployError::InvalidGoalState(state));
        }
        let current = self.require_record()?;
        if current.desired_run_state == state {
            return Ok(current);
        }
        let session = self.target.session_id().to_string();
        self.store
            .modify(&self.name, |record| *record = record.with_goal_state(state, &session))
            .ok_or_else(|| DeployError::UnknownApp(self.name.clone()))
    }

    /// Set (or with `None`, clear) a system property.
    ///
    /// The build id is kept; containers no longer match because their
    /// properties label differs.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::InvalidSystemProperty`] for a value containing
    /// whitespace or control characters and [`DeployError::UnknownApp`] if
    /// the application is not deployed.
    pub fn set_system_property(&self, key: &str, value: Option<&str>) -> Result<DeploymentRecord> {
        if let Some(value) = value {
            validate_system_property(key, value)?;
        }
        let session = self.target.session_id().to_string();
        self.store
            .modify(&self.name, |record| {
                match value {
                    Some(value) => {
                        record.system_properties.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        record.system_properties.remove(key);
                    }
                }
                record.session_id = session;
            })
            .ok_or_else(|| DeployError::UnknownApp(self.name.clone()))
    }

    /// Current value of a system property.
    pub fn system_property(&self, key: &str) -> Option<String> {
        self.record()
            .and_then(|record| record.system_properties.get(key).cloned())
    }

    /// Remove the deployment record. Teardown follows through the store listener.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::UnknownApp`] if the application is not deployed.
    pub fn delete(&self) -> Result<DeploymentRecord> {
        self.capabilities().require(Capability::Delete)?;
        self.store
            .remove(&self.name)
            .ok_or_else(|| DeployError::UnknownApp(self.name.clone()))
    }

    /// Devtools remote secret of the record.
    pub fn devtools_secret(&self) -> Option<String> {
        self.system_property(boot::DEVTOOLS_SECRET_PROP)
    }

    /// Whether the project currently has devtools on its classpath.
    pub fn has_devtools_dependency(&self) -> bool {
        self.target.projects().classpath_flags(&self.name).devtools
    }

    /// Supported operations.
    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::of([
            Capability::Log,
            Capability::Debug,
            Capability::Delete,
            Capability::Restart,
            Capability::Pause,
        ]);
        if self.has_devtools_dependency() {
            caps.insert(Capability::ConnectDevtools);
        }
        if self.target.config().jmx_enabled {
            caps.insert(Capability::Jmx);
        }
        caps
    }

    /// Every container labelled with the application name, stopped ones included.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime cannot list containers.
    pub async fn fetch_containers(&self) -> Result<Vec<ContainerHandle>> {
        let filter = ContainerFilter::all().label(labels::APP_NAME, &self.name);
        Ok(self
            .target
            .runtime()
            .list_containers(&filter)
            .await?
            .into_iter()
            .map(|snapshot| ContainerHandle::new(self.target.clone(), snapshot))
            .collect())
    }

    /// Images built for the application that still exist.
    ///
    /// Persisted image ids the runtime no longer knows are forgotten.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime cannot list images.
    pub async fn fetch_images(&self) -> Result<Vec<ImageHandle>> {
        let persisted: HashSet<String> = self.ledger.images(&self.name).into_iter().collect();
        if persisted.is_empty() {
            return Ok(Vec::new());
        }

        let images: Vec<ImageHandle> = self
            .target
            .runtime()
            .list_images(None)
            .await?
            .into_iter()
            .filter(|image| persisted.contains(&image.id))
            .map(|image| {
                ImageHandle::new(self.target.clone(), self.ledger.clone(), &self.name, image)
            })
            .collect();

        let live: HashSet<String> = images.iter().map(|image| image.id().to_string()).collect();
        match self.ledger.retain(&self.name, &live) {
            Ok(pruned) if !pruned.is_empty() => {
                debug!("Forgot {} vanished images of {}", pruned.len(), self.name)
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to prune image ids of {}: {}", self.name, e),
        }
        Ok(images)
    }

    /// Pause every active container. Returns how many were paused.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime cannot list containers.
    pub async fn pause(&self) -> Result<usize> {
        self.capabilities().require(Capability::Pause)?;
        let mut paused = 0;
        for container in self.fetch_containers().await? {
            if container.run_state().is_active() {
                container.set_goal_state(RunState::Paused).await;
                paused += 1;
            }
        }
        Ok(paused)
    }

    /// Resume every paused container. Returns how many were resumed.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime cannot list containers.
    pub async fn resume(&self) -> Result<usize> {
        self.capabilities().require(Capability::Pause)?;
        let goal = self
            .record()
            .map(|record| record.desired_run_state)
            .filter(|state| state.is_active())
            .unwrap_or(RunState::Running);
        let mut resumed = 0;
        for container in self.fetch_containers().await? {
            if container.run_state() == RunState::Paused {
                container.set_goal_state(goal).await;
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Tear the application down: close its log stream, then delete its
    /// containers and the images built for it.
    ///
    /// Failures are logged and do not stop the teardown.
    pub async fn destroy(&self) {
        self.close_logs();

        match self.fetch_containers().await {
            Ok(containers) => {
                for container in containers {
                    if let Err(e) = container.delete().await {
                        warn!("Failed to delete container {}: {}", container.display_name(), e);
                    }
                }
            }
            Err(e) => warn!("Failed to list containers of {}: {}", self.name, e),
        }

        match self.fetch_images().await {
            Ok(images) => {
                for image in images {
                    if let Err(e) = image.delete().await {
                        warn!("Failed to delete image {}: {}", image.display_name(), e);
                    }
                }
            }
            Err(e) => warn!("Failed to list images of {}: {}", self.name, e),
        }
        info!("Destroyed {}", self.name);
    }
}
