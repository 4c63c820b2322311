//! Docker/Podman runtime over the bollard API.
//!
//! Connection handling follows the usual fallback chain: local defaults
//! (Unix socket or Windows named pipe, honouring `DOCKER_HOST`), then the
//! rootless Podman socket, then the system Podman socket.

use super::{
    ContainerFilter, ContainerRuntime, ContainerSnapshot, CreateContainerSpec,
    DedicatedRuntimeFactory, ImageSnapshot, LogFrame, LogStream, LogStreamOptions,
    NetworkSnapshot, Result, RuntimeError, SharedRuntime,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{
    ContainerCreateBody, EndpointSettings, HostConfig, NetworkCreateRequest, NetworkingConfig,
    PortBinding,
};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions, ListImagesOptions,
    ListNetworksOptions, LogsOptions, RemoveContainerOptions, RemoveImageOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Docker runtime configuration.
#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Connection timeout in seconds
    pub timeout: u64,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self { timeout: 120 }
    }
}

/// bollard-backed [`ContainerRuntime`].
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect with default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if neither Docker nor Podman are available or the ping fails.
    pub async fn connect() -> Result<Self> {
        Self::with_config(DockerRuntimeConfig::default()).await
    }

    /// Connect with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns error if connection to the container runtime fails.
    pub async fn with_config(config: DockerRuntimeConfig) -> Result<Self> {
        let docker = Self::open(config.timeout)?;
        let runtime = Self { docker };
        runtime.ping().await?;
        Ok(runtime)
    }

    fn open(timeout: u64) -> Result<Docker> {
        debug!("Attempting to connect to container runtime...");

        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("Connected to container runtime via local defaults");
                return Ok(docker);
            }
            Err(e) => {
                debug!("Local defaults failed: {}", e);
            }
        }

        #[cfg(unix)]
        {
            if let Ok(home) = std::env::var("HOME") {
                let podman_socket = format!("unix://{}/run/podman/podman.sock", home);
                debug!("Trying Podman socket: {}", podman_socket);

                match Docker::connect_with_socket(
                    &podman_socket,
                    timeout,
                    bollard::API_DEFAULT_VERSION,
                ) {
                    Ok(docker) => {
                        info!("Connected to Podman via rootless socket");
                        return Ok(docker);
                    }
                    Err(e) => {
                        debug!("Podman rootless socket failed: {}", e);
                    }
                }
            }

            let system_socket = "unix:///run/podman/podman.sock";
            debug!("Trying system Podman socket: {}", system_socket);

            match Docker::connect_with_socket(system_socket, timeout, bollard::API_DEFAULT_VERSION)
            {
                Ok(docker) => {
                    info!("Connected to Podman via system socket");
                    return Ok(docker);
                }
                Err(e) => {
                    debug!("Podman system socket failed: {}", e);
                }
            }
        }

        #[cfg(not(unix))]
        let _ = timeout;

        Err(RuntimeError::Unavailable(
            "Failed to connect to Docker or Podman. Please ensure Docker or Podman is installed and running.".to_string(),
        ))
    }

    /// Get the underlying bollard client.
    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

/// Opens a new [`DockerRuntime`] connection per call.
#[derive(Debug, Clone, Default)]
pub struct DockerRuntimeFactory {
    config: DockerRuntimeConfig,
}

impl DockerRuntimeFactory {
    /// Create a factory using the given configuration.
    pub fn new(config: DockerRuntimeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DedicatedRuntimeFactory for DockerRuntimeFactory {
    async fn open(&self) -> Result<SharedRuntime> {
        let runtime = DockerRuntime::with_config(self.config.clone()).await?;
        Ok(Arc::new(runtime))
    }
}

/// Map 404/304 responses to the dedicated variants.
fn map_error(subject: &str, e: bollard::errors::Error) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(subject.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        } => RuntimeError::NotModified(subject.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(format!("{}: {}", subject, message)),
        e => RuntimeError::ApiError(e),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("Failed to ping container runtime: {}", e)))?;
        debug!("Container runtime ping successful");
        Ok(())
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSnapshot>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: filter.all,
                filters: Some(filter.to_filter_map()),
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSnapshot {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                state: c.state.map(|s| s.to_string()).unwrap_or_default(),
            })
            .collect())
    }

    async fn create_container(&self, spec: &CreateContainerSpec) -> Result<String> {
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for mapping in &spec.port_bindings {
            port_bindings
                .entry(mapping.container_port_key())
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: Some(mapping.host_ip.clone()),
                    host_port: Some(mapping.host_port.to_string()),
                });
        }

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed_ports
            .iter()
            .map(|p| (p.clone(), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let networking_config = spec.network.as_ref().map(|network| {
            let endpoint = EndpointSettings {
                aliases: Some(spec.aliases.clone()),
                ..Default::default()
            };
            NetworkingConfig {
                endpoints_config: Some(HashMap::from([(network.clone(), endpoint)])),
            }
        });

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.iter().cloned().collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(None::<CreateContainerOptions>, config)
            .await
            .map_err(|e| map_error(&spec.image, e))?;

        for warning in &response.warnings {
            warn!("Container create warning: {}", warning);
        }
        info!("Created container {} from {}", response.id, spec.image);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| map_error(id, e))
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: Some(timeout.as_secs() as i32),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_error(id, e))
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        self.docker
            .restart_container(id, None::<RestartContainerOptions>)
            .await
            .map_err(|e| map_error(id, e))
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        self.docker
            .pause_container(id)
            .await
            .map_err(|e| map_error(id, e))
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(|e| map_error(id, e))
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_error(id, e))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerSnapshot> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(id, e))?;

        let config = inspect.config.unwrap_or_default();
        let state = inspect
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_default();

        Ok(ContainerSnapshot {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            names: inspect.name.into_iter().collect(),
            image: config.image.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            state,
        })
    }

    async fn list_images(&self, reference: Option<&str>) -> Result<Vec<ImageSnapshot>> {
        let mut filters = HashMap::new();
        if let Some(reference) = reference {
            filters.insert("reference".to_string(), vec![reference.to_string()]);
        }

        let images = self
            .docker
            .list_images(Some(ListImagesOptions {
                all: false,
                filters: Some(filters),
                ..Default::default()
            }))
            .await?;

        Ok(images
            .into_iter()
            .map(|img| ImageSnapshot {
                id: img.id,
                repo_tags: img.repo_tags,
            })
            .collect())
    }

    async fn inspect_image(&self, name: &str) -> Result<ImageSnapshot> {
        let image = self
            .docker
            .inspect_image(name)
            .await
            .map_err(|e| map_error(name, e))?;

        Ok(ImageSnapshot {
            id: image.id.unwrap_or_else(|| name.to_string()),
            repo_tags: image.repo_tags.unwrap_or_default(),
        })
    }

    async fn remove_image(&self, id: &str, force: bool, noprune: bool) -> Result<()> {
        self.docker
            .remove_image(
                id,
                Some(RemoveImageOptions { force, noprune }),
                None,
            )
            .await
            .map_err(|e| map_error(id, e))?;
        info!("Removed image: {}", id);
        Ok(())
    }

    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkSnapshot>> {
        let filters = HashMap::from([("name".to_string(), vec![name.to_string()])]);
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions {
                filters: Some(filters),
            }))
            .await?;

        // The name filter matches substrings
        Ok(networks
            .into_iter()
            .map(|n| NetworkSnapshot {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
                driver: n.driver.unwrap_or_default(),
            })
            .filter(|n| n.name == name)
            .collect())
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        let response = self
            .docker
            .create_network(NetworkCreateRequest {
                name: name.to_string(),
                driver: Some("bridge".to_string()),
                ..Default::default()
            })
            .await
            .map_err(|e| map_error(name, e))?;

        info!("Created network: {} ({})", name, response.id);
        Ok(response.id)
    }

    async fn logs(&self, id: &str, options: &LogStreamOptions) -> Result<LogStream> {
        // Fail fast on unknown containers instead of yielding an error frame later.
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(id, e))?;

        let (tx, rx) = mpsc::unbounded_channel::<Result<LogFrame>>();
        let docker = self.docker.clone();
        let id = id.to_string();
        let options = options.clone();

        tokio::spawn(async move {
            let mut stream = docker.logs(
                &id,
                Some(LogsOptions {
                    follow: options.follow,
                    stdout: options.stdout,
                    stderr: options.stderr,
                    since: options.since.unwrap_or(0) as i32,
                    tail: "all".to_string(),
                    ..Default::default()
                }),
            );

            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!("Log receiver for {} dropped", id);
                        break;
                    }
                    next = stream.next() => {
                        let Some(next) = next else { break };
                        let frame = next
                            .map(|output| match output {
                                LogOutput::StdOut { message } => LogFrame::StdOut(message.to_vec()),
                                LogOutput::StdErr { message } => LogFrame::StdErr(message.to_vec()),
                                LogOutput::StdIn { message } => LogFrame::StdIn(message.to_vec()),
                                LogOutput::Console { message } => LogFrame::Console(message.to_vec()),
                            })
                            .map_err(|e| map_error(&id, e));
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed())
    }
}
