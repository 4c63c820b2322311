//! In-process container runtime.
//!
//! Models containers, images and networks with Docker's state transitions and
//! error conventions (304 for no-op state changes, 404 for unknown objects,
//! 409 for conflicting requests). Every call is appended to a journal so tests
//! can assert exactly which runtime operations a reconciliation performed.

use super::{
    ContainerFilter, ContainerRuntime, ContainerSnapshot, CreateContainerSpec, ImageSnapshot,
    LogFrame, LogStream, LogStreamOptions, NetworkSnapshot, Result, RuntimeError,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredContainer {
    snapshot: ContainerSnapshot,
    image_id: String,
}

#[derive(Default)]
struct State {
    containers: Vec<StoredContainer>,
    images: Vec<ImageSnapshot>,
    networks: Vec<NetworkSnapshot>,
    log_frames: HashMap<String, Vec<LogFrame>>,
    default_frames: Vec<LogFrame>,
    log_requests: Vec<(String, LogStreamOptions)>,
}

/// In-memory [`ContainerRuntime`] with a call journal.
#[derive(Default)]
pub struct InMemoryRuntime {
    state: Mutex<State>,
    journal: Mutex<Vec<String>>,
    shutdowns: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn new_id() -> String {
    format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
}

fn tag_matches_reference(tag: &str, reference: &str) -> bool {
    if tag == reference {
        return true;
    }
    let has_tag = reference
        .rsplit('/')
        .next()
        .is_some_and(|last| last.contains(':'));
    !has_tag && tag.strip_prefix(reference).is_some_and(|rest| rest.starts_with(':'))
}

impl InMemoryRuntime {
    /// Create an empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, entry: String) {
        lock(&self.journal).push(entry);
    }

    /// Register an image. Returns its snapshot.
    pub fn add_image(&self, id: &str, tags: &[&str]) -> ImageSnapshot {
        let image = ImageSnapshot {
            id: id.to_string(),
            repo_tags: tags.iter().map(|t| t.to_string()).collect(),
        };
        let mut state = lock(&self.state);
        state.images.retain(|i| i.id != image.id);
        state.images.push(image.clone());
        image
    }

    /// Insert a pre-existing container.
    ///
    /// `image` may be an image id or tag; it is resolved against registered
    /// images for ancestor filtering.
    pub fn seed_container(&self, snapshot: ContainerSnapshot) {
        let mut state = lock(&self.state);
        let image_id = Self::resolve_image(&state, &snapshot.image)
            .map(|i| i.id.clone())
            .unwrap_or_else(|| snapshot.image.clone());
        state.containers.push(StoredContainer { snapshot, image_id });
    }

    /// Frames replayed by every log stream that has no container specific script.
    pub fn script_logs(&self, frames: Vec<LogFrame>) {
        lock(&self.state).default_frames = frames;
    }

    /// Frames replayed by log streams of one container.
    pub fn script_container_logs(&self, id: &str, frames: Vec<LogFrame>) {
        lock(&self.state).log_frames.insert(id.to_string(), frames);
    }

    /// All containers currently known.
    pub fn containers(&self) -> Vec<ContainerSnapshot> {
        lock(&self.state)
            .containers
            .iter()
            .map(|c| c.snapshot.clone())
            .collect()
    }

    /// Look up one container.
    pub fn container(&self, id: &str) -> Option<ContainerSnapshot> {
        lock(&self.state)
            .containers
            .iter()
            .find(|c| c.snapshot.id == id)
            .map(|c| c.snapshot.clone())
    }

    /// All images currently known.
    pub fn images(&self) -> Vec<ImageSnapshot> {
        lock(&self.state).images.clone()
    }

    /// All networks currently known.
    pub fn networks(&self) -> Vec<NetworkSnapshot> {
        lock(&self.state).networks.clone()
    }

    /// Options of every log attachment so far.
    pub fn log_requests(&self) -> Vec<(String, LogStreamOptions)> {
        lock(&self.state).log_requests.clone()
    }

    /// Journal of runtime calls, formatted as `<operation> <subject>`.
    pub fn journal(&self) -> Vec<String> {
        lock(&self.journal).clone()
    }

    /// Journal entries for one operation.
    pub fn calls(&self, operation: &str) -> Vec<String> {
        lock(&self.journal)
            .iter()
            .filter(|entry| entry.split(' ').next() == Some(operation))
            .cloned()
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_journal(&self) {
        lock(&self.journal).clear();
    }

    /// Number of times [`ContainerRuntime::shutdown`] was invoked.
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    fn resolve_image<'a>(state: &'a State, name: &str) -> Option<&'a ImageSnapshot> {
        state.images.iter().find(|image| {
            image.id == name
                || image.id == format!("sha256:{}", name)
                || (name.len() >= 12 && image.id.trim_start_matches("sha256:").starts_with(name))
                || image
                    .repo_tags
                    .iter()
                    .any(|tag| tag == name || *tag == format!("{}:latest", name))
        })
    }

    fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ContainerSnapshot) -> Result<T>,
    ) -> Result<T> {
        let mut state = lock(&self.state);
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.snapshot.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {}", id)))?;
        f(&mut container.snapshot)
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn ping(&self) -> Result<()> {
        self.record("ping".to_string());
        Ok(())
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSnapshot>> {
        self.record("list_containers".to_string());
        Ok(lock(&self.state)
            .containers
            .iter()
            .filter(|c| filter.matches(&c.snapshot, Some(&c.image_id)))
            .map(|c| c.snapshot.clone())
            .collect())
    }

    async fn create_container(&self, spec: &CreateContainerSpec) -> Result<String> {
        self.record(format!("create_container {}", spec.image));
        let mut state = lock(&self.state);
        let image_id = Self::resolve_image(&state, &spec.image)
            .map(|i| i.id.clone())
            .ok_or_else(|| RuntimeError::NotFound(format!("No such image: {}", spec.image)))?;
        if let Some(network) = &spec.network
            && !state.networks.iter().any(|n| &n.name == network)
        {
            return Err(RuntimeError::NotFound(format!("No such network: {}", network)));
        }

        let id = new_id();
        let name = match spec.aliases.first() {
            Some(alias) => format!("/{}-{}", alias, &id[..8]),
            None => format!("/{}", &id[..12]),
        };
        state.containers.push(StoredContainer {
            snapshot: ContainerSnapshot {
                id: id.clone(),
                names: vec![name],
                image: spec.image.clone(),
                labels: spec.labels.iter().cloned().collect(),
                state: "created".to_string(),
            },
            image_id,
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(format!("start_container {}", id));
        self.with_container(id, |c| match c.state.as_str() {
            "running" => Err(RuntimeError::NotModified(id.to_string())),
            "paused" => Err(RuntimeError::Conflict(format!("Container {} is paused", id))),
            _ => {
                c.state = "running".to_string();
                Ok(())
            }
        })
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.record(format!("stop_container {}", id));
        self.with_container(id, |c| match c.state.as_str() {
            "running" | "paused" | "restarting" => {
                c.state = "exited".to_string();
                Ok(())
            }
            _ => Err(RuntimeError::NotModified(id.to_string())),
        })
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        self.record(format!("restart_container {}", id));
        self.with_container(id, |c| {
            c.state = "running".to_string();
            Ok(())
        })
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        self.record(format!("pause_container {}", id));
        self.with_container(id, |c| match c.state.as_str() {
            "running" => {
                c.state = "paused".to_string();
                Ok(())
            }
            other => Err(RuntimeError::Conflict(format!(
                "Container {} is not running ({})",
                id, other
            ))),
        })
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        self.record(format!("unpause_container {}", id));
        self.with_container(id, |c| match c.state.as_str() {
            "paused" => {
                c.state = "running".to_string();
                Ok(())
            }
            _ => Err(RuntimeError::Conflict(format!("Container {} is not paused", id))),
        })
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        self.record(format!("remove_container {}", id));
        let mut state = lock(&self.state);
        let index = state
            .containers
            .iter()
            .position(|c| c.snapshot.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {}", id)))?;
        if !force && matches!(state.containers[index].snapshot.state.as_str(), "running" | "paused") {
            return Err(RuntimeError::Conflict(format!(
                "Cannot remove running container {}",
                id
            )));
        }
        state.containers.remove(index);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerSnapshot> {
        self.record(format!("inspect_container {}", id));
        self.with_container(id, |c| Ok(c.clone()))
    }

    async fn list_images(&self, reference: Option<&str>) -> Result<Vec<ImageSnapshot>> {
        self.record(format!("list_images {}", reference.unwrap_or("*")));
        Ok(lock(&self.state)
            .images
            .iter()
            .filter(|image| match reference {
                Some(reference) => image
                    .repo_tags
                    .iter()
                    .any(|tag| tag_matches_reference(tag, reference)),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn inspect_image(&self, name: &str) -> Result<ImageSnapshot> {
        self.record(format!("inspect_image {}", name));
        let state = lock(&self.state);
        Self::resolve_image(&state, name)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("No such image: {}", name)))
    }

    async fn remove_image(&self, id: &str, force: bool, _noprune: bool) -> Result<()> {
        self.record(format!("remove_image {}", id));
        let mut state = lock(&self.state);
        let image_id = Self::resolve_image(&state, id)
            .map(|i| i.id.clone())
            .ok_or_else(|| RuntimeError::NotFound(format!("No such image: {}", id)))?;
        if !force && state.containers.iter().any(|c| c.image_id == image_id) {
            return Err(RuntimeError::Conflict(format!(
                "Image {} is used by a container",
                id
            )));
        }
        state.images.retain(|i| i.id != image_id);
        Ok(())
    }

    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkSnapshot>> {
        self.record(format!("list_networks {}", name));
        Ok(lock(&self.state)
            .networks
            .iter()
            .filter(|n| n.name == name)
            .cloned()
            .collect())
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        self.record(format!("create_network {}", name));
        let mut state = lock(&self.state);
        if state.networks.iter().any(|n| n.name == name) {
            return Err(RuntimeError::Conflict(format!("Network {} already exists", name)));
        }
        let id = new_id();
        state.networks.push(NetworkSnapshot {
            id: id.clone(),
            name: name.to_string(),
            driver: "bridge".to_string(),
        });
        Ok(id)
    }

    async fn logs(&self, id: &str, options: &LogStreamOptions) -> Result<LogStream> {
        self.record(format!("logs {}", id));
        let mut state = lock(&self.state);
        if !state.containers.iter().any(|c| c.snapshot.id == id) {
            return Err(RuntimeError::NotFound(format!("No such container: {}", id)));
        }
        state.log_requests.push((id.to_string(), options.clone()));

        let frames = state
            .log_frames
            .get(id)
            .cloned()
            .unwrap_or_else(|| state.default_frames.clone())
            .into_iter()
            .filter(|frame| match frame {
                LogFrame::StdOut(_) => options.stdout,
                LogFrame::StdErr(_) => options.stderr,
                _ => true,
            })
            .map(Ok);

        let replay = futures::stream::iter(frames.collect::<Vec<_>>());
        if options.follow {
            Ok(replay.chain(futures::stream::pending()).boxed())
        } else {
            Ok(replay.boxed())
        }
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(image: &str) -> CreateContainerSpec {
        CreateContainerSpec {
            image: image.to_string(),
            labels: vec![("app".to_string(), "demo".to_string())],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let runtime = InMemoryRuntime::new();
        runtime.add_image("sha256:aaa", &["demo:latest"]);

        let id = runtime.create_container(&spec("demo")).await.unwrap();
        assert_eq!(runtime.inspect_container(&id).await.unwrap().state, "created");

        runtime.start_container(&id).await.unwrap();
        assert!(runtime.start_container(&id).await.unwrap_err().is_not_modified());

        runtime.pause_container(&id).await.unwrap();
        assert_eq!(runtime.inspect_container(&id).await.unwrap().state, "paused");
        runtime.unpause_container(&id).await.unwrap();

        assert!(matches!(
            runtime.remove_container(&id, false).await,
            Err(RuntimeError::Conflict(_))
        ));
        runtime.stop_container(&id, Duration::from_secs(1)).await.unwrap();
        assert!(
            runtime
                .stop_container(&id, Duration::from_secs(1))
                .await
                .unwrap_err()
                .is_not_modified()
        );
        runtime.remove_container(&id, false).await.unwrap();
        assert!(runtime.inspect_container(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_requires_image() {
        let runtime = InMemoryRuntime::new();
        let err = runtime.create_container(&spec("missing")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_image_reference_filter() {
        let runtime = InMemoryRuntime::new();
        runtime.add_image("sha256:aaa", &["demo:0.1", "demo:latest"]);
        runtime.add_image("sha256:bbb", &["demo-other:latest"]);

        assert_eq!(runtime.list_images(Some("demo")).await.unwrap().len(), 1);
        assert_eq!(runtime.list_images(Some("demo:0.1")).await.unwrap().len(), 1);
        assert!(runtime.list_images(Some("demo:0.2")).await.unwrap().is_empty());
        assert_eq!(
            runtime.inspect_image("sha256:bbb").await.unwrap().repo_tags,
            vec!["demo-other:latest".to_string()]
        );
    }

    #[tokio::test]
    async fn test_journal() {
        let runtime = InMemoryRuntime::new();
        runtime.create_network("net").await.unwrap();
        runtime.list_networks("net").await.unwrap();
        assert_eq!(runtime.journal(), vec!["create_network net", "list_networks net"]);
        assert_eq!(runtime.calls("list_networks").len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_logs_without_follow() {
        let runtime = InMemoryRuntime::new();
        runtime.add_image("sha256:aaa", &["demo:latest"]);
        let id = runtime.create_container(&spec("demo")).await.unwrap();
        runtime.script_logs(vec![
            LogFrame::StdOut(b"out\n".to_vec()),
            LogFrame::StdErr(b"err\n".to_vec()),
        ]);

        let options = LogStreamOptions {
            follow: false,
            stderr: false,
            ..Default::default()
        };
        let frames: Vec<_> = runtime.logs(&id, &options).await.unwrap().collect().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap(), &LogFrame::StdOut(b"out\n".to_vec()));
    }
}
