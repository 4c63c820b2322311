//! Images built for an application.

use super::handle::ContainerHandle;
use super::short_hash;
use crate::deploy::{Capabilities, Capability, Result};
use crate::env::labels;
use crate::runtime::{ContainerFilter, ImageSnapshot, RuntimeTarget, retry};
use crate::store::ImageLedger;
use std::sync::Arc;
use tracing::{info, warn};

/// An image recorded in an application's image ledger that still exists in
/// the runtime.
#[derive(Clone)]
pub struct ImageHandle {
    target: Arc<RuntimeTarget>,
    ledger: Arc<ImageLedger>,
    app: String,
    snapshot: ImageSnapshot,
}

impl ImageHandle {
    /// Wrap a runtime image belonging to `app`.
    pub fn new(
        target: Arc<RuntimeTarget>,
        ledger: Arc<ImageLedger>,
        app: impl Into<String>,
        snapshot: ImageSnapshot,
    ) -> Self {
        Self {
            target,
            ledger,
            app: app.into(),
            snapshot,
        }
    }

    /// Image id.
    pub fn id(&self) -> &str {
        &self.snapshot.id
    }

    /// Application the image was built for.
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Snapshot this handle was created from.
    pub fn snapshot(&self) -> &ImageSnapshot {
        &self.snapshot
    }

    /// First 12 hex characters of the id.
    pub fn short_id(&self) -> &str {
        short_hash(&self.snapshot.id)
    }

    /// `repo:tag1, tag2 (shorthash)`.
    ///
    /// The repository is taken from the first tag; tags are sorted.
    pub fn display_name(&self) -> String {
        let repo = self
            .snapshot
            .repo_tags
            .first()
            .and_then(|tag| tag.split_once(':'))
            .map(|(repo, _)| repo);
        let mut tags: Vec<&str> = self
            .snapshot
            .repo_tags
            .iter()
            .filter_map(|tag| tag.split_once(':').map(|(_, t)| t))
            .collect();
        tags.sort_unstable();

        let mut name = repo.unwrap_or("<none>").to_string();
        if !tags.is_empty() {
            name.push(':');
            name.push_str(&tags.join(", "));
        }
        format!("{} ({})", name, self.short_id())
    }

    /// Whether the image was built with devtools on its classpath.
    pub fn has_devtools_dependency(&self) -> bool {
        self.ledger.flags(self.id()).devtools
    }

    /// Whether the image was built with actuators on its classpath.
    pub fn has_actuator_dependency(&self) -> bool {
        self.ledger.flags(self.id()).actuator
    }

    /// Supported operations.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::of([Capability::Delete])
    }

    /// Containers of this application created from this image.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime cannot list containers.
    pub async fn fetch_containers(&self) -> Result<Vec<ContainerHandle>> {
        let filter = ContainerFilter::all()
            .ancestor(self.id())
            .label(labels::APP_NAME, &self.app);
        Ok(self
            .target
            .runtime()
            .list_containers(&filter)
            .await?
            .into_iter()
            .map(|snapshot| ContainerHandle::new(self.target.clone(), snapshot))
            .collect())
    }

    /// Delete the image together with every container created from it.
    ///
    /// Containers are force-removed first, since a running container blocks
    /// image removal even when forced. Failing to remove a container is logged
    /// and does not stop the cascade.
    ///
    /// # Errors
    ///
    /// Returns error if the image itself cannot be removed.
    pub async fn delete(&self) -> Result<()> {
        self.capabilities().require(Capability::Delete)?;
        let runtime = self.target.runtime();

        let children = runtime
            .list_containers(&ContainerFilter::all().ancestor(self.id()))
            .await?;
        for child in children {
            let container = ContainerHandle::new(self.target.clone(), child);
            if let Err(e) = container.delete().await {
                warn!(
                    "Failed to delete container {} of image {}: {}",
                    container.short_id(),
                    self.short_id(),
                    e
                );
            }
        }

        match runtime.remove_image(self.id(), true, false).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        let policy = self.target.config().poll_policy();
        let gone = retry::until(
            &policy,
            || runtime.inspect_image(self.id()),
            |r| matches!(r, Err(e) if e.is_not_found()),
        )
        .await;
        if let Err(exhausted) = gone {
            warn!("Image {} still present after delete: {}", self.short_id(), exhausted);
        }

        if let Err(e) = self.ledger.remove(&self.app, self.id()) {
            warn!("Failed to forget image {} of {}: {}", self.short_id(), self.app, e);
        }
        info!("Deleted image {}", self.display_name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ClasspathFlags;
    use crate::runtime::{ContainerRuntime, CreateContainerSpec, InMemoryRuntime, RuntimeConfig};
    use crate::store::MemoryPropertyStore;

    const IMAGE_ID: &str = "sha256:0123456789abcdef0123";

    fn fixture() -> (Arc<InMemoryRuntime>, ImageHandle) {
        let runtime = Arc::new(InMemoryRuntime::new());
        let snapshot = runtime.add_image(IMAGE_ID, &["demo:latest", "demo:0.1"]);
        let props = Arc::new(MemoryPropertyStore::new());
        let target = RuntimeTarget::builder(runtime.clone())
            .props(props.clone())
            .config(RuntimeConfig {
                poll_interval_ms: 1,
                poll_attempts: 5,
                ..Default::default()
            })
            .build();
        let ledger = Arc::new(ImageLedger::new(props));
        ledger
            .record(
                "demo",
                IMAGE_ID,
                ClasspathFlags {
                    devtools: true,
                    actuator: false,
                },
            )
            .unwrap();
        let image = ImageHandle::new(Arc::new(target), ledger, "demo", snapshot);
        (runtime, image)
    }

    async fn create(runtime: &InMemoryRuntime, app: Option<&str>) -> String {
        let id = runtime
            .create_container(&CreateContainerSpec {
                image: IMAGE_ID.to_string(),
                labels: app
                    .map(|a| vec![(labels::APP_NAME.to_string(), a.to_string())])
                    .unwrap_or_default(),
                ..Default::default()
            })
            .await
            .unwrap();
        runtime.start_container(&id).await.unwrap();
        id
    }

    #[test]
    fn test_display_name_and_flags() {
        let (_, image) = fixture();
        assert_eq!(image.display_name(), "demo:0.1, latest (0123456789ab)");
        assert!(image.has_devtools_dependency());
        assert!(!image.has_actuator_dependency());
    }

    #[tokio::test]
    async fn test_fetch_containers_filters_by_app() {
        let (runtime, image) = fixture();
        let ours = create(&runtime, Some("demo")).await;
        create(&runtime, Some("other")).await;

        let children = image.fetch_containers().await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id(), ours);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (runtime, image) = fixture();
        create(&runtime, Some("demo")).await;
        create(&runtime, None).await;

        image.delete().await.unwrap();
        assert!(runtime.containers().is_empty());
        assert!(runtime.images().is_empty());
        assert!(image.ledger.images("demo").is_empty());
        assert!(!image.has_devtools_dependency());
    }
}
