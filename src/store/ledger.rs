//! Per-application image lineage.

use super::{PropertyStore, Result};
use crate::env::props;
use crate::project::ClasspathFlags;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Tracks which images were built for which application.
///
/// Image ids are kept as a persisted set per application; every image id
/// additionally carries a snapshot of the project's classpath flags taken
/// when the image was built.
pub struct ImageLedger {
    props: Arc<dyn PropertyStore>,
    // Serializes read-modify-write of the per-app id sets
    guard: Mutex<()>,
}

impl ImageLedger {
    /// Create a ledger over a property store.
    pub fn new(props: Arc<dyn PropertyStore>) -> Self {
        Self {
            props,
            guard: Mutex::new(()),
        }
    }

    /// Persisted image ids of an application, in the order they were recorded.
    pub fn images(&self, app: &str) -> Vec<String> {
        self.props.get_strings(&props::images_key(app), &[])
    }

    /// Record an image produced for `app` along with its classpath snapshot.
    ///
    /// # Errors
    ///
    /// Returns error if the property store cannot persist the change.
    pub fn record(&self, app: &str, image_id: &str, flags: ClasspathFlags) -> Result<()> {
        let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        let key = props::images_key(app);
        let mut ids = self.props.get_strings(&key, &[]);
        if !ids.iter().any(|id| id == image_id) {
            ids.push(image_id.to_string());
            self.props.put_strings(&key, &ids)?;
        }
        self.props
            .put_bool(&props::has_devtools_key(image_id), flags.devtools)?;
        self.props
            .put_bool(&props::has_actuator_key(image_id), flags.actuator)?;
        Ok(())
    }

    /// Drop persisted ids of `app` that are not in `live`. Returns the pruned ids.
    ///
    /// # Errors
    ///
    /// Returns error if the property store cannot persist the change.
    pub fn retain(&self, app: &str, live: &HashSet<String>) -> Result<Vec<String>> {
        let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        let key = props::images_key(app);
        let (kept, pruned): (Vec<String>, Vec<String>) = self
            .props
            .get_strings(&key, &[])
            .into_iter()
            .partition(|id| live.contains(id));
        if !pruned.is_empty() {
            self.props.put_strings(&key, &kept)?;
            for id in &pruned {
                self.forget_flags(id)?;
            }
        }
        Ok(pruned)
    }

    /// Forget one image of `app`.
    ///
    /// # Errors
    ///
    /// Returns error if the property store cannot persist the change.
    pub fn remove(&self, app: &str, image_id: &str) -> Result<()> {
        let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        let key = props::images_key(app);
        let ids: Vec<String> = self
            .props
            .get_strings(&key, &[])
            .into_iter()
            .filter(|id| id != image_id)
            .collect();
        self.props.put_strings(&key, &ids)?;
        self.forget_flags(image_id)
    }

    /// Classpath snapshot recorded for an image.
    pub fn flags(&self, image_id: &str) -> ClasspathFlags {
        ClasspathFlags {
            devtools: self.props.get_bool(&props::has_devtools_key(image_id), false),
            actuator: self.props.get_bool(&props::has_actuator_key(image_id), false),
        }
    }

    fn forget_flags(&self, image_id: &str) -> Result<()> {
        self.props.put(&props::has_devtools_key(image_id), None)?;
        self.props.put(&props::has_actuator_key(image_id), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPropertyStore;

    fn ledger() -> (Arc<MemoryPropertyStore>, ImageLedger) {
        let props = Arc::new(MemoryPropertyStore::new());
        let ledger = ImageLedger::new(props.clone());
        (props, ledger)
    }

    #[test]
    fn test_record_is_idempotent_and_keeps_flags() {
        let (_, ledger) = ledger();
        let flags = ClasspathFlags {
            devtools: true,
            actuator: false,
        };
        ledger.record("demo", "sha256:a", flags).unwrap();
        ledger.record("demo", "sha256:a", flags).unwrap();
        ledger
            .record("demo", "sha256:b", ClasspathFlags::default())
            .unwrap();

        assert_eq!(ledger.images("demo"), vec!["sha256:a", "sha256:b"]);
        assert_eq!(ledger.flags("sha256:a"), flags);
        assert!(ledger.images("other").is_empty());
    }

    #[test]
    fn test_retain_prunes_dead_images() {
        let (props, ledger) = ledger();
        let flags = ClasspathFlags {
            devtools: true,
            actuator: true,
        };
        ledger.record("demo", "sha256:a", flags).unwrap();
        ledger.record("demo", "sha256:b", flags).unwrap();

        let live = HashSet::from(["sha256:b".to_string()]);
        assert_eq!(ledger.retain("demo", &live).unwrap(), vec!["sha256:a"]);
        assert_eq!(ledger.images("demo"), vec!["sha256:b"]);
        assert_eq!(props.get("sha256:a.hasDevtoolsDependency"), None);
    }

    #[test]
    fn test_remove_last_image_clears_key() {
        let (props, ledger) = ledger();
        ledger
            .record("demo", "sha256:a", ClasspathFlags::default())
            .unwrap();
        ledger.remove("demo", "sha256:a").unwrap();
        assert_eq!(props.get("demo.images"), None);
    }
}
