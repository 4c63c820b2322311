//! Process-wide build resources.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::TempPath;
use tracing::debug;

/// Gradle init script putting `developmentOnly` dependencies (devtools) on the boot jar classpath.
pub const GRADLE_DEVTOOLS_INIT_SCRIPT: &str = "allprojects {
    afterEvaluate {
        bootJar {
          classpath configurations.developmentOnly
        }
   }
}
";

/// Lazily created resources shared by every build of a process.
///
/// Construct one at startup and hand it to whatever runs builds. Files it
/// creates are deleted when the cache is dropped.
#[derive(Debug, Default)]
pub struct BuildCache {
    gradle_init_script: Mutex<Option<TempPath>>,
}

impl BuildCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the Gradle devtools init script, writing it on first use.
    ///
    /// # Errors
    ///
    /// Returns error if the temporary file cannot be written.
    pub fn gradle_init_script(&self) -> std::io::Result<PathBuf> {
        let mut slot = self
            .gradle_init_script
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(path) = slot.as_ref() {
            return Ok(path.to_path_buf());
        }

        let mut file = tempfile::Builder::new()
            .prefix("init-script")
            .suffix(".gradle")
            .tempfile()?;
        file.write_all(GRADLE_DEVTOOLS_INIT_SCRIPT.as_bytes())?;
        file.flush()?;
        let path = file.into_temp_path();
        debug!("Wrote Gradle init script {:?}", path);
        let result = path.to_path_buf();
        *slot = Some(path);
        Ok(result)
    }
}
