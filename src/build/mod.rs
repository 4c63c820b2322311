//! Image builds.
//!
//! Turning a project directory into a runnable image happens in three steps:
//!
//! 1. [`BuildLocator`] decides which build mechanism to use (custom script,
//!    Maven wrapper or Gradle wrapper)
//! 2. [`BuildPipeline`] spawns it, streams its output to the application
//!    console and scrapes the produced image tag
//! 3. the tag is resolved to an image id against the runtime
//!
//! [`command`] renders argument vectors for display and audit purposes.

pub mod cache;
pub mod command;
pub mod locator;
pub mod pipeline;

pub use cache::BuildCache;
pub use locator::{BuildLocator, Located};
pub use pipeline::{BuildPipeline, ImageTagScraper, normalize_image_tag};

use crate::runtime::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Build mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildKind {
    /// Custom script at the project root
    Shell,
    /// Maven wrapper running `spring-boot:build-image`
    Maven,
    /// Gradle wrapper running `bootBuildImage`
    Gradle,
}

impl fmt::Display for BuildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildKind::Shell => write!(f, "shell"),
            BuildKind::Maven => write!(f, "maven"),
            BuildKind::Gradle => write!(f, "gradle"),
        }
    }
}

/// A resolved build invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCommand {
    /// Build mechanism
    pub kind: BuildKind,
    /// Argument vector; the first element is the program
    pub argv: Vec<String>,
    /// Whether devtools packaging flags were added
    pub devtools: bool,
}

/// Build configuration (`[build]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Custom build script name on Unix-like systems
    pub script_unix: String,
    /// Custom build script name on Windows
    pub script_windows: String,
    /// Java major version assumed when the JVM does not report one
    pub default_java_version: Option<u32>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            script_unix: "dockyard-build.sh".to_string(),
            script_windows: "dockyard-build.cmd".to_string(),
            default_java_version: None,
        }
    }
}

/// Build errors.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// No supported build mechanism was found
    #[error("No build script found; checked: {}", display_paths(.checked))]
    NoBuildScriptFound {
        /// Every location probed, in priority order
        checked: Vec<PathBuf>,
    },

    /// No JVM is configured for a build tool that needs one
    #[error("No JVM found to run the {0} build; set JAVA_HOME or workspace.java_home")]
    NoJvmFound(BuildKind),

    /// The build exited unsuccessfully
    #[error("Build process failed with exit code {}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "<signal>".to_string()))]
    BuildProcessFailed {
        /// Process exit code; `None` when killed by a signal
        exit_code: Option<i32>,
    },

    /// The build succeeded but printed no recognizable image tag
    #[error("Build output did not mention a built image; expected one of: {}", .patterns.join(", "))]
    NoImageTagDetected {
        /// Patterns the output was matched against
        patterns: Vec<String>,
    },

    /// The build process could not be spawned or awaited
    #[error("Failed to run build command: {0}")]
    Spawn(#[from] std::io::Error),

    /// Resolving the built image failed
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for build operations.
pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BuildError::NoBuildScriptFound {
            checked: vec![PathBuf::from("/p/a.sh"), PathBuf::from("/p/mvnw")],
        };
        assert_eq!(err.to_string(), "No build script found; checked: /p/a.sh, /p/mvnw");

        let err = BuildError::BuildProcessFailed { exit_code: Some(3) };
        assert_eq!(err.to_string(), "Build process failed with exit code 3");
    }
}
