//! Build mechanism detection.
//!
//! Candidates are probed in a fixed order and the first existing one wins:
//!
//! 1. a custom script at the project root (so a project can fully override the build)
//! 2. the Maven wrapper, running `spring-boot:build-image` with tests skipped
//! 3. the Gradle wrapper, running `bootBuildImage` with tests skipped
//!
//! The platform only changes wrapper file names and the shell prefix.

use super::{BuildConfig, BuildKind};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Target platform conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Linux, macOS and other Unix-like systems
    Unix,
    /// Windows
    Windows,
}

impl Platform {
    /// Platform this process runs on.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }

    fn shell_prefix(self) -> Vec<String> {
        match self {
            Platform::Unix => vec!["bash".to_string()],
            Platform::Windows => vec!["cmd.exe".to_string(), "/c".to_string()],
        }
    }

    fn maven_wrapper(self) -> &'static str {
        match self {
            Platform::Unix => "mvnw",
            Platform::Windows => "mvnw.cmd",
        }
    }

    fn gradle_wrapper(self) -> &'static str {
        match self {
            Platform::Unix => "gradlew",
            Platform::Windows => "gradlew.bat",
        }
    }
}

/// Outcome of build detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    /// Detected mechanism; `None` when nothing was found
    pub kind: Option<BuildKind>,
    /// Command to run; empty when nothing was found
    pub command: Vec<String>,
    /// Every path probed, in priority order
    pub checked: Vec<PathBuf>,
}

/// Decides how a project directory is built.
#[derive(Debug, Clone)]
pub struct BuildLocator {
    platform: Platform,
    script_name: String,
}

impl BuildLocator {
    /// Locator for the current platform.
    pub fn new(config: &BuildConfig) -> Self {
        Self::for_platform(config, Platform::current())
    }

    /// Locator for an explicit platform.
    pub fn for_platform(config: &BuildConfig, platform: Platform) -> Self {
        let script_name = match platform {
            Platform::Unix => config.script_unix.clone(),
            Platform::Windows => config.script_windows.clone(),
        };
        Self {
            platform,
            script_name,
        }
    }

    /// Custom script name probed first.
    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    /// Inspect `directory` and pick a build mechanism.
    pub fn locate(&self, directory: &Path) -> Located {
        let candidates = [
            (BuildKind::Shell, self.script_name.as_str(), &[][..]),
            (
                BuildKind::Maven,
                self.platform.maven_wrapper(),
                &["spring-boot:build-image", "-DskipTests"][..],
            ),
            (
                BuildKind::Gradle,
                self.platform.gradle_wrapper(),
                &["bootBuildImage", "-x", "test"][..],
            ),
        ];

        let mut checked = Vec::new();
        for (kind, file, args) in candidates {
            let path = directory.join(file);
            checked.push(path.clone());
            if path.is_file() {
                debug!("Detected {} build via {:?}", kind, path);
                let mut command = self.platform.shell_prefix();
                command.push(path.to_string_lossy().into_owned());
                command.extend(args.iter().map(|a| a.to_string()));
                return Located {
                    kind: Some(kind),
                    command,
                    checked,
                };
            }
        }

        debug!("No build mechanism found in {:?}", directory);
        Located {
            kind: None,
            command: Vec::new(),
            checked,
        }
    }
}

/// Help text listing the supported build mechanisms in priority order.
pub fn build_script_help(script_name: &str) -> Vec<String> {
    vec![
        "To build a docker image, dockyard needs to run a build script from your project.".to_string(),
        "Three different types are supported and checked for in this order:".to_string(),
        String::new(),
        format!("1. {}", script_name),
        "   A custom script placed by you at the project root.".to_string(),
        "   Typically this runs a custom maven or gradle command on your project.".to_string(),
        String::new(),
        "2. maven".to_string(),
        "   If your project has a mvnw, it is used to execute the `spring-boot:build-image` goal".to_string(),
        String::new(),
        "3. gradle".to_string(),
        "   If your project has a gradlew, it is used to execute the `bootBuildImage` task".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), "#!/bin/sh\n").unwrap();
    }

    #[test]
    fn test_custom_script_beats_wrappers() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "dockyard-build.sh");
        touch(dir.path(), "mvnw");
        touch(dir.path(), "gradlew");

        let located = BuildLocator::for_platform(&BuildConfig::default(), Platform::Unix)
            .locate(dir.path());
        assert_eq!(located.kind, Some(BuildKind::Shell));
        assert_eq!(
            located.command,
            vec![
                "bash".to_string(),
                dir.path().join("dockyard-build.sh").to_string_lossy().into_owned()
            ]
        );
        assert_eq!(located.checked.len(), 1);
    }

    #[test]
    fn test_maven_before_gradle() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "mvnw");
        touch(dir.path(), "gradlew");

        let located = BuildLocator::for_platform(&BuildConfig::default(), Platform::Unix)
            .locate(dir.path());
        assert_eq!(located.kind, Some(BuildKind::Maven));
        assert_eq!(
            &located.command[2..],
            &["spring-boot:build-image".to_string(), "-DskipTests".to_string()]
        );
    }

    #[test]
    fn test_windows_wrapper_names_and_prefix() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "gradlew");
        touch(dir.path(), "gradlew.bat");

        let located = BuildLocator::for_platform(&BuildConfig::default(), Platform::Windows)
            .locate(dir.path());
        assert_eq!(located.kind, Some(BuildKind::Gradle));
        assert_eq!(&located.command[..2], &["cmd.exe".to_string(), "/c".to_string()]);
        assert!(located.command[2].ends_with("gradlew.bat"));
        assert_eq!(
            located.checked,
            vec![
                dir.path().join("dockyard-build.cmd"),
                dir.path().join("mvnw.cmd"),
                dir.path().join("gradlew.bat"),
            ]
        );
    }

    #[test]
    fn test_nothing_found_lists_every_candidate() {
        let dir = TempDir::new().unwrap();
        let located = BuildLocator::for_platform(&BuildConfig::default(), Platform::Unix)
            .locate(dir.path());
        assert_eq!(located.kind, None);
        assert!(located.command.is_empty());
        assert_eq!(
            located.checked,
            vec![
                dir.path().join("dockyard-build.sh"),
                dir.path().join("mvnw"),
                dir.path().join("gradlew"),
            ]
        );
    }

    #[test]
    fn test_help_names_custom_script() {
        assert!(build_script_help("my-build.sh")[3].contains("my-build.sh"));
    }
}
