//! Project and JVM lookup.
//!
//! Applications are named after projects; a [`ProjectAccessor`] resolves a
//! name to the directory that gets built and the JVM used to build it.

use crate::env::boot;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Classpath markers relevant to deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClasspathFlags {
    /// Spring Boot devtools is on the classpath
    pub devtools: bool,
    /// Spring Boot actuators are on the classpath
    pub actuator: bool,
}

/// Resolves application names to projects.
pub trait ProjectAccessor: Send + Sync {
    /// Directory the application is built from.
    fn project_dir(&self, name: &str) -> PathBuf;

    /// Whether the project exists and can be built.
    fn is_accessible(&self, name: &str) -> bool {
        self.project_dir(name).is_dir()
    }

    /// JVM installation used to build the project.
    fn java_home(&self, name: &str) -> Option<PathBuf>;

    /// Major version of that JVM (8, 11, 17, ...).
    fn java_major_version(&self, name: &str) -> Option<u32>;

    /// Current classpath markers of the project.
    fn classpath_flags(&self, name: &str) -> ClasspathFlags;
}

/// Workspace configuration (`[workspace]` section).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory whose sub-directories are projects; defaults to the current directory
    pub root: Option<PathBuf>,
    /// JVM used for every build instead of `JAVA_HOME`
    pub java_home: Option<PathBuf>,
}

/// Projects are the sub-directories of a workspace root.
#[derive(Debug, Clone)]
pub struct WorkspaceProjects {
    root: PathBuf,
    java_home: Option<PathBuf>,
}

impl WorkspaceProjects {
    /// Projects under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            java_home: None,
        }
    }

    /// Build from workspace configuration, falling back to `default_root`.
    pub fn from_config(config: &WorkspaceConfig, default_root: &Path) -> Self {
        Self {
            root: config
                .root
                .clone()
                .unwrap_or_else(|| default_root.to_path_buf()),
            java_home: config.java_home.clone(),
        }
    }

    /// Use a fixed JVM for every project.
    pub fn with_java_home(mut self, java_home: impl Into<PathBuf>) -> Self {
        self.java_home = Some(java_home.into());
        self
    }

    /// Workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of every project directory in the workspace.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(String::from))
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    fn detect_java_home() -> Option<PathBuf> {
        if let Some(home) = std::env::var_os("JAVA_HOME").filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(home));
        }
        // <home>/bin/java
        let java = which::which("java").ok()?;
        let java = std::fs::canonicalize(&java).unwrap_or(java);
        let home = java.parent()?.parent()?.to_path_buf();
        debug!("Derived JAVA_HOME {:?} from java on PATH", home);
        Some(home)
    }
}

impl ProjectAccessor for WorkspaceProjects {
    fn project_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn java_home(&self, _name: &str) -> Option<PathBuf> {
        self.java_home.clone().or_else(Self::detect_java_home)
    }

    fn java_major_version(&self, name: &str) -> Option<u32> {
        let home = self.java_home(name)?;
        let release = std::fs::read_to_string(home.join("release")).ok()?;
        parse_release_version(&release)
    }

    fn classpath_flags(&self, name: &str) -> ClasspathFlags {
        let dir = self.project_dir(name);
        let build_files: String = ["pom.xml", "build.gradle", "build.gradle.kts"]
            .iter()
            .filter_map(|file| std::fs::read_to_string(dir.join(file)).ok())
            .collect::<Vec<_>>()
            .join("\n");
        ClasspathFlags {
            devtools: build_files.contains(boot::DEVTOOLS_ARTIFACT),
            actuator: build_files.contains(boot::ACTUATOR_ARTIFACT),
        }
    }
}

/// Major version from the `JAVA_VERSION` line of a JVM `release` file.
pub fn parse_release_version(release: &str) -> Option<u32> {
    let version = release
        .lines()
        .find_map(|line| line.strip_prefix("JAVA_VERSION="))?
        .trim()
        .trim_matches('"');
    parse_major_version(version)
}

/// Major version of a Java version string (`1.8.0_292` is 8, `17.0.2` is 17).
pub fn parse_major_version(version: &str) -> Option<u32> {
    let mut parts = version.split(['.', '_', '-', '+']);
    match parts.next()?.parse::<u32>().ok()? {
        1 => parts.next()?.parse().ok(),
        major => Some(major),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_major_version() {
        assert_eq!(parse_major_version("1.8.0_292"), Some(8));
        assert_eq!(parse_major_version("11.0.20"), Some(11));
        assert_eq!(parse_major_version("21"), Some(21));
        assert_eq!(parse_major_version("17-ea"), Some(17));
        assert_eq!(parse_major_version("abc"), None);
    }

    #[test]
    fn test_release_file_version() {
        let release = "IMPLEMENTOR=\"Eclipse Adoptium\"\nJAVA_VERSION=\"17.0.8\"\n";
        assert_eq!(parse_release_version(release), Some(17));
        assert_eq!(parse_release_version("OS_NAME=Linux"), None);
    }

    #[test]
    fn test_java_home_override_and_version() {
        let jvm = TempDir::new().unwrap();
        std::fs::write(jvm.path().join("release"), "JAVA_VERSION=\"1.8.0_382\"\n").unwrap();
        let projects = WorkspaceProjects::new("/nowhere").with_java_home(jvm.path());

        assert_eq!(projects.java_home("demo").as_deref(), Some(jvm.path()));
        assert_eq!(projects.java_major_version("demo"), Some(8));
        assert!(!projects.is_accessible("demo"));
    }

    #[test]
    fn test_classpath_flags_from_build_files() {
        let workspace = TempDir::new().unwrap();
        let maven = workspace.path().join("maven-app");
        let gradle = workspace.path().join("gradle-app");
        std::fs::create_dir_all(&maven).unwrap();
        std::fs::create_dir_all(&gradle).unwrap();
        std::fs::write(
            maven.join("pom.xml"),
            "<artifactId>spring-boot-devtools</artifactId>",
        )
        .unwrap();
        std::fs::write(
            gradle.join("build.gradle.kts"),
            "implementation(\"org.springframework.boot:spring-boot-starter-actuator\")",
        )
        .unwrap();

        let projects = WorkspaceProjects::new(workspace.path());
        assert_eq!(
            projects.classpath_flags("maven-app"),
            ClasspathFlags {
                devtools: true,
                actuator: false
            }
        );
        assert_eq!(
            projects.classpath_flags("gradle-app"),
            ClasspathFlags {
                devtools: false,
                actuator: true
            }
        );
        assert_eq!(projects.list(), vec!["gradle-app", "maven-app"]);
    }
}
