//! Environment constants and path utilities for dockyard.
//!
//! This module centralizes container labels, persisted property keys and the
//! well-known file names used throughout the crate, making them easier to
//! maintain and modify.

use std::path::{Path, PathBuf};

/// Main application directory name (hidden directory like .git, .vscode)
pub const DOCKYARD_DIR_NAME: &str = ".dockyard";

/// Configuration file name inside the dockyard directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name at a project/workspace root
pub const LOCAL_CONFIG_FILE_NAME: &str = "dockyard.toml";

/// Persistent property file name inside the state directory
pub const PROPERTIES_FILE_NAME: &str = "properties.json";

/// Labels stamped on every container created for an application.
pub mod labels {
    /// Application name (stable deployment key)
    pub const APP_NAME: &str = "dockyard.app.name";

    /// Build id of the deployment intent that produced the container
    pub const BUILD_ID: &str = "dockyard.app.build-id";

    /// JSON-serialized system properties of the deployment
    pub const SYSTEM_PROPS: &str = "dockyard.app.sysprops";

    /// Host port bound to the JMX agent
    pub const JMX_PORT: &str = "dockyard.app.jmx.port";

    /// Host port bound to the remote debug agent
    pub const DEBUG_PORT: &str = "dockyard.app.debug.port";

    /// Host port bound to the application port
    pub const APP_LOCAL_PORT: &str = "dockyard.app.port.local";
}

/// Keys and key builders for the persistent property store.
pub mod props {
    /// Serialized deployment record list
    pub const DEPLOYMENTS_KEY: &str = "deployments";

    /// Persisted image id set of an application
    pub fn images_key(app_name: &str) -> String {
        format!("{}.images", app_name)
    }

    /// Snapshot flag: image was built with devtools on its classpath
    pub fn has_devtools_key(image_id: &str) -> String {
        format!("{}.hasDevtoolsDependency", image_id)
    }

    /// Snapshot flag: image was built with actuators on its classpath
    pub fn has_actuator_key(image_id: &str) -> String {
        format!("{}.hasActuatorDependency", image_id)
    }
}

/// Spring Boot specific names.
pub mod boot {
    /// System property carrying the devtools remote secret
    pub const DEVTOOLS_SECRET_PROP: &str = "spring.devtools.remote.secret";

    /// Artifact marking a devtools dependency in build files
    pub const DEVTOOLS_ARTIFACT: &str = "spring-boot-devtools";

    /// Artifact marking an actuator dependency in build files
    pub const ACTUATOR_ARTIFACT: &str = "spring-boot-starter-actuator";
}

/// Test-related constants
pub mod test {
    /// Application name used by tests
    pub const TEST_APP_NAME: &str = "demo";
}

/// Build the main .dockyard directory path from a root
pub fn dockyard_dir_path(root: &Path) -> PathBuf {
    root.join(DOCKYARD_DIR_NAME)
}

/// Build the local config file path (`<root>/.dockyard/config.toml`)
pub fn local_config_file_path(root: &Path) -> PathBuf {
    dockyard_dir_path(root).join(CONFIG_FILE_NAME)
}

/// Build the user config file path (`~/.dockyard/config.toml`)
pub fn user_config_file_path(home: &Path) -> PathBuf {
    dockyard_dir_path(home).join(CONFIG_FILE_NAME)
}

/// Build the persistent property file path inside a state directory
pub fn properties_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join(PROPERTIES_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_keys() {
        assert_eq!(props::images_key("demo"), "demo.images");
        assert_eq!(
            props::has_devtools_key("sha256:abc"),
            "sha256:abc.hasDevtoolsDependency"
        );
    }

    #[test]
    fn test_config_paths() {
        let root = Path::new("/work");
        assert_eq!(
            local_config_file_path(root),
            PathBuf::from("/work/.dockyard/config.toml")
        );
        assert_eq!(
            properties_file_path(Path::new("/state")),
            PathBuf::from("/state/properties.json")
        );
    }
}
