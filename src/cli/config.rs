//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./dockyard.toml or ./.dockyard/config.toml
//! 2. User config: ~/.dockyard/config.toml
//! 3. System config: /etc/dockyard/config.toml
//! 4. Built-in defaults

use crate::build::BuildConfig;
use crate::env;
use crate::project::WorkspaceConfig;
use crate::runtime::RuntimeConfig;
use crate::store::StoreConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Complete dockyard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockyardConfig {
    pub runtime: RuntimeConfig,
    pub build: BuildConfig,
    pub store: StoreConfig,
    pub workspace: WorkspaceConfig,
}

impl DockyardConfig {
    /// Workspace root: the override, then the configured root, then the current directory.
    pub fn workspace_root(&self, workspace_override: Option<&Path>) -> PathBuf {
        workspace_override
            .map(Path::to_path_buf)
            .or_else(|| self.workspace.root.clone())
            .unwrap_or_else(|| std_env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    /// Directory holding the persisted properties for `workspace_root`.
    pub fn state_dir(&self, workspace_root: &Path) -> PathBuf {
        self.store.state_dir_for(workspace_root)
    }

    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        let config: DockyardConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid configuration {}", path.display()))?;
        Ok(config)
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load the explicit configuration file, or discover one using the hierarchy
    pub fn load(config_override: Option<&Path>) -> anyhow::Result<DockyardConfig> {
        if let Some(path) = config_override {
            info!("Loading configuration override from: {:?}", path);
            return DockyardConfig::from_toml_file(path);
        }
        Self::discover_config()
    }

    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> anyhow::Result<DockyardConfig> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return DockyardConfig::from_toml_file(config_path);
        }

        debug!("No configuration file found, using defaults");
        Ok(DockyardConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        Self::get_config_candidates()
            .into_iter()
            .inspect(|candidate| debug!("Checking for config file: {:?}", candidate))
            .find(|candidate| candidate.is_file())
    }

    /// Get list of configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        // 1. Current directory: ./dockyard.toml, ./.dockyard/config.toml
        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        // 2. User config: ~/.dockyard/config.toml
        if let Some(home_dir) = Self::get_home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        // 3. System config (Unix-like systems)
        #[cfg(unix)]
        candidates.push(PathBuf::from("/etc/dockyard/config.toml"));

        #[cfg(windows)]
        if let Ok(program_data) = std_env::var("PROGRAMDATA") {
            candidates.push(PathBuf::from(program_data).join("dockyard").join("config.toml"));
        }

        candidates
    }

    /// Get home directory path
    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info(effective: &DockyardConfig) {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::get_config_candidates().iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };
            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }

        println!();
        match toml::to_string_pretty(effective) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => println!("Failed to render configuration: {}", e),
        }
    }
}
