//! Desired-state records.

use crate::env::labels;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Run state of an application or container.
///
/// `Inactive`, `Running` and `Debugging` are valid desired states; the others
/// are only ever observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Not running
    Inactive,
    /// Created or starting up
    Starting,
    /// Running
    Running,
    /// Running with a remote debug agent attached
    Debugging,
    /// Paused
    Paused,
    /// State could not be determined
    Unknown,
}

impl RunState {
    /// Whether this is a running state.
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Running | RunState::Debugging)
    }

    /// Whether the reconciler accepts this as a desired state.
    pub fn is_desirable(self) -> bool {
        matches!(
            self,
            RunState::Inactive | RunState::Running | RunState::Debugging
        )
    }

    /// Derive a run state from a runtime state string and whether the
    /// container was created with a debug port.
    pub fn from_runtime(state: &str, debug_enabled: bool) -> Self {
        match state {
            "running" if debug_enabled => RunState::Debugging,
            "running" => RunState::Running,
            "restarting" | "created" => RunState::Starting,
            "paused" => RunState::Paused,
            "exited" | "dead" | "removing" => RunState::Inactive,
            _ => RunState::Unknown,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Inactive => "inactive",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Debugging => "debugging",
            RunState::Paused => "paused",
            RunState::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Mint a fresh build id.
pub fn new_build_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Desired state of one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    /// Application name; the stable key
    pub name: String,
    /// Desired run state
    pub desired_run_state: RunState,
    /// Token correlating containers to the intent that produced them
    pub build_id: String,
    /// Runtime session in which the record was last written
    pub session_id: String,
    /// System properties passed to the JVM
    #[serde(default)]
    pub system_properties: BTreeMap<String, String>,
}

impl DeploymentRecord {
    /// A new deployment intent with a fresh build id.
    pub fn new(name: impl Into<String>, state: RunState, session_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desired_run_state: state,
            build_id: new_build_id(),
            session_id: session_id.into(),
            system_properties: BTreeMap::new(),
        }
    }

    /// Set a system property.
    pub fn with_system_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.system_properties.insert(key.into(), value.into());
        self
    }

    /// Copy of this record requesting a fresh build in `state` for `session_id`.
    pub fn redeployed(&self, state: RunState, session_id: &str) -> Self {
        Self {
            desired_run_state: state,
            build_id: new_build_id(),
            session_id: session_id.to_string(),
            ..self.clone()
        }
    }

    /// Copy of this record with a new goal state.
    ///
    /// Only an active goal requests a fresh build; stopping keeps the build id.
    pub fn with_goal_state(&self, state: RunState, session_id: &str) -> Self {
        if state.is_active() {
            return self.redeployed(state, session_id);
        }
        Self {
            desired_run_state: state,
            session_id: session_id.to_string(),
            ..self.clone()
        }
    }

    /// Whether the record was written in another runtime session.
    pub fn is_stale(&self, session_id: &str) -> bool {
        self.session_id != session_id
    }

    /// Canonical JSON form of the system properties, as stored in the container label.
    pub fn system_properties_label(&self) -> String {
        serde_json::to_string(&self.system_properties).unwrap_or_else(|_| "{}".to_string())
    }

    /// Whether a container with these labels was produced by this record.
    pub fn matches_labels(&self, container_labels: &HashMap<String, String>) -> bool {
        let build_matches =
            container_labels.get(labels::BUILD_ID).map(String::as_str) == Some(self.build_id.as_str());
        let props_match = container_labels
            .get(labels::SYSTEM_PROPS)
            .map(|raw| parse_system_properties(raw) == self.system_properties)
            .unwrap_or(self.system_properties.is_empty());
        build_matches && props_match
    }
}

/// Parse a serialized system property label; malformed input yields an empty map.
pub fn parse_system_properties(raw: &str) -> BTreeMap<String, String> {
    serde_json::from_str(raw).unwrap_or_default()
}
