//! # Dockyard
//!
//! A declarative container-deployment reconciler. Given a small desired-state
//! record per application ("deploy project X, run it, with these system
//! properties"), dockyard builds the project's image, creates and drives its
//! containers until the runtime matches the record, streams their logs, and
//! tears everything down when the record goes away.
//!
//! ## Architecture Overview
//!
//! - **[`runtime`]**: container runtime abstraction (bollard-backed Docker/Podman or in-process)
//! - **[`build`]**: build mechanism detection, image builds and image tag scraping
//! - **[`container`]**: live container and image handles, goal-state transitions, log streaming
//! - **[`deploy`]**: deployment records, per-application reconciliation and scheduling
//! - **[`store`]**: persisted properties, the deployment store and the image ledger
//! - **[`console`]**: per-application output consoles
//! - **[`project`]**: project directory and JVM lookup
//! - **[`cli`]**: argument parsing and configuration discovery for the `dockyard` binary
//!
//! ## Features
//!
//! ### Reconciliation
//! - **At most one live container per intent**: containers from older builds are stopped
//! - **Stale record detection**: records from a previous runtime session are left alone
//! - **Best-effort convergence**: bounded polling, failures logged rather than propagated
//!
//! ### Builds
//! - **Build detection**: custom script, then Maven wrapper, then Gradle wrapper
//! - **Streaming output**: build output reaches the app console line by line
//! - **Image lineage**: every built image is remembered per application
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dockyard::deploy::{Deployer, DeploymentRecord, KeyedScheduler, RunState};
//! use dockyard::runtime::{DockerRuntime, RuntimeTarget};
//! use dockyard::store::{DeploymentStore, ImageLedger, StoreConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Arc::new(DockerRuntime::connect().await?);
//!     let target = Arc::new(RuntimeTarget::builder(runtime).build());
//!     let store = DeploymentStore::load(target.props().clone(), &StoreConfig::default());
//!     let ledger = Arc::new(ImageLedger::new(target.props().clone()));
//!
//!     let deployer = Deployer::new(target.clone(), store.clone(), ledger);
//!     deployer.bind(Arc::new(KeyedScheduler::new()));
//!
//!     store.create_or_update(DeploymentRecord::new("demo", RunState::Running, target.session_id()));
//!     deployer.settle().await;
//!     Ok(())
//! }
//! ```

/// Image builds.
///
/// Detects the build mechanism of a project, runs it with streamed output
/// and resolves the image it produced.
pub mod build;

/// Command-line interface support.
pub mod cli;

/// Per-application output consoles.
pub mod console;

/// Live containers and images.
pub mod container;

/// Desired-state reconciliation.
///
/// Deployment records, the per-application reconciler, the store-driven
/// deployer and the keyed task scheduler.
pub mod deploy;

/// Environment constants and path utilities.
///
/// Centralizes label keys, persisted property keys and file names used
/// throughout the crate.
pub mod env;

/// Project and JVM lookup.
pub mod project;

/// Container runtime abstraction.
pub mod runtime;

/// Persistent state.
pub mod store;

// Re-export main reconciliation types
pub use deploy::{AppReconciler, Deployer, DeploymentRecord, KeyedScheduler, RunState};

// Re-export runtime entry points
pub use runtime::{ContainerRuntime, InMemoryRuntime, RuntimeTarget};

// Re-export store types
pub use store::{DeploymentStore, ImageLedger};
