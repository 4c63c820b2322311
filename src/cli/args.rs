//! Command line argument parsing
//!
//! This module handles CLI argument parsing with subcommands:
//! - `deploy`: Create or update a deployment and reconcile it
//! - `stop` / `start`: Change the desired run state
//! - `pause` / `resume`: Pause or resume the live containers of an app
//! - `set-prop`: Set a JVM system property
//! - `remove`: Remove a deployment together with its containers and images
//! - `status`: Show deployments and their containers
//! - `logs`: Follow the logs of an app
//! - `show-config`: Show configuration discovery information

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "dockyard")]
#[command(author = "Dockyard Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Builds project images and keeps their containers in the desired run state")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Workspace directory holding the projects
    #[arg(short = 'w', long = "workspace", global = true)]
    pub workspace: Option<PathBuf>,
    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Build and run a project (redeploys when already deployed)
    Deploy {
        /// Project name
        name: String,
        /// Start with a remote debug agent
        #[arg(long = "debug")]
        debug: bool,
        /// JVM system property (can be used multiple times)
        #[arg(short = 'D', value_name = "KEY=VALUE", value_parser = parse_property)]
        properties: Vec<(String, String)>,
    },
    /// Stop the containers of an app
    Stop {
        /// Project name
        name: String,
    },
    /// Start an app again
    Start {
        /// Project name
        name: String,
        /// Start with a remote debug agent
        #[arg(long = "debug")]
        debug: bool,
    },
    /// Pause the running containers of an app
    Pause {
        /// Project name
        name: String,
    },
    /// Resume the paused containers of an app
    Resume {
        /// Project name
        name: String,
    },
    /// Set a JVM system property
    SetProp {
        /// Project name
        name: String,
        /// Property name
        key: String,
        /// Property value
        value: String,
    },
    /// Remove a deployment with its containers and images
    Remove {
        /// Project name
        name: String,
    },
    /// Show deployments and their containers
    Status,
    /// Follow the logs of an app until interrupted
    Logs {
        /// Project name
        name: String,
        /// Include output produced before attaching
        #[arg(long = "history")]
        history: bool,
    },
    /// Show configuration discovery information
    ShowConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn command(&self) -> Result<&Commands, String> {
        self.command.as_ref().ok_or_else(|| {
            "No command specified. Use 'dockyard --help' to see available commands.".to_string()
        })
    }
}

/// Parse a `key=value` system property.
pub fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("Expected KEY=VALUE, got '{}'", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_deploy_command_with_properties() {
        let args = parse(&[
            "dockyard", "deploy", "demo", "--debug", "-D", "a=1", "-D", "b=x=y",
        ]);
        assert_eq!(
            args.command().unwrap(),
            &Commands::Deploy {
                name: "demo".to_string(),
                debug: true,
                properties: vec![
                    ("a".to_string(), "1".to_string()),
                    ("b".to_string(), "x=y".to_string())
                ],
            }
        );
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let args = parse(&["dockyard", "status", "--verbose", "-w", "/workspace"]);
        assert!(args.verbose);
        assert_eq!(args.workspace, Some(PathBuf::from("/workspace")));
        assert_eq!(args.command().unwrap(), &Commands::Status);
    }

    #[test]
    fn test_set_prop_and_logs() {
        let args = parse(&["dockyard", "set-prop", "demo", "server.port", "9090"]);
        assert!(matches!(
            args.command().unwrap(),
            Commands::SetProp { key, value, .. } if key == "server.port" && value == "9090"
        ));

        let args = parse(&["dockyard", "logs", "demo", "--history"]);
        assert!(matches!(
            args.command().unwrap(),
            Commands::Logs { history: true, .. }
        ));
    }

    #[test]
    fn test_invalid_property() {
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=1").is_err());
        assert!(Args::try_parse_from(["dockyard", "deploy", "demo", "-D", "oops"]).is_err());
    }

    #[test]
    fn test_no_command_error() {
        let args = Args {
            config: None,
            workspace: None,
            verbose: false,
            command: None,
        };
        assert!(args.command().is_err());
    }
}
