use anyhow::Context;
use dockyard::cli::{Args, Commands, ConfigDiscovery, DockyardConfig};
use dockyard::deploy::{Deployer, DeploymentRecord, KeyedScheduler, RunState};
use dockyard::env;
use dockyard::project::WorkspaceProjects;
use dockyard::runtime::{DockerRuntime, DockerRuntimeConfig, DockerRuntimeFactory, RuntimeTarget};
use dockyard::store::{DeploymentStore, FilePropertyStore, ImageLedger, PropertyStore};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "dockyard=debug"
    } else {
        "dockyard=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let command = match args.command() {
        Ok(command) => command.clone(),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let config = ConfigDiscovery::load(args.config.as_deref())?;
    if command == Commands::ShowConfig {
        ConfigDiscovery::show_discovery_info(&config);
        return Ok(());
    }

    let workspace = config.workspace_root(args.workspace.as_deref());
    let deployer = connect(&config, &workspace).await?;
    let result = run_command(&command, &deployer).await;

    if let Err(e) = deployer.store().flush() {
        error!("Failed to save deployments: {}", e);
    }
    result
}

async fn connect(config: &DockyardConfig, workspace: &Path) -> anyhow::Result<Deployer> {
    let state_dir = config.state_dir(workspace);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create state directory {:?}", state_dir))?;
    let props: Arc<dyn PropertyStore> =
        Arc::new(FilePropertyStore::open(env::properties_file_path(&state_dir))?);

    info!("Connecting to container runtime...");
    let runtime = Arc::new(
        DockerRuntime::connect()
            .await
            .context("Failed to connect to Docker or Podman")?,
    );
    let target = Arc::new(
        RuntimeTarget::builder(runtime)
            .dedicated(Arc::new(DockerRuntimeFactory::new(
                DockerRuntimeConfig::default(),
            )))
            .props(props.clone())
            .projects(Arc::new(WorkspaceProjects::from_config(
                &config.workspace,
                workspace,
            )))
            .config(config.runtime.clone())
            .build_config(config.build.clone())
            .build(),
    );

    let store = DeploymentStore::load(props.clone(), &config.store);
    let ledger = Arc::new(ImageLedger::new(props));
    let deployer = Deployer::new(target, store, ledger);
    deployer.bind(Arc::new(KeyedScheduler::new()));
    Ok(deployer)
}

async fn run_command(command: &Commands, deployer: &Deployer) -> anyhow::Result<()> {
    let session = deployer.target().session_id().to_string();
    let store = deployer.store();

    match command {
        Commands::Deploy {
            name,
            debug,
            properties,
        } => {
            let state = if *debug {
                RunState::Debugging
            } else {
                RunState::Running
            };
            let mut record = match store.get(name) {
                Some(existing) => existing.redeployed(state, &session),
                None => DeploymentRecord::new(name.as_str(), state, session.as_str()),
            };
            for (key, value) in properties {
                dockyard::deploy::params::validate_system_property(key, value)?;
                record.system_properties.insert(key.clone(), value.clone());
            }
            info!("Deploying {} ({})", name, state);
            store.create_or_update(record);
            deployer.settle().await;
            print_app_status(deployer, name).await
        }
        Commands::Stop { name } => {
            let record = deployer.reconciler(name).set_goal_state(RunState::Inactive)?;
            if record.is_stale(&session) {
                store.modify(name, |record| record.session_id = session.clone());
            }
            deployer.settle().await;
            print_app_status(deployer, name).await
        }
        Commands::Start { name, debug } => {
            let state = if *debug {
                RunState::Debugging
            } else {
                RunState::Running
            };
            deployer.reconciler(name).restart(state)?;
            deployer.settle().await;
            print_app_status(deployer, name).await
        }
        Commands::Pause { name } => {
            let paused = deployer.reconciler(name).pause().await?;
            println!("Paused {} container(s) of {}", paused, name);
            Ok(())
        }
        Commands::Resume { name } => {
            let resumed = deployer.reconciler(name).resume().await?;
            println!("Resumed {} container(s) of {}", resumed, name);
            Ok(())
        }
        Commands::SetProp { name, key, value } => {
            deployer
                .reconciler(name)
                .set_system_property(key, Some(value))?;
            deployer.settle().await;
            print_app_status(deployer, name).await
        }
        Commands::Remove { name } => {
            deployer.reconciler(name).delete()?;
            deployer.settle().await;
            println!("Removed {}", name);
            Ok(())
        }
        Commands::Status => {
            let statuses = deployer.status().await?;
            if statuses.is_empty() {
                println!("No deployments");
            }
            for status in statuses {
                print_status(&status);
            }
            Ok(())
        }
        Commands::Logs { name, history } => follow_logs(deployer, name, *history).await,
        Commands::ShowConfig => Ok(()),
    }
}

async fn follow_logs(deployer: &Deployer, name: &str, history: bool) -> anyhow::Result<()> {
    let containers = deployer.reconciler(name).fetch_containers().await?;
    let Some(container) = containers
        .into_iter()
        .find(|container| container.run_state().is_active())
    else {
        anyhow::bail!("{} has no running container", name);
    };

    let bridge = container.connect_log(history).await?;
    info!("Following logs of {}; press Ctrl-C to stop", container.display_name());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {
                if bridge.is_closed() {
                    break;
                }
            }
        }
    }
    bridge.close();
    Ok(())
}

async fn print_app_status(deployer: &Deployer, name: &str) -> anyhow::Result<()> {
    let statuses = deployer.status().await?;
    match statuses.iter().find(|status| status.name == name) {
        Some(status) => print_status(status),
        None => println!("{} is not deployed", name),
    }
    Ok(())
}

fn print_status(status: &dockyard::deploy::AppStatus) {
    let stale = if status.stale { " (stale)" } else { "" };
    println!("{}: desired {}{}", status.name, status.desired, stale);
    if status.containers.is_empty() {
        println!("  no containers");
    }
    for (container, state) in &status.containers {
        println!("  {} {}", container, state);
    }
}
