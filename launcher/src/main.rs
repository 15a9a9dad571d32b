use clap::Parser;
use launcher::{ChildProcessSpawner, LaunchError, NodeProcessSupervisor, SupervisorSettings};
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Launches the requested service roles as node processes.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Name of this machine-level node
    #[clap(long, default_value = "node")]
    node_name: String,
    /// Comma-separated roles, e.g. "Backend,FrontEnd"; dependencies are added
    #[clap(long)]
    roles: String,
    /// Local TOML configuration file handed to every node process
    #[clap(long)]
    config: PathBuf,
    /// Overrides applied on top of the configuration, `section.key=value;...`
    #[clap(long, default_value = "")]
    overrides: String,
    /// Node executable; defaults to `node` next to this launcher
    #[clap(long)]
    node_binary: Option<PathBuf>,
    /// Seconds each node gets to acknowledge finalize
    #[clap(long, default_value = "10")]
    finalize_timeout: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !e.is_already_logged() {
                error!("{}", e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), LaunchError> {
    let binary = match args.node_binary {
        Some(binary) => binary,
        None => ChildProcessSpawner::sibling_binary()?,
    };
    let supervisor = NodeProcessSupervisor::new(
        Arc::new(ChildProcessSpawner::new(binary)),
        SupervisorSettings {
            finalize_timeout: Duration::from_secs(args.finalize_timeout),
        },
    );

    tokio::select! {
        launched = supervisor.launch(&args.node_name, &args.roles, &args.config, &args.overrides) => {
            let roles = launched?;
            info!("{} node(s) ready on {}", roles.len(), args.node_name);
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted during launch");
            supervisor.shutdown(true).await;
            return Ok(());
        }
    }

    tokio::select! {
        role = supervisor.wait_for_exit() => warn!("The {} node exited, shutting down the rest", role),
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down gracefully..."),
    }
    supervisor.shutdown(true).await;
    Ok(())
}
