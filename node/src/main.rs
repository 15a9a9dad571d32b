use clap::Parser;
use log::error;
use node::bootstrap::{ModuleBootstrap, NodeArgs};
use node::modules::default_registry;
use shared::Role;
use std::path::PathBuf;
use std::process::ExitCode;

/// Node process hosting one service role.
/// Spawned by the launcher; stdin/stdout carry the control channel, logs go to stderr.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Name of the machine-level node this process belongs to
    #[clap(long)]
    node_name: String,
    /// Role to host (ConfigBootstrapper, Backend or FrontEnd)
    #[clap(long)]
    role: Role,
    /// Local TOML configuration file
    #[clap(long)]
    config: PathBuf,
    /// Overrides applied on top of the configuration, `section.key=value;...`
    #[clap(long, default_value = "")]
    overrides: String,
    /// Signal name every control frame must carry
    #[clap(long)]
    signal: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args = Args::parse();
    let role = args.role;
    let node_args = NodeArgs {
        node_name: args.node_name,
        role,
        config: args.config,
        overrides: args.overrides,
        signal: args.signal,
    };

    match ModuleBootstrap::new(node_args, default_registry())
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
    {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            if !e.is_already_logged() {
                error!("{} failed: {}", role, e);
            }
            ExitCode::FAILURE
        }
    }
}
