//! Node process bootstrap
//!
//! Loads configuration, instantiates the role's module from a
//! [`ModuleRegistry`], drives it through init and launch, then reports
//! readiness on the control channel and waits to be finalized.
//!
//! Whatever happens, the launcher hears about it: a failed bootstrap raises
//! `Failed` instead of leaving the launcher waiting on readiness.

use crate::cluster::{ClusterCoordinator, FileCoordinator, ServiceRegistry};
use crate::config::{LocalConfig, NodeConfig};
use crate::edge::retry::RetryPolicy;
use crate::error::{NodeError, Result};
use crate::trap::install_failure_trap;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use shared::{read_frame, write_frame, NodeSignal, Role, SupervisorCommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Everything a node process receives from the launcher
#[derive(Debug, Clone)]
pub struct NodeArgs {
    pub node_name: String,
    pub role: Role,
    pub config: PathBuf,
    pub overrides: String,
    pub signal: String,
}

/// What a role module gets to work with
#[derive(Clone)]
pub struct ModuleContext {
    pub node_name: String,
    pub role: Role,
    pub local: LocalConfig,
    /// Raw local config for the coordinator role, merged cluster config otherwise
    pub config: NodeConfig,
    pub coordinator: Arc<dyn ClusterCoordinator>,
    pub registry: Arc<dyn ServiceRegistry>,
}

/// The service a node process hosts for its role
///
/// `launch` may be called again after a transient failure, so it must leave
/// the module relaunchable when it fails.
#[async_trait]
pub trait NodeModule: Send + Sync {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn launch(&self) -> Result<()>;

    async fn shutdown(&self);
}

pub type ModuleFactory = fn(&ModuleContext) -> Result<Box<dyn NodeModule>>;

/// Role to module constructor map, filled by explicit registration
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<Role, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any earlier registration for `role`
    pub fn register(&mut self, role: Role, factory: ModuleFactory) -> &mut Self {
        if self.factories.insert(role, factory).is_some() {
            debug!("Module for {} re-registered", role);
        }
        self
    }

    pub fn is_registered(&self, role: Role) -> bool {
        self.factories.contains_key(&role)
    }

    pub fn create(&self, context: &ModuleContext) -> Result<Box<dyn NodeModule>> {
        let factory = self
            .factories
            .get(&context.role)
            .ok_or_else(|| NodeError::config(format!("no module registered for role {}", context.role)))?;
        factory(context)
    }
}

/// Why a running node stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Finalize { graceful: bool },
    ChannelClosed,
    Interrupted,
}

pub struct ModuleBootstrap {
    args: NodeArgs,
    registry: ModuleRegistry,
}

impl ModuleBootstrap {
    pub fn new(args: NodeArgs, registry: ModuleRegistry) -> Self {
        Self { args, registry }
    }

    /// Runs the node until it is finalized
    ///
    /// `control_in` carries [`SupervisorCommand`]s from the launcher and
    /// `control_out` carries [`NodeSignal`]s back.
    pub async fn run<R, W>(self, control_in: R, mut control_out: W) -> Result<StopReason>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        install_failure_trap();
        let signal = self.args.signal.clone();
        let role = self.args.role;

        let module = match self.start().await {
            Ok(module) => module,
            Err(e) => {
                let failed = NodeSignal::Failed {
                    signal: signal.clone(),
                    reason: e.to_string(),
                    already_logged: e.is_already_logged(),
                };
                if let Err(report) = write_frame(&mut control_out, &failed).await {
                    error!("Could not report failure of {} to the launcher: {}", role, report);
                }
                return Err(e);
            }
        };

        write_frame(&mut control_out, &NodeSignal::Ready { signal: signal.clone() }).await?;
        info!("{} is ready", role);

        let reason = tokio::select! {
            reason = wait_for_finalize(control_in, &signal) => reason,
            _ = tokio::signal::ctrl_c() => StopReason::Interrupted,
        };
        info!("{} stopping ({:?})", role, reason);

        module.shutdown().await;
        if let Err(e) = write_frame(&mut control_out, &NodeSignal::Finalized { signal }).await {
            // The launcher may already be gone
            debug!("Could not acknowledge finalize: {}", e);
        }
        Ok(reason)
    }

    async fn start(&self) -> Result<Box<dyn NodeModule>> {
        let args = &self.args;
        let local = LocalConfig::load(&args.config, &args.overrides).await?;
        let retry = RetryPolicy::fixed(Duration::from_millis(local.config.cluster.retry_interval_ms));

        let files = Arc::new(FileCoordinator::new(local.config.cluster.coordinator_dir.clone()));
        let config = if args.role.is_coordinator() {
            local.config.clone()
        } else {
            retry
                .run("cluster configuration", || {
                    NodeConfig::load_merged(&local, &args.overrides, files.as_ref())
                })
                .await?
        };

        let context = ModuleContext {
            node_name: args.node_name.clone(),
            role: args.role,
            local,
            config,
            coordinator: files.clone(),
            registry: files,
        };

        let module = self.registry.create(&context)?;
        if let Err(e) = module.init().await {
            error!("Initialisation of {} on {} failed: {}", args.role, args.node_name, e);
            return Err(NodeError::ModuleInit(args.role.to_string()));
        }

        retry.run(args.role.name(), || module.launch()).await?;
        Ok(module)
    }
}

/// Reads control frames until a finalize for `signal` or the channel closes
async fn wait_for_finalize<R>(mut control_in: R, signal: &str) -> StopReason
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        match read_frame::<_, SupervisorCommand>(&mut control_in).await {
            Ok(Some(command)) if command.signal_name() != signal => {
                warn!(
                    "Ignoring control command for signal '{}', expected '{}'",
                    command.signal_name(),
                    signal
                );
            }
            Ok(Some(SupervisorCommand::Finalize { graceful, .. })) => {
                return StopReason::Finalize { graceful };
            }
            Ok(None) => return StopReason::ChannelClosed,
            Err(e) => {
                warn!("Control channel failed: {}", e);
                return StopReason::ChannelClosed;
            }
        }
    }
}
