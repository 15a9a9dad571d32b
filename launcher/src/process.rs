//! Node processes and how they are spawned
//!
//! Each role runs in its own OS process. The launcher passes the bootstrap
//! arguments on the command line and keeps a control channel on the child's
//! stdin/stdout: [`SupervisorCommand`]s go down, [`NodeSignal`]s come back,
//! every frame tagged with the signal name generated for that process.

use crate::error::LaunchError;
use async_trait::async_trait;
use log::{debug, info, warn};
use shared::{node_args, read_frame, write_frame, NodeSignal, Role, SupervisorCommand};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};

/// Arguments for one node process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub node_name: String,
    pub role: Role,
    pub config: PathBuf,
    pub overrides: String,
    pub signal: String,
}

impl SpawnRequest {
    pub fn new(node_name: &str, role: Role, config: PathBuf, overrides: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            role,
            config,
            overrides: overrides.to_string(),
            signal: signal_name(node_name, role),
        }
    }

    /// Command line understood by the node binary
    pub fn args(&self) -> Vec<String> {
        vec![
            node_args::NODE_NAME.to_string(),
            self.node_name.clone(),
            node_args::ROLE.to_string(),
            self.role.name().to_string(),
            node_args::CONFIG.to_string(),
            self.config.display().to_string(),
            node_args::OVERRIDES.to_string(),
            self.overrides.clone(),
            node_args::SIGNAL.to_string(),
            self.signal.clone(),
        ]
    }
}

/// Unique per spawned process: node, role, launcher pid and a random suffix
pub fn signal_name(node_name: &str, role: Role) -> String {
    format!(
        "{}.{}.{}.{:08x}",
        node_name,
        role,
        std::process::id(),
        rand::random::<u32>()
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Failed { reason: String, already_logged: bool },
}

#[async_trait]
pub trait NodeProcess: Send {
    fn role(&self) -> Role;

    fn signal(&self) -> &str;

    /// Resolves once the node signals readiness or failure, or exits
    async fn wait_ready(&mut self) -> Readiness;

    /// Asks the node to finalize and waits up to `timeout` for the
    /// acknowledgement and the exit; kills it otherwise or when not `graceful`
    async fn finalize(&mut self, graceful: bool, timeout: Duration);

    /// Flips to `true` when the process has exited
    fn exit_watch(&self) -> watch::Receiver<bool>;
}

#[async_trait]
pub trait NodeSpawner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn NodeProcess>, LaunchError>;
}

/// Spawns the node binary as a child process
pub struct ChildProcessSpawner {
    binary: PathBuf,
}

impl ChildProcessSpawner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    /// The `node` executable installed next to the running launcher
    pub fn sibling_binary() -> io::Result<PathBuf> {
        let exe = std::env::current_exe()?;
        let name = format!("node{}", std::env::consts::EXE_SUFFIX);
        Ok(exe.with_file_name(name))
    }
}

#[async_trait]
impl NodeSpawner for ChildProcessSpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn NodeProcess>, LaunchError> {
        let role = request.role;
        let child = Command::new(&self.binary)
            .args(request.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn { role, source })?;

        info!(
            "Spawned the {} node (pid {}) with signal {}",
            role,
            child.id().unwrap_or_default(),
            request.signal
        );
        let node = ChildNode::attach(role, request.signal, child).map_err(|source| LaunchError::Spawn { role, source })?;
        Ok(Box::new(node))
    }
}

pub struct ChildNode {
    role: Role,
    signal: String,
    stdin: Option<ChildStdin>,
    signals: mpsc::UnboundedReceiver<NodeSignal>,
    exited: watch::Receiver<bool>,
    kill: Option<oneshot::Sender<()>>,
}

impl ChildNode {
    /// Takes over the child's piped stdin/stdout
    pub fn attach(role: Role, signal: String, mut child: Child) -> io::Result<Self> {
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "node stdout is not piped"))?;

        let (signal_tx, signals) = mpsc::unbounded_channel();
        tokio::spawn(read_signals(stdout, signal.clone(), role, signal_tx));

        let (exit_tx, exited) = watch::channel(false);
        let (kill, kill_rx) = oneshot::channel();
        tokio::spawn(watch_exit(child, role, kill_rx, exit_tx));

        Ok(Self {
            role,
            signal,
            stdin,
            signals,
            exited,
            kill: Some(kill),
        })
    }

    fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    async fn wait_finalized(&mut self) -> bool {
        while let Some(signal) = self.signals.recv().await {
            match signal {
                NodeSignal::Finalized { .. } => return true,
                other => debug!("Ignoring {:?} from the {} node while finalizing", other, self.role),
            }
        }
        false
    }
}

async fn read_signals(
    mut stdout: ChildStdout,
    expected: String,
    role: Role,
    tx: mpsc::UnboundedSender<NodeSignal>,
) {
    loop {
        match read_frame::<_, NodeSignal>(&mut stdout).await {
            Ok(Some(signal)) if signal.signal_name() != expected => {
                warn!(
                    "Rejecting signal '{}' from the {} node, expected '{}'",
                    signal.signal_name(),
                    role,
                    expected
                );
            }
            Ok(Some(signal)) => {
                if tx.send(signal).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("Control channel of the {} node failed: {}", role, e);
                return;
            }
        }
    }
}

async fn watch_exit(mut child: Child, role: Role, kill: oneshot::Receiver<()>, exited: watch::Sender<bool>) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill the {} node: {}", role, e);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) if status.success() => info!("The {} node exited", role),
        Ok(status) => warn!("The {} node exited with {}", role, status),
        Err(e) => warn!("Lost track of the {} node: {}", role, e),
    }
    let _ = exited.send(true);
}

/// Resolves once `exit` reports the process gone
pub async fn exited(mut exit: watch::Receiver<bool>) {
    while !*exit.borrow_and_update() {
        if exit.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl NodeProcess for ChildNode {
    fn role(&self) -> Role {
        self.role
    }

    fn signal(&self) -> &str {
        &self.signal
    }

    async fn wait_ready(&mut self) -> Readiness {
        while let Some(signal) = self.signals.recv().await {
            match signal {
                NodeSignal::Ready { .. } => return Readiness::Ready,
                NodeSignal::Failed {
                    reason,
                    already_logged,
                    ..
                } => {
                    return Readiness::Failed {
                        reason,
                        already_logged,
                    }
                }
                NodeSignal::Finalized { .. } => {
                    debug!("The {} node finalized before reporting readiness", self.role)
                }
            }
        }
        Readiness::Failed {
            reason: "exited before signalling readiness".to_string(),
            already_logged: false,
        }
    }

    async fn finalize(&mut self, graceful: bool, timeout: Duration) {
        if graceful {
            if let Some(stdin) = self.stdin.as_mut() {
                let command = SupervisorCommand::Finalize {
                    signal: self.signal.clone(),
                    graceful,
                };
                match write_frame(stdin, &command).await {
                    Ok(()) => {
                        if tokio::time::timeout(timeout, self.wait_finalized()).await.is_err() {
                            warn!("The {} node did not acknowledge finalize within {:?}", self.role, timeout);
                        }
                    }
                    Err(e) => debug!("Could not send finalize to the {} node: {}", self.role, e),
                }
            }
        }

        // Closing stdin also ends the control channel
        self.stdin = None;
        if !graceful || tokio::time::timeout(timeout, exited(self.exited.clone())).await.is_err() {
            warn!("Killing the {} node", self.role);
            self.kill();
            exited(self.exited.clone()).await;
        }
    }

    fn exit_watch(&self) -> watch::Receiver<bool> {
        self.exited.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(role: Role) -> SpawnRequest {
        SpawnRequest::new("node-a", role, PathBuf::from("node.toml"), "backend.bind=127.0.0.1:0")
    }

    #[test]
    fn test_signal_names_are_unique_per_spawn() {
        let a = signal_name("node-a", Role::Backend);
        let b = signal_name("node-a", Role::Backend);
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("node-a.Backend.{}.", std::process::id())));
    }

    #[test]
    fn test_request_arguments_use_node_flags() {
        let request = request(Role::FrontEnd);
        let args = request.args();
        assert_eq!(args.len(), 10);
        assert_eq!(args[0], node_args::NODE_NAME);
        assert_eq!(args[3], "FrontEnd");
        assert_eq!(args[7], "backend.bind=127.0.0.1:0");
        assert_eq!(args[9], request.signal);
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let spawner = ChildProcessSpawner::new("/nonexistent/gamecloud-node");
        match spawner.spawn(request(Role::Backend)).await {
            Err(LaunchError::Spawn { role, .. }) => assert_eq!(role, Role::Backend),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("spawned a missing binary"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exiting_silently_is_not_ready() {
        let spawner = ChildProcessSpawner::new("true");
        let mut node = spawner.spawn(request(Role::ConfigBootstrapper)).await.unwrap();

        match node.wait_ready().await {
            Readiness::Failed { already_logged, .. } => assert!(!already_logged),
            Readiness::Ready => panic!("silent process reported ready"),
        }
        tokio::time::timeout(Duration::from_secs(5), exited(node.exit_watch()))
            .await
            .unwrap();
        node.finalize(true, Duration::from_millis(100)).await;
    }
}
