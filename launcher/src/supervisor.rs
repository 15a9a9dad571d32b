//! Launches role node processes in dependency order and shuts them down

use crate::error::LaunchError;
use crate::process::{exited, NodeProcess, NodeSpawner, Readiness, SpawnRequest};
use futures::future::{join_all, select_all, FutureExt};
use log::{debug, error, info};
use shared::{resolve_launch_order, Role, RoleSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long a node gets to acknowledge finalize and to exit
    pub finalize_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            finalize_timeout: Duration::from_secs(10),
        }
    }
}

struct Node {
    process: Box<dyn NodeProcess>,
    ready: bool,
}

pub struct NodeProcessSupervisor {
    spawner: Arc<dyn NodeSpawner>,
    settings: SupervisorSettings,
    nodes: Mutex<Vec<Node>>,
    exits: StdMutex<Vec<(Role, watch::Receiver<bool>)>>,
    shut_down: AtomicBool,
}

impl NodeProcessSupervisor {
    pub fn new(spawner: Arc<dyn NodeSpawner>, settings: SupervisorSettings) -> Self {
        Self {
            spawner,
            settings,
            nodes: Mutex::new(Vec::new()),
            exits: StdMutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Spawns a node per role in the closure of `roles` and waits until all
    /// of them are ready
    ///
    /// On failure every node started so far is shut down before the error is
    /// returned.
    pub async fn launch(
        &self,
        node_name: &str,
        roles: &str,
        config: &Path,
        overrides: &str,
    ) -> Result<Vec<Role>, LaunchError> {
        let requested = RoleSet::parse(roles)?;
        let order = resolve_launch_order(requested)?;
        info!(
            "Launching {} on {}",
            order.iter().map(|r| r.name()).collect::<Vec<_>>().join(", "),
            node_name
        );

        let result = self.spawn_all(node_name, &order, config, overrides).await;
        if let Err(e) = &result {
            if !e.is_already_logged() {
                error!("Launch aborted: {}", e);
            }
            self.shutdown(true).await;
        }
        result.map(|()| order)
    }

    async fn spawn_all(&self, node_name: &str, order: &[Role], config: &Path, overrides: &str) -> Result<(), LaunchError> {
        let mut nodes = self.nodes.lock().await;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(LaunchError::InvalidArgument("supervisor already shut down".to_string()));
        }

        for role in order {
            for dep in role.dependencies() {
                if let Some(node) = nodes.iter_mut().find(|n| n.process.role() == *dep) {
                    await_ready(node).await?;
                }
            }

            let request = SpawnRequest::new(node_name, *role, config.to_path_buf(), overrides);
            let process = self.spawner.spawn(request).await?;
            if let Ok(mut exits) = self.exits.lock() {
                exits.push((*role, process.exit_watch()));
            }
            nodes.push(Node { process, ready: false });
        }

        for node in nodes.iter_mut() {
            await_ready(node).await?;
        }
        Ok(())
    }

    /// Finalizes every node; only the first call does anything
    ///
    /// Returns whether this call performed the teardown.
    pub async fn shutdown(&self, graceful: bool) -> bool {
        if self
            .shut_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Shutdown already in progress");
            return false;
        }

        let mut nodes = std::mem::take(&mut *self.nodes.lock().await);
        info!("Shutting down {} node(s)", nodes.len());
        let timeout = self.settings.finalize_timeout;
        join_all(
            nodes
                .iter_mut()
                .rev()
                .map(|node| node.process.finalize(graceful, timeout)),
        )
        .await;
        info!("All nodes finalized");
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Resolves with the role of the first node to exit on its own; never
    /// resolves when nothing was launched
    pub async fn wait_for_exit(&self) -> Role {
        let exits = self.exits.lock().map(|e| e.clone()).unwrap_or_default();
        if exits.is_empty() {
            return futures::future::pending().await;
        }

        let waits = exits
            .into_iter()
            .map(|(role, exit)| exited(exit).map(move |()| role).boxed());
        let (role, _, _) = select_all(waits).await;
        role
    }
}

async fn await_ready(node: &mut Node) -> Result<(), LaunchError> {
    if node.ready {
        return Ok(());
    }

    let role = node.process.role();
    match node.process.wait_ready().await {
        Readiness::Ready => {
            node.ready = true;
            info!("The {} node is ready", role);
            Ok(())
        }
        Readiness::Failed {
            already_logged: true,
            ..
        } => Err(LaunchError::AlreadyLogged(role)),
        Readiness::Failed { reason, .. } => Err(LaunchError::NodeFailed { role, reason }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Journal {
        events: StdMutex<Vec<String>>,
        finalized: AtomicUsize,
    }

    impl Journal {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    struct FakeNode {
        role: Role,
        signal: String,
        readiness: Readiness,
        journal: Arc<Journal>,
        exit_tx: watch::Sender<bool>,
        exit_rx: watch::Receiver<bool>,
    }

    #[async_trait]
    impl NodeProcess for FakeNode {
        fn role(&self) -> Role {
            self.role
        }

        fn signal(&self) -> &str {
            &self.signal
        }

        async fn wait_ready(&mut self) -> Readiness {
            self.journal.push(format!("ready {}", self.role));
            self.readiness.clone()
        }

        async fn finalize(&mut self, _graceful: bool, _timeout: Duration) {
            tokio::task::yield_now().await;
            self.journal.finalized.fetch_add(1, Ordering::SeqCst);
            self.journal.push(format!("finalize {}", self.role));
            let _ = self.exit_tx.send(true);
        }

        fn exit_watch(&self) -> watch::Receiver<bool> {
            self.exit_rx.clone()
        }
    }

    struct FakeSpawner {
        journal: Arc<Journal>,
        failing: Option<(Role, bool)>,
    }

    #[async_trait]
    impl NodeSpawner for FakeSpawner {
        async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn NodeProcess>, LaunchError> {
            self.journal.push(format!("spawn {}", request.role));
            let readiness = match self.failing {
                Some((role, already_logged)) if role == request.role => Readiness::Failed {
                    reason: "boom".to_string(),
                    already_logged,
                },
                _ => Readiness::Ready,
            };
            let (exit_tx, exit_rx) = watch::channel(false);
            Ok(Box::new(FakeNode {
                role: request.role,
                signal: request.signal,
                readiness,
                journal: Arc::clone(&self.journal),
                exit_tx,
                exit_rx,
            }))
        }
    }

    fn supervisor(failing: Option<(Role, bool)>) -> (NodeProcessSupervisor, Arc<Journal>) {
        let journal = Arc::new(Journal::default());
        let spawner = Arc::new(FakeSpawner {
            journal: Arc::clone(&journal),
            failing,
        });
        (
            NodeProcessSupervisor::new(spawner, SupervisorSettings::default()),
            journal,
        )
    }

    #[tokio::test]
    async fn test_dependencies_are_ready_before_dependents_spawn() {
        let (supervisor, journal) = supervisor(None);
        let order = tokio_test::assert_ok!(
            supervisor
                .launch("node-a", "FrontEnd", Path::new("node.toml"), "")
                .await
        );

        assert_eq!(order, vec![Role::ConfigBootstrapper, Role::FrontEnd]);
        assert_eq!(
            journal.events(),
            vec![
                "spawn ConfigBootstrapper",
                "ready ConfigBootstrapper",
                "spawn FrontEnd",
                "ready FrontEnd",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_dependency_stops_the_launch() {
        let (supervisor, journal) = supervisor(Some((Role::ConfigBootstrapper, false)));
        let err = supervisor
            .launch("node-a", "ConfigBootstrapper,FrontEnd", Path::new("node.toml"), "")
            .await
            .unwrap_err();

        assert!(matches!(err, LaunchError::NodeFailed { role: Role::ConfigBootstrapper, .. }));
        let events = journal.events();
        assert!(!events.contains(&"spawn FrontEnd".to_string()));
        assert!(events.contains(&"finalize ConfigBootstrapper".to_string()));
        assert!(supervisor.is_shut_down());
    }

    #[tokio::test]
    async fn test_already_logged_failure_is_passed_through() {
        let (supervisor, _journal) = supervisor(Some((Role::Backend, true)));
        let err = supervisor
            .launch("node-a", "Backend", Path::new("node.toml"), "")
            .await
            .unwrap_err();
        assert!(err.is_already_logged());
    }

    #[tokio::test]
    async fn test_invalid_role_sets_are_rejected() {
        let (supervisor, journal) = supervisor(None);
        for roles in ["", "FrontEnd,Lobby"] {
            let err = supervisor
                .launch("node-a", roles, Path::new("node.toml"), "")
                .await
                .unwrap_err();
            assert!(matches!(err, LaunchError::InvalidArgument(_)));
        }
        assert!(journal.events().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_tears_down_once() {
        let (supervisor, journal) = supervisor(None);
        supervisor
            .launch("node-a", "Backend,FrontEnd", Path::new("node.toml"), "")
            .await
            .unwrap();

        let (first, second) = tokio::join!(supervisor.shutdown(true), supervisor.shutdown(true));
        assert!(first ^ second);
        assert_eq!(journal.finalized.load(Ordering::SeqCst), 3);
        assert!(!supervisor.shutdown(false).await);
    }

    #[tokio::test]
    async fn test_wait_for_exit_reports_first_exited_role() {
        let (supervisor, _journal) = supervisor(None);
        supervisor
            .launch("node-a", "Backend", Path::new("node.toml"), "")
            .await
            .unwrap();

        let exit = {
            let nodes = supervisor.nodes.lock().await;
            nodes
                .iter()
                .find(|n| n.process.role() == Role::Backend)
                .map(|n| n.process.exit_watch())
                .unwrap()
        };
        assert!(!*exit.borrow());

        let (role, torn_down) = tokio::join!(supervisor.wait_for_exit(), supervisor.shutdown(true));
        assert!(torn_down);
        assert!(role == Role::Backend || role == Role::ConfigBootstrapper);
    }
}
