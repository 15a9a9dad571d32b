//! Integration tests for the node orchestration layer
//!
//! These tests drive the launcher, the node bootstrap and the backend actors
//! through their public APIs, over loopback TCP where the real system would.

use async_trait::async_trait;
use node::actor::{spawn_actor, CallChain};
use node::dedicated_server::{DedicatedServer, DedicatedServerRef, ServerDeps, ServerStatus, SessionControl};
use node::error::ActorError;
use node::server_pool::{InMemoryServerPool, ServerPool};
use node::sink::{ChannelSink, MessageSink, SinkRegistry};
use shared::{DedicatedServerInfo, SessionId};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn ds_info(port: u16) -> DedicatedServerInfo {
    DedicatedServerInfo {
        ip: "10.1.0.9".to_string(),
        port,
        name: "ds-integration".to_string(),
    }
}

/// LAUNCHER TESTS
mod launcher_tests {
    use super::*;
    use launcher::{LaunchError, NodeProcess, NodeProcessSupervisor, NodeSpawner, Readiness, SpawnRequest, SupervisorSettings};
    use shared::Role;
    use std::path::Path;
    use tokio::sync::watch;

    #[derive(Default)]
    struct Counters {
        log: Mutex<Vec<String>>,
        finalized: Mutex<u32>,
    }

    struct CountingNode {
        role: Role,
        signal: String,
        fail: bool,
        counters: Arc<Counters>,
        exit: (watch::Sender<bool>, watch::Receiver<bool>),
    }

    #[async_trait]
    impl NodeProcess for CountingNode {
        fn role(&self) -> Role {
            self.role
        }

        fn signal(&self) -> &str {
            &self.signal
        }

        async fn wait_ready(&mut self) -> Readiness {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.counters.log.lock().unwrap().push(format!("{} ready", self.role));
            if self.fail {
                Readiness::Failed {
                    reason: "config store unavailable".to_string(),
                    already_logged: false,
                }
            } else {
                Readiness::Ready
            }
        }

        async fn finalize(&mut self, _graceful: bool, _timeout: Duration) {
            tokio::time::sleep(Duration::from_millis(5)).await;
            *self.counters.finalized.lock().unwrap() += 1;
            let _ = self.exit.0.send(true);
        }

        fn exit_watch(&self) -> watch::Receiver<bool> {
            self.exit.1.clone()
        }
    }

    struct CountingSpawner {
        counters: Arc<Counters>,
        fail: Option<Role>,
    }

    #[async_trait]
    impl NodeSpawner for CountingSpawner {
        async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn NodeProcess>, LaunchError> {
            self.counters.log.lock().unwrap().push(format!("{} spawned", request.role));
            Ok(Box::new(CountingNode {
                role: request.role,
                signal: request.signal,
                fail: self.fail == Some(request.role),
                counters: Arc::clone(&self.counters),
                exit: watch::channel(false),
            }))
        }
    }

    fn supervisor(fail: Option<Role>) -> (Arc<NodeProcessSupervisor>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let spawner = Arc::new(CountingSpawner {
            counters: Arc::clone(&counters),
            fail,
        });
        (
            Arc::new(NodeProcessSupervisor::new(spawner, SupervisorSettings::default())),
            counters,
        )
    }

    /// FrontEnd only starts once the bootstrapper it depends on is ready
    #[tokio::test]
    async fn front_end_waits_for_bootstrapper() {
        let (supervisor, counters) = supervisor(None);
        supervisor
            .launch("rack-1", "FrontEnd, ConfigBootstrapper", Path::new("node.toml"), "")
            .await
            .unwrap();

        let log = counters.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "ConfigBootstrapper spawned",
                "ConfigBootstrapper ready",
                "FrontEnd spawned",
                "FrontEnd ready",
            ]
        );
    }

    /// A failing bootstrapper means FrontEnd is never spawned
    #[tokio::test]
    async fn bootstrapper_failure_prevents_front_end() {
        let (supervisor, counters) = supervisor(Some(Role::ConfigBootstrapper));
        let err = supervisor
            .launch("rack-1", "ConfigBootstrapper,FrontEnd", Path::new("node.toml"), "")
            .await
            .unwrap_err();

        assert!(matches!(err, LaunchError::NodeFailed { role: Role::ConfigBootstrapper, .. }));
        let log = counters.log.lock().unwrap().clone();
        assert!(log.iter().all(|entry| !entry.starts_with("FrontEnd")));
        assert_eq!(*counters.finalized.lock().unwrap(), 1);
    }

    /// Two concurrent shutdowns tear down each node exactly once
    #[tokio::test]
    async fn concurrent_shutdown_runs_once() {
        let (supervisor, counters) = supervisor(None);
        supervisor
            .launch("rack-1", "Backend,FrontEnd", Path::new("node.toml"), "")
            .await
            .unwrap();

        let a = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move { supervisor.shutdown(true).await }
        });
        let b = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move { supervisor.shutdown(true).await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(u8::from(a) + u8::from(b), 1);
        assert_eq!(*counters.finalized.lock().unwrap(), 3);
    }
}

/// DEDICATED SERVER LIFECYCLE TESTS
mod dedicated_server_tests {
    use super::*;

    #[derive(Default)]
    struct CountingSessions {
        closed: Mutex<Vec<SessionId>>,
    }

    #[async_trait]
    impl SessionControl for CountingSessions {
        async fn close_session(&self, _chain: &CallChain, session_id: SessionId) -> Result<(), ActorError> {
            self.closed.lock().unwrap().push(session_id);
            Ok(())
        }
    }

    struct Fixture {
        server: DedicatedServerRef,
        pool: Arc<InMemoryServerPool>,
        sessions: Arc<CountingSessions>,
    }

    fn fixture(server_id: u64) -> Fixture {
        let pool = Arc::new(InMemoryServerPool::new());
        let sinks = Arc::new(SinkRegistry::new());
        let (sink, _commands) = ChannelSink::new();
        sinks.insert(server_id, Arc::new(sink) as Arc<dyn MessageSink>);
        let sessions = Arc::new(CountingSessions::default());

        let deps = ServerDeps {
            pool: pool.clone(),
            sinks,
            sessions: sessions.clone(),
        };
        let server: DedicatedServerRef = spawn_actor(server_id, DedicatedServer::new(server_id, deps)).into();
        Fixture { server, pool, sessions }
    }

    #[tokio::test]
    async fn enroll_validates_port() {
        let f = fixture(1);
        let root = CallChain::root();

        assert!(f.server.enroll(&root, ds_info(0)).await.is_err());
        assert_eq!(f.server.status(&root).await.unwrap(), ServerStatus::Invalid);

        f.server.enroll(&root, ds_info(7777)).await.unwrap();
        assert_eq!(f.server.status(&root).await.unwrap(), ServerStatus::Enlisted);
        assert_eq!(f.pool.candidates().await, vec![1]);
    }

    /// Racing acquisitions: one winner, one invalid-operation
    #[tokio::test]
    async fn concurrent_acquire_has_single_winner() {
        let f = fixture(2);
        f.server.enroll(&CallChain::root(), ds_info(7777)).await.unwrap();

        let first = f.server.clone();
        let second = f.server.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.on_acquired(&CallChain::root(), 42).await }),
            tokio::spawn(async move { second.on_acquired(&CallChain::root(), 43).await }),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.is_ok() != b.is_ok());
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(loser, Err(ActorError::InvalidOperation(_))));

        let winner = f.server.acquired_by(&CallChain::root()).await.unwrap();
        assert!(winner == 42 || winner == 43);
        assert_eq!(f.server.status(&CallChain::root()).await.unwrap(), ServerStatus::Acquired);
    }

    /// Release from a session that does not own the server changes nothing
    #[tokio::test]
    async fn release_by_stranger_keeps_owner() {
        let f = fixture(3);
        let root = CallChain::root();
        f.server.enroll(&root, ds_info(7777)).await.unwrap();
        f.server.on_acquired(&root, 42).await.unwrap();

        assert!(f.server.on_released(&root, 99).await.is_ok());
        assert_eq!(f.server.acquired_by(&root).await.unwrap(), 42);
    }

    /// Withdrawing an acquired server closes its session exactly once
    #[tokio::test]
    async fn withdraw_closes_session_once() {
        let f = fixture(4);
        let root = CallChain::root();
        f.server.enroll(&root, ds_info(7777)).await.unwrap();
        f.server.on_acquired(&root, 42).await.unwrap();

        let root2 = CallChain::root();
        let (a, b) = tokio::join!(f.server.withdraw(&root), f.server.withdraw(&root2));
        a.unwrap();
        b.unwrap();

        assert_eq!(*f.sessions.closed.lock().unwrap(), vec![42]);
        assert_eq!(f.server.status(&root).await.unwrap(), ServerStatus::Withdrawn);
        assert!(f.pool.candidates().await.is_empty());
    }
}

/// END-TO-END NODE TESTS
mod node_tests {
    use super::*;
    use node::bootstrap::{ModuleBootstrap, NodeArgs, StopReason};
    use node::bootstrap::NodeModule;
    use node::cluster::{ClusterClient, FileCoordinator, LocalCluster, ServiceRegistry};
    use node::config::BackendSection;
    use node::error::NodeError;
    use node::modules::{default_registry, BackendModule};
    use shared::{
        read_frame, write_frame, ClientPacket, CommandKind, DedicatedServerPacket, NodeSignal, PlayerContext,
        Role, ServerPacket, SupervisorCommand,
    };
    use std::path::PathBuf;
    use tokio::io::{duplex, DuplexStream};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    struct RunningNode {
        signal: String,
        to_node: DuplexStream,
        from_node: DuplexStream,
        task: JoinHandle<Result<StopReason, NodeError>>,
    }

    impl RunningNode {
        fn start(role: Role, config: &PathBuf) -> Self {
            let signal = format!("it.{}.{}", role, Uuid::new_v4().simple());
            let args = NodeArgs {
                node_name: "it-node".to_string(),
                role,
                config: config.clone(),
                overrides: String::new(),
                signal: signal.clone(),
            };
            let (from_node, node_out) = duplex(4096);
            let (node_in, to_node) = duplex(4096);
            let task = tokio::spawn(ModuleBootstrap::new(args, default_registry()).run(node_in, node_out));
            Self {
                signal,
                to_node,
                from_node,
                task,
            }
        }

        async fn ready(&mut self) {
            let signal: NodeSignal = tokio::time::timeout(Duration::from_secs(10), read_frame(&mut self.from_node))
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(
                signal,
                NodeSignal::Ready {
                    signal: self.signal.clone()
                }
            );
        }

        async fn finalize(mut self) {
            let command = SupervisorCommand::Finalize {
                signal: self.signal.clone(),
                graceful: true,
            };
            tokio_test::assert_ok!(write_frame(&mut self.to_node, &command).await);
            let done: NodeSignal = read_frame(&mut self.from_node).await.unwrap().unwrap();
            assert!(matches!(done, NodeSignal::Finalized { .. }));
            assert_eq!(
                self.task.await.unwrap().unwrap(),
                StopReason::Finalize { graceful: true }
            );
        }
    }

    async fn write_config() -> (PathBuf, FileCoordinator) {
        let dir = std::env::temp_dir().join(format!("it-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let coordinator_dir = dir.join("coordinator");
        let text = format!(
            r#"
[cluster]
coordinator_dir = {:?}
retry_interval_ms = 20

[backend]
bind = "127.0.0.1:0"
access_address = "127.0.0.1"
gateway_bind = "127.0.0.1:0"

[front_end.endpoint]
bind = "127.0.0.1:0"
access_address = "127.0.0.1"
ssl_protocol = "none"
"#,
            coordinator_dir.display().to_string()
        );
        let path = dir.join("node.toml");
        tokio::fs::write(&path, text).await.unwrap();
        (path, FileCoordinator::new(coordinator_dir))
    }

    async fn endpoint_of(registry: &FileCoordinator, role: &str) -> String {
        registry
            .services()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.role_name == role)
            .map(|s| s.endpoint())
            .unwrap()
    }

    /// Every role boots from one config file and a player joins through the edge
    #[tokio::test]
    async fn roles_boot_in_order_and_serve_players() {
        let (config, registry) = write_config().await;

        let mut bootstrapper = RunningNode::start(Role::ConfigBootstrapper, &config);
        bootstrapper.ready().await;
        let mut backend = RunningNode::start(Role::Backend, &config);
        backend.ready().await;
        let mut front_end = RunningNode::start(Role::FrontEnd, &config);
        front_end.ready().await;

        let mut player = TcpStream::connect(endpoint_of(&registry, "FrontEnd").await).await.unwrap();
        let join = ClientPacket::Join {
            context: PlayerContext {
                profile_id: 501,
                display_name: "integration".to_string(),
            },
            session_id: 77,
            token: String::new(),
        };
        write_frame(&mut player, &join).await.unwrap();
        let reply: ServerPacket = read_frame(&mut player).await.unwrap().unwrap();
        assert!(matches!(reply, ServerPacket::Joined { index: 0, .. }));

        write_frame(&mut player, &ClientPacket::Leave).await.unwrap();
        let closed: ServerPacket = read_frame(&mut player).await.unwrap().unwrap();
        assert!(matches!(closed, ServerPacket::Closed { .. }));

        front_end.finalize().await;
        backend.finalize().await;
        bootstrapper.finalize().await;
        assert!(registry.services().await.unwrap().is_empty());
    }

    /// A dedicated server enrolled through the gateway is handed to a session
    /// and takes that session down when it disconnects
    #[tokio::test]
    async fn dedicated_server_disconnect_closes_session() {
        let registry = Arc::new(FileCoordinator::new(
            std::env::temp_dir().join(format!("it-ds-{}", Uuid::new_v4())),
        ));
        let settings = BackendSection {
            bind: "127.0.0.1:0".to_string(),
            access_address: "127.0.0.1".to_string(),
            gateway_bind: Some("127.0.0.1:0".to_string()),
            ..BackendSection::default()
        };
        let backend = BackendModule::new("it-node", settings, registry);
        backend.launch().await.unwrap();

        let mut ds = TcpStream::connect(backend.gateway_addr().unwrap()).await.unwrap();
        write_frame(&mut ds, &DedicatedServerPacket::Enroll { info: ds_info(7777) })
            .await
            .unwrap();
        let server_id = match read_frame(&mut ds).await.unwrap().unwrap() {
            DedicatedServerPacket::Enrolled { server_id } => server_id,
            other => panic!("unexpected {:?}", other),
        };

        let cluster = LocalCluster::new(Arc::clone(backend.runtime()));
        cluster.connect().await.unwrap();
        let invoker = cluster.invoker();
        assert_eq!(invoker.acquire_server(88).await.unwrap(), server_id);
        match read_frame(&mut ds).await.unwrap().unwrap() {
            DedicatedServerPacket::Command(command) => assert_eq!(command.command, CommandKind::OnAcquired),
            other => panic!("unexpected {:?}", other),
        }

        drop(ds);
        let mut status = ServerStatus::Acquired;
        for _ in 0..200 {
            status = invoker.server_status(server_id).await.unwrap();
            if status == ServerStatus::Withdrawn {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, ServerStatus::Withdrawn);

        let session = backend.runtime().session(88).await.unwrap();
        assert!(session.is_closed(&CallChain::root()).await.unwrap());
        backend.shutdown().await;
    }
}
