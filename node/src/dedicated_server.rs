//! Lifecycle of one physical dedicated server
//!
//! ```text
//! Invalid --Enroll--> Enlisted --OnAcquired--> Acquired
//!                        ^                        |
//!                        +-------OnReleased-------+
//! Enlisted/Acquired --Withdraw--> Withdrawn
//! ```
//!
//! The actor is reentrant: `Withdraw` closes the owning session, and that
//! session releases the server from inside the same call chain.

use crate::actor::{Actor, ActorRef, CallChain};
use crate::error::ActorError;
use crate::server_pool::ServerPool;
use crate::sink::{same_sink, MessageSink, SinkResolver};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::{DedicatedServerInfo, ServerCommand, ServerId, SessionId};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Invalid,
    Enlisted,
    Acquired,
    Withdrawn,
}

/// Notified synchronously on every status transition
pub trait ServerObserver: Send + Sync {
    fn on_state_changed(&self, server_id: ServerId, status: ServerStatus);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(u64);

/// Forced teardown of sessions, used when an acquired server withdraws
#[async_trait]
pub trait SessionControl: Send + Sync {
    async fn close_session(&self, chain: &CallChain, session_id: SessionId) -> Result<(), ActorError>;
}

#[derive(Clone)]
pub struct ServerDeps {
    pub pool: Arc<dyn ServerPool>,
    pub sinks: Arc<dyn SinkResolver>,
    pub sessions: Arc<dyn SessionControl>,
}

pub struct DedicatedServer {
    server_id: ServerId,
    status: ServerStatus,
    info: Option<DedicatedServerInfo>,
    acquired_by: SessionId,
    sink: Option<Arc<dyn MessageSink>>,
    observers: BTreeMap<ObserverId, Arc<dyn ServerObserver>>,
    next_observer: u64,
    withdrawing: bool,
    deps: ServerDeps,
}

impl Actor for DedicatedServer {
    const KIND: &'static str = "DedicatedServer";
    const REENTRANT: bool = true;
}

impl DedicatedServer {
    pub fn new(server_id: ServerId, deps: ServerDeps) -> Self {
        Self {
            server_id,
            status: ServerStatus::Invalid,
            info: None,
            acquired_by: 0,
            sink: None,
            observers: BTreeMap::new(),
            next_observer: 1,
            withdrawing: false,
            deps,
        }
    }

    fn set_status(&mut self, status: ServerStatus) {
        debug!(
            "Dedicated server {} {:?} -> {:?}",
            self.server_id, self.status, status
        );
        self.status = status;
        for observer in self.observers.values() {
            observer.on_state_changed(self.server_id, status);
        }
    }

    fn send_command(&self, command: ServerCommand) {
        match &self.sink {
            Some(sink) => {
                if let Err(e) = sink.send(command) {
                    warn!("Dedicated server {}: {}", self.server_id, e);
                }
            }
            None => debug!(
                "Dedicated server {} has no connection, dropping {:?}",
                self.server_id, command.command
            ),
        }
    }
}

/// Typed address of a [`DedicatedServer`]
#[derive(Clone, Debug)]
pub struct DedicatedServerRef(ActorRef<DedicatedServer>);

impl From<ActorRef<DedicatedServer>> for DedicatedServerRef {
    fn from(actor: ActorRef<DedicatedServer>) -> Self {
        Self(actor)
    }
}

impl DedicatedServerRef {
    pub fn server_id(&self) -> ServerId {
        self.0.id().key
    }

    pub async fn enroll(&self, chain: &CallChain, info: DedicatedServerInfo) -> Result<(), ActorError> {
        self.0
            .call(chain, move |turn| async move {
                if info.port == 0 {
                    return Err(ActorError::out_of_range(format!(
                        "dedicated server '{}' enrolled with port 0",
                        info.name
                    )));
                }

                let mut server = turn.state().await;
                if server.status != ServerStatus::Invalid {
                    return Err(ActorError::invalid_operation(format!(
                        "dedicated server {} is already {:?}",
                        server.server_id, server.status
                    )));
                }

                let server_id = server.server_id;
                server.sink = server.deps.sinks.resolve(server_id);
                server.deps.pool.register(server_id).await;
                info!(
                    "Dedicated server {} enrolled as '{}' at {}:{}",
                    server_id, info.name, info.ip, info.port
                );
                server.info = Some(info);
                server.set_status(ServerStatus::Enlisted);
                turn.pin();
                Ok(())
            })
            .await
    }

    pub async fn on_acquired(&self, chain: &CallChain, session_id: SessionId) -> Result<(), ActorError> {
        self.0
            .call(chain, move |turn| async move {
                let mut server = turn.state().await;
                if session_id == 0 {
                    return Err(ActorError::invalid_argument("session id 0 cannot acquire a server"));
                }
                if server.acquired_by != 0 {
                    return Err(ActorError::invalid_operation(format!(
                        "dedicated server {} is already acquired by session {}",
                        server.server_id, server.acquired_by
                    )));
                }
                if server.status != ServerStatus::Enlisted {
                    return Err(ActorError::invalid_operation(format!(
                        "dedicated server {} is {:?}, not enlisted",
                        server.server_id, server.status
                    )));
                }

                server.acquired_by = session_id;
                server.set_status(ServerStatus::Acquired);
                server.send_command(ServerCommand::on_acquired(session_id));
                Ok(())
            })
            .await
    }

    pub async fn send_meta_msg(&self, chain: &CallChain, msg: String) -> Result<(), ActorError> {
        self.0
            .call(chain, move |turn| async move {
                turn.state().await.send_command(ServerCommand::meta_msg(msg));
                Ok(())
            })
            .await
    }

    pub async fn load_level(
        &self,
        chain: &CallChain,
        map: String,
        rules: String,
        custom: Option<Vec<u8>>,
    ) -> Result<(), ActorError> {
        self.0
            .call(chain, move |turn| async move {
                let server = turn.state().await;
                debug_assert!(
                    server.sink.is_some(),
                    "LoadLevel sent to dedicated server {} without a connection",
                    server.server_id
                );
                if server.sink.is_some() {
                    server.send_command(ServerCommand::load_level(map, rules, custom));
                }
                Ok(())
            })
            .await
    }

    /// Releases the server from `session_id`
    ///
    /// A release from a session that does not own the server is logged and
    /// otherwise ignored.
    pub async fn on_released(&self, chain: &CallChain, session_id: SessionId) -> Result<(), ActorError> {
        self.0
            .call(chain, move |turn| async move {
                let mut server = turn.state().await;
                if session_id == 0 || server.acquired_by != session_id {
                    warn!(
                        "Dedicated server {} ignoring release from session {} (acquired by {})",
                        server.server_id, session_id, server.acquired_by
                    );
                    return Ok(());
                }

                server.acquired_by = 0;
                if !server.withdrawing {
                    server.set_status(ServerStatus::Enlisted);
                }
                Ok(())
            })
            .await
    }

    pub async fn withdraw(&self, chain: &CallChain) -> Result<(), ActorError> {
        self.0
            .call(chain, move |turn| async move {
                let (deps, server_id, stored_sink, owner) = {
                    let mut server = turn.state().await;
                    if matches!(server.status, ServerStatus::Invalid | ServerStatus::Withdrawn)
                        || server.withdrawing
                    {
                        return Ok(());
                    }
                    server.withdrawing = true;
                    (
                        server.deps.clone(),
                        server.server_id,
                        server.sink.clone(),
                        server.acquired_by,
                    )
                };

                deps.pool.deregister(server_id).await;

                match (&stored_sink, deps.sinks.resolve(server_id)) {
                    (Some(stored), Some(current)) if !same_sink(stored, &current) => {
                        warn!("Dedicated server {} withdrawing with a stale connection", server_id)
                    }
                    (None, Some(_)) => {
                        warn!("Dedicated server {} gained a connection it never stored", server_id)
                    }
                    _ => {}
                }

                if owner != 0 {
                    info!("Dedicated server {} withdrawing, closing session {}", server_id, owner);
                    if let Err(e) = deps.sessions.close_session(turn.chain(), owner).await {
                        warn!("Failed to close session {} on withdraw: {}", owner, e);
                    }
                }

                let mut server = turn.state().await;
                server.acquired_by = 0;
                server.sink = None;
                server.withdrawing = false;
                server.set_status(ServerStatus::Withdrawn);
                turn.unpin();
                Ok(())
            })
            .await
    }

    pub async fn subscribe(
        &self,
        chain: &CallChain,
        observer: Arc<dyn ServerObserver>,
    ) -> Result<ObserverId, ActorError> {
        self.0
            .call(chain, move |turn| async move {
                let mut server = turn.state().await;
                let id = ObserverId(server.next_observer);
                server.next_observer += 1;
                server.observers.insert(id, observer);
                Ok(id)
            })
            .await
    }

    pub async fn unsubscribe(&self, chain: &CallChain, id: ObserverId) -> Result<bool, ActorError> {
        self.0
            .call(chain, move |turn| async move {
                Ok(turn.state().await.observers.remove(&id).is_some())
            })
            .await
    }

    pub async fn status(&self, chain: &CallChain) -> Result<ServerStatus, ActorError> {
        self.0
            .call(chain, |turn| async move { Ok(turn.state().await.status) })
            .await
    }

    pub async fn info(&self, chain: &CallChain) -> Result<Option<DedicatedServerInfo>, ActorError> {
        self.0
            .call(chain, |turn| async move { Ok(turn.state().await.info.clone()) })
            .await
    }

    pub async fn acquired_by(&self, chain: &CallChain) -> Result<SessionId, ActorError> {
        self.0
            .call(chain, |turn| async move { Ok(turn.state().await.acquired_by) })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::spawn_actor;
    use crate::server_pool::InMemoryServerPool;
    use crate::sink::{ChannelSink, SinkRegistry};
    use shared::CommandArgs;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingSessions {
        closed: Mutex<Vec<SessionId>>,
    }

    #[async_trait]
    impl SessionControl for RecordingSessions {
        async fn close_session(&self, _chain: &CallChain, session_id: SessionId) -> Result<(), ActorError> {
            self.closed.lock().unwrap().push(session_id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        seen: Mutex<Vec<ServerStatus>>,
    }

    impl ServerObserver for RecordingObserver {
        fn on_state_changed(&self, _server_id: ServerId, status: ServerStatus) {
            self.seen.lock().unwrap().push(status);
        }
    }

    struct Fixture {
        server: DedicatedServerRef,
        pool: Arc<InMemoryServerPool>,
        sessions: Arc<RecordingSessions>,
        commands: mpsc::UnboundedReceiver<ServerCommand>,
    }

    fn fixture(server_id: ServerId) -> Fixture {
        let pool = Arc::new(InMemoryServerPool::new());
        let sessions = Arc::new(RecordingSessions::default());
        let sinks = Arc::new(SinkRegistry::new());
        let (sink, commands) = ChannelSink::new();
        sinks.insert(server_id, Arc::new(sink));

        let deps = ServerDeps {
            pool: pool.clone(),
            sinks,
            sessions: sessions.clone(),
        };
        let server = spawn_actor(server_id, DedicatedServer::new(server_id, deps)).into();
        Fixture {
            server,
            pool,
            sessions,
            commands,
        }
    }

    fn info(port: u16) -> DedicatedServerInfo {
        DedicatedServerInfo {
            ip: "10.0.0.5".to_string(),
            port,
            name: "ds-alpha".to_string(),
        }
    }

    #[tokio::test]
    async fn test_enroll_rejects_port_zero() {
        let f = fixture(1);
        let root = CallChain::root();

        let result = f.server.enroll(&root, info(0)).await;
        assert!(matches!(result, Err(ActorError::OutOfRange(_))));
        assert_eq!(f.server.status(&root).await.unwrap(), ServerStatus::Invalid);
        assert!(f.pool.candidates().await.is_empty());
    }

    #[tokio::test]
    async fn test_enroll_registers_with_pool() {
        let f = fixture(2);
        let root = CallChain::root();

        f.server.enroll(&root, info(7777)).await.unwrap();
        assert_eq!(f.server.status(&root).await.unwrap(), ServerStatus::Enlisted);
        assert_eq!(f.pool.candidates().await, vec![2]);
        assert_eq!(f.server.info(&root).await.unwrap(), Some(info(7777)));

        let again = f.server.enroll(&root, info(7777)).await;
        assert!(matches!(again, Err(ActorError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_acquire_sends_command_and_rejects_second_owner() {
        let mut f = fixture(3);
        let root = CallChain::root();
        f.server.enroll(&root, info(7777)).await.unwrap();

        f.server.on_acquired(&root, 42).await.unwrap();
        let second = f.server.on_acquired(&root, 43).await;
        assert!(matches!(second, Err(ActorError::InvalidOperation(_))));
        assert_eq!(f.server.acquired_by(&root).await.unwrap(), 42);

        let command = f.commands.recv().await.unwrap();
        assert_eq!(command.args, CommandArgs::SessionId(42));
    }

    #[tokio::test]
    async fn test_release_from_non_owner_is_ignored() {
        let f = fixture(4);
        let root = CallChain::root();
        f.server.enroll(&root, info(7777)).await.unwrap();
        f.server.on_acquired(&root, 42).await.unwrap();

        f.server.on_released(&root, 99).await.unwrap();
        assert_eq!(f.server.acquired_by(&root).await.unwrap(), 42);
        assert_eq!(f.server.status(&root).await.unwrap(), ServerStatus::Acquired);

        f.server.on_released(&root, 42).await.unwrap();
        assert_eq!(f.server.acquired_by(&root).await.unwrap(), 0);
        assert_eq!(f.server.status(&root).await.unwrap(), ServerStatus::Enlisted);
    }

    #[tokio::test]
    async fn test_withdraw_closes_owner_once() {
        let f = fixture(5);
        let root = CallChain::root();
        f.server.enroll(&root, info(7777)).await.unwrap();
        f.server.on_acquired(&root, 42).await.unwrap();

        f.server.withdraw(&root).await.unwrap();
        f.server.withdraw(&root).await.unwrap();

        assert_eq!(*f.sessions.closed.lock().unwrap(), vec![42]);
        assert_eq!(f.server.status(&root).await.unwrap(), ServerStatus::Withdrawn);
        assert!(f.pool.candidates().await.is_empty());
    }

    #[tokio::test]
    async fn test_observers_see_every_transition() {
        let f = fixture(6);
        let root = CallChain::root();
        let observer = Arc::new(RecordingObserver::default());
        let id = f.server.subscribe(&root, observer.clone()).await.unwrap();

        f.server.enroll(&root, info(7777)).await.unwrap();
        f.server.on_acquired(&root, 8).await.unwrap();
        f.server.on_released(&root, 8).await.unwrap();
        assert!(f.server.unsubscribe(&root, id).await.unwrap());
        f.server.withdraw(&root).await.unwrap();

        assert_eq!(
            *observer.seen.lock().unwrap(),
            vec![ServerStatus::Enlisted, ServerStatus::Acquired, ServerStatus::Enlisted]
        );
    }

    #[tokio::test]
    async fn test_meta_messages_forward_through_sink() {
        let mut f = fixture(7);
        let root = CallChain::root();
        f.server.enroll(&root, info(7777)).await.unwrap();

        f.server.send_meta_msg(&root, "warmup".to_string()).await.unwrap();
        f.server
            .load_level(&root, "harbor".to_string(), "ctf".to_string(), Some(vec![1]))
            .await
            .unwrap();

        assert_eq!(f.commands.recv().await.unwrap(), ServerCommand::meta_msg("warmup"));
        assert_eq!(
            f.commands.recv().await.unwrap(),
            ServerCommand::load_level("harbor", "ctf", Some(vec![1]))
        );
    }
}
