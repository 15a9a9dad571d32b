//! Per-connection bridge between a player client and its session actor
//!
//! Each accepted connection gets a [`UserSession`] built from an immutable
//! [`UserSessionConfig`]. The first packet must be `Join`; after a successful
//! join, `SetState` updates flow to the session actor until `Leave` or
//! disconnect, at which point the player is removed.

use super::acceptor::{Connection, ConnectionHandler};
use super::congestion::{wait_for_admission, CongestionPolicy};
use super::providers::{AuthProviderManager, TelemetryProvider};
use crate::cluster::BackendInvoker;
use crate::error::ClusterError;
use async_trait::async_trait;
use log::{debug, info, warn};
use shared::{
    read_frame, write_frame, ClientPacket, PlayerContext, PlayerMutableState, ProfileId, ServerPacket, SessionId,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Monotonic connection sequence numbers scoped to one role
#[derive(Debug)]
pub struct SequenceGenerator {
    scope: String,
    next: AtomicU64,
}

impl SequenceGenerator {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            next: AtomicU64::new(1),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct UserSessionConfig {
    pub invoker: Arc<dyn BackendInvoker>,
    pub sequence: Arc<SequenceGenerator>,
    pub auth: Arc<AuthProviderManager>,
    pub telemetry: Arc<dyn TelemetryProvider>,
}

/// Hands every accepted connection a fresh [`UserSession`]
pub struct UserSessionFactory {
    config: UserSessionConfig,
}

impl UserSessionFactory {
    pub fn new(config: UserSessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionHandler for UserSessionFactory {
    async fn handle(&self, connection: Connection) {
        let peer = connection.peer;
        let session = UserSession::new(self.config.clone(), peer, connection.congestion);
        if let Err(e) = session.run(connection.stream).await {
            warn!("Player connection {} ended with error: {}", peer, e);
        }
    }
}

pub struct UserSession {
    config: UserSessionConfig,
    peer: SocketAddr,
    congestion: Option<Arc<dyn CongestionPolicy>>,
    connection_sequence: u64,
    joined: Option<(SessionId, ProfileId)>,
}

impl UserSession {
    pub fn new(config: UserSessionConfig, peer: SocketAddr, congestion: Option<Arc<dyn CongestionPolicy>>) -> Self {
        let connection_sequence = config.sequence.next();
        Self {
            config,
            peer,
            congestion,
            connection_sequence,
            joined: None,
        }
    }

    pub async fn run<S>(mut self, mut stream: S) -> Result<(), ClusterError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self.serve(&mut stream).await;

        if let Some((session_id, profile_id)) = self.joined.take() {
            match self.config.invoker.remove_player(session_id, profile_id).await {
                Ok(_) => self.config.telemetry.player_left(session_id, profile_id),
                Err(e) => warn!(
                    "Failed to remove player {} from session {}: {}",
                    profile_id, session_id, e
                ),
            }
        }
        result
    }

    async fn serve<S>(&mut self, stream: &mut S) -> Result<(), ClusterError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        while let Some(packet) = read_frame::<_, ClientPacket>(stream).await? {
            match packet {
                ClientPacket::Join {
                    context,
                    session_id,
                    token,
                } => {
                    let reply = self.join(context, session_id, &token).await;
                    self.send(stream, &reply).await?;
                }
                ClientPacket::SetState { ready, team } => {
                    let Some((session_id, profile_id)) = self.joined else {
                        debug!("Ignoring state update from {} before join", self.peer);
                        continue;
                    };
                    let state = PlayerMutableState {
                        profile_id,
                        ready,
                        team,
                    };
                    if let Err(e) = self.config.invoker.set_player_mutable_state(session_id, state).await {
                        warn!("State update for player {} failed: {}", profile_id, e);
                    }
                }
                ClientPacket::Leave => {
                    let reply = ServerPacket::Closed {
                        reason: "left".to_string(),
                    };
                    self.send(stream, &reply).await?;
                    return Ok(());
                }
            }
        }
        debug!("Player connection {} closed", self.peer);
        Ok(())
    }

    async fn join(&mut self, context: PlayerContext, session_id: SessionId, token: &str) -> ServerPacket {
        if self.joined.is_some() {
            return rejected("already joined");
        }
        if session_id == 0 {
            return rejected("invalid session");
        }
        if let Err(e) = self.config.auth.authenticate(&context, token).await {
            info!("Rejected player {} from {}: {}", context.profile_id, self.peer, e);
            return rejected(&e.to_string());
        }

        let profile_id = context.profile_id;
        let state = PlayerMutableState {
            profile_id,
            ..PlayerMutableState::default()
        };
        match self.config.invoker.add_player(session_id, context, Some(state)).await {
            Ok(outcome) if outcome.success => {
                self.joined = Some((session_id, profile_id));
                self.config.telemetry.player_joined(session_id, profile_id);
                ServerPacket::Joined {
                    index: outcome.index,
                    connection_sequence: self.connection_sequence,
                }
            }
            Ok(_) => rejected("session refused the player"),
            Err(e) => {
                warn!("Join of player {} to session {} failed: {}", profile_id, session_id, e);
                rejected(&e.to_string())
            }
        }
    }

    async fn send<S>(&self, stream: &mut S, packet: &ServerPacket) -> Result<(), ClusterError>
    where
        S: AsyncWrite + Unpin + Send,
    {
        if let Some(policy) = &self.congestion {
            let bytes = bincode::serialized_size(packet).unwrap_or(0) as usize;
            wait_for_admission(policy.as_ref(), bytes).await;
        }
        write_frame(stream, packet).await?;
        Ok(())
    }
}

fn rejected(reason: &str) -> ServerPacket {
    ServerPacket::Rejected {
        reason: reason.to_string(),
    }
}
