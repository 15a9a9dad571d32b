//! Backend actor runtime
//!
//! Hosts the session and dedicated-server directories, the server pool and
//! the sink registry, and turns [`BackendRequest`]s into actor calls.

use super::protocol::{BackendRequest, BackendResponse};
use crate::actor::{ActorDirectory, CallChain};
use crate::dedicated_server::{DedicatedServer, DedicatedServerRef, ServerDeps, SessionControl};
use crate::error::ActorError;
use crate::game_session::{GameSession, GameSessionRef, ServerControl};
use crate::server_pool::{InMemoryServerPool, ServerAllocator, ServerPool};
use crate::sink::SinkRegistry;
use crate::trap::{spawn_observed, ObservedTask};
use async_trait::async_trait;
use log::{debug, info};
use shared::{ServerId, SessionId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub session_capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            session_capacity: 16,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

pub struct BackendRuntime {
    settings: RuntimeSettings,
    sessions: Arc<ActorDirectory<GameSession>>,
    servers: Arc<ActorDirectory<DedicatedServer>>,
    pool: Arc<InMemoryServerPool>,
    sinks: Arc<SinkRegistry>,
    allocator: ServerAllocator,
    next_server_id: AtomicU64,
}

/// Lets actors reach each other through the runtime without owning it
struct RuntimeLinks(Weak<BackendRuntime>);

impl RuntimeLinks {
    fn runtime(&self) -> Result<Arc<BackendRuntime>, ActorError> {
        self.0
            .upgrade()
            .ok_or_else(|| ActorError::Stopped("backend runtime".to_string()))
    }
}

#[async_trait]
impl SessionControl for RuntimeLinks {
    async fn close_session(&self, chain: &CallChain, session_id: SessionId) -> Result<(), ActorError> {
        match self.runtime()?.sessions.lookup(session_id).await {
            Some(session) => GameSessionRef::from(session).close_internal(chain).await,
            None => {
                debug!("Session {} is not active, nothing to close", session_id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ServerControl for RuntimeLinks {
    async fn acquire_server(&self, chain: &CallChain, session_id: SessionId) -> Result<ServerId, ActorError> {
        self.runtime()?.allocator.acquire(chain, session_id).await
    }

    async fn release_server(
        &self,
        chain: &CallChain,
        server_id: ServerId,
        session_id: SessionId,
    ) -> Result<(), ActorError> {
        match self.runtime()?.servers.lookup(server_id).await {
            Some(server) => DedicatedServerRef::from(server).on_released(chain, session_id).await,
            None => {
                debug!("Dedicated server {} is not active, nothing to release", server_id);
                Ok(())
            }
        }
    }
}

impl BackendRuntime {
    pub fn new(settings: RuntimeSettings) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let links = Arc::new(RuntimeLinks(weak.clone()));
            let pool = Arc::new(InMemoryServerPool::new());
            let sinks = Arc::new(SinkRegistry::new());

            let deps = ServerDeps {
                pool: pool.clone(),
                sinks: sinks.clone(),
                sessions: links.clone(),
            };
            let servers = Arc::new(ActorDirectory::new(move |server_id| {
                DedicatedServer::new(server_id, deps.clone())
            }));

            let capacity = settings.session_capacity;
            let control: Arc<dyn ServerControl> = links;
            let sessions = Arc::new(ActorDirectory::new(move |session_id| {
                GameSession::new(session_id, capacity, Arc::clone(&control))
            }));

            let allocator = ServerAllocator::new(pool.clone() as Arc<dyn ServerPool>, servers.clone());

            Self {
                settings,
                sessions,
                servers,
                pool,
                sinks,
                allocator,
                next_server_id: AtomicU64::new(1),
            }
        })
    }

    pub async fn session(&self, session_id: SessionId) -> Result<GameSessionRef, ActorError> {
        if session_id == 0 {
            return Err(ActorError::invalid_argument("session id 0 is reserved"));
        }
        Ok(self.sessions.get(session_id).await.into())
    }

    pub async fn server(&self, server_id: ServerId) -> DedicatedServerRef {
        self.servers.get(server_id).await.into()
    }

    pub fn allocate_server_id(&self) -> ServerId {
        self.next_server_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn sinks(&self) -> &Arc<SinkRegistry> {
        &self.sinks
    }

    pub async fn pooled_servers(&self) -> Vec<ServerId> {
        self.pool.candidates().await
    }

    pub async fn dispatch(&self, chain: &CallChain, request: BackendRequest) -> BackendResponse {
        match self.try_dispatch(chain, request).await {
            Ok(response) => response,
            Err(e) => BackendResponse::Failed(e),
        }
    }

    async fn try_dispatch(&self, chain: &CallChain, request: BackendRequest) -> Result<BackendResponse, ActorError> {
        let response = match request {
            BackendRequest::AddPlayer {
                session_id,
                context,
                state,
            } => {
                let outcome = self.session(session_id).await?.add_player(chain, context, state).await?;
                BackendResponse::Added {
                    index: outcome.index,
                    success: outcome.success,
                }
            }
            BackendRequest::RemovePlayer {
                session_id,
                profile_id,
            } => BackendResponse::Removed(
                self.session(session_id).await?.remove_player(chain, profile_id).await?,
            ),
            BackendRequest::SetPlayerMutableState { session_id, state } => {
                self.session(session_id).await?.set_player_mutable_state(chain, state)?;
                BackendResponse::Accepted
            }
            BackendRequest::GetPlayers { session_id } => {
                BackendResponse::Indices(self.session(session_id).await?.get_players(chain).await?)
            }
            BackendRequest::GetReservations { session_id } => {
                let snapshot = self.session(session_id).await?.get_reservations(chain).await?;
                BackendResponse::Reservations(snapshot.as_ref().clone())
            }
            BackendRequest::StartMerge {
                session_id,
                reservations,
            } => BackendResponse::Indices(
                self.session(session_id).await?.start_merge(chain, reservations).await?,
            ),
            BackendRequest::EndMerge { session_id } => {
                BackendResponse::Indices(self.session(session_id).await?.end_merge(chain).await?)
            }
            BackendRequest::CloseSession { session_id } => {
                self.session(session_id).await?.close_internal(chain).await?;
                BackendResponse::Accepted
            }
            BackendRequest::AcquireServer { session_id } => {
                BackendResponse::ServerAcquired(self.session(session_id).await?.acquire_server(chain).await?)
            }
            BackendRequest::ServerStatus { server_id } => match self.servers.lookup(server_id).await {
                Some(server) => {
                    BackendResponse::ServerStatus(DedicatedServerRef::from(server).status(chain).await?)
                }
                None => {
                    return Err(ActorError::invalid_argument(format!(
                        "dedicated server {} is not active",
                        server_id
                    )))
                }
            },
            BackendRequest::Ping => BackendResponse::Pong,
        };
        Ok(response)
    }

    /// Deactivates idle, unpinned actors of both kinds
    pub async fn collect_idle(&self) -> usize {
        let idle = self.settings.idle_timeout;
        let sessions = self.sessions.collect_idle(idle).await.len();
        let servers = self.servers.collect_idle(idle).await.len();
        if sessions + servers > 0 {
            info!(
                "Deactivated {} idle sessions and {} idle dedicated servers",
                sessions, servers
            );
        }
        sessions + servers
    }

    pub fn spawn_idle_collector(self: &Arc<Self>, every: Duration) -> ObservedTask {
        let runtime = Arc::downgrade(self);
        spawn_observed("idle-collector", async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let Some(runtime) = runtime.upgrade() else {
                    return Ok::<(), ActorError>(());
                };
                runtime.collect_idle().await;
            }
        })
    }
}
