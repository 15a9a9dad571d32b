//! Pool of enlisted dedicated servers and allocation out of it

use crate::actor::{ActorDirectory, CallChain};
use crate::dedicated_server::{DedicatedServer, DedicatedServerRef};
use crate::error::ActorError;
use async_trait::async_trait;
use log::{debug, info};
use shared::{ServerId, SessionId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registry of dedicated servers available for allocation
#[async_trait]
pub trait ServerPool: Send + Sync {
    async fn register(&self, server_id: ServerId);
    async fn deregister(&self, server_id: ServerId);
    /// Registered servers, lowest id first
    async fn candidates(&self) -> Vec<ServerId>;
}

#[derive(Default)]
pub struct InMemoryServerPool {
    servers: RwLock<BTreeSet<ServerId>>,
}

impl InMemoryServerPool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServerPool for InMemoryServerPool {
    async fn register(&self, server_id: ServerId) {
        if self.servers.write().await.insert(server_id) {
            info!("Dedicated server {} joined the pool", server_id);
        }
    }

    async fn deregister(&self, server_id: ServerId) {
        if self.servers.write().await.remove(&server_id) {
            info!("Dedicated server {} left the pool", server_id);
        }
    }

    async fn candidates(&self) -> Vec<ServerId> {
        self.servers.read().await.iter().copied().collect()
    }
}

/// Binds sessions to enlisted dedicated servers
///
/// Candidates are tried in pool order. A candidate that is already acquired
/// or no longer enlisted rejects `OnAcquired`, and the next one is tried.
pub struct ServerAllocator {
    pool: Arc<dyn ServerPool>,
    servers: Arc<ActorDirectory<DedicatedServer>>,
}

impl ServerAllocator {
    pub fn new(pool: Arc<dyn ServerPool>, servers: Arc<ActorDirectory<DedicatedServer>>) -> Self {
        Self { pool, servers }
    }

    pub async fn acquire(&self, chain: &CallChain, session_id: SessionId) -> Result<ServerId, ActorError> {
        for server_id in self.pool.candidates().await {
            let Some(actor) = self.servers.lookup(server_id).await else {
                continue;
            };

            match DedicatedServerRef::from(actor).on_acquired(chain, session_id).await {
                Ok(()) => {
                    info!("Session {} acquired dedicated server {}", session_id, server_id);
                    return Ok(server_id);
                }
                Err(ActorError::InvalidOperation(reason)) => {
                    debug!("Skipping dedicated server {}: {}", server_id, reason);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ActorError::invalid_operation(format!(
            "no dedicated server available for session {}",
            session_id
        )))
    }
}
