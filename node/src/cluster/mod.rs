//! Cluster runtime access
//!
//! The backend role hosts the actors inside a [`BackendRuntime`]. Other roles
//! reach it through a [`ClusterClient`], either in-process
//! ([`LocalCluster`]) or over framed TCP ([`RemoteCluster`]). Either way the
//! caller only ever sees a [`BackendInvoker`].

mod coordinator;
mod local;
mod protocol;
mod remote;
mod runtime;

pub use coordinator::{ClusterCoordinator, FileCoordinator, ServiceEntry, ServiceRegistry};
pub use local::LocalCluster;
pub use protocol::{BackendReply, BackendRequest, BackendResponse, RequestFrame};
pub use remote::{BackendHost, RemoteCluster};
pub use runtime::{BackendRuntime, RuntimeSettings};

use crate::dedicated_server::ServerStatus;
use crate::error::ClusterError;
use crate::game_session::AddPlayerOutcome;
use async_trait::async_trait;
use shared::{
    PlayerContext, PlayerIndex, PlayerMutableState, ProfileId, Reservation, ServerId, SessionId,
};
use std::sync::Arc;

/// Role name under which backend nodes register their endpoint
pub const BACKEND_SERVICE: &str = "Backend";

#[async_trait]
pub trait BackendInvoker: Send + Sync {
    async fn invoke(&self, request: BackendRequest) -> Result<BackendResponse, ClusterError>;
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fails with a transient error while no backend is reachable yet
    async fn connect(&self) -> Result<(), ClusterError>;
    async fn disconnect(&self);
    fn invoker(&self) -> Arc<dyn BackendInvoker>;
}

fn unexpected(response: BackendResponse) -> ClusterError {
    match response {
        BackendResponse::Failed(e) => ClusterError::Actor(e),
        other => ClusterError::Protocol(format!("unexpected backend response {:?}", other)),
    }
}

/// Typed wrappers over the request enum
impl dyn BackendInvoker {
    pub async fn add_player(
        &self,
        session_id: SessionId,
        context: PlayerContext,
        state: Option<PlayerMutableState>,
    ) -> Result<AddPlayerOutcome, ClusterError> {
        match self
            .invoke(BackendRequest::AddPlayer {
                session_id,
                context,
                state,
            })
            .await?
        {
            BackendResponse::Added { index, success } => Ok(AddPlayerOutcome { index, success }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn remove_player(&self, session_id: SessionId, profile_id: ProfileId) -> Result<bool, ClusterError> {
        match self
            .invoke(BackendRequest::RemovePlayer {
                session_id,
                profile_id,
            })
            .await?
        {
            BackendResponse::Removed(removed) => Ok(removed),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_player_mutable_state(
        &self,
        session_id: SessionId,
        state: PlayerMutableState,
    ) -> Result<(), ClusterError> {
        match self
            .invoke(BackendRequest::SetPlayerMutableState { session_id, state })
            .await?
        {
            BackendResponse::Accepted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_players(&self, session_id: SessionId) -> Result<Vec<PlayerIndex>, ClusterError> {
        match self.invoke(BackendRequest::GetPlayers { session_id }).await? {
            BackendResponse::Indices(indices) => Ok(indices),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_reservations(&self, session_id: SessionId) -> Result<Vec<Reservation>, ClusterError> {
        match self.invoke(BackendRequest::GetReservations { session_id }).await? {
            BackendResponse::Reservations(reservations) => Ok(reservations),
            other => Err(unexpected(other)),
        }
    }

    pub async fn start_merge(
        &self,
        session_id: SessionId,
        reservations: Vec<Reservation>,
    ) -> Result<Vec<PlayerIndex>, ClusterError> {
        match self
            .invoke(BackendRequest::StartMerge {
                session_id,
                reservations,
            })
            .await?
        {
            BackendResponse::Indices(indices) => Ok(indices),
            other => Err(unexpected(other)),
        }
    }

    pub async fn end_merge(&self, session_id: SessionId) -> Result<Vec<PlayerIndex>, ClusterError> {
        match self.invoke(BackendRequest::EndMerge { session_id }).await? {
            BackendResponse::Indices(indices) => Ok(indices),
            other => Err(unexpected(other)),
        }
    }

    pub async fn close_session(&self, session_id: SessionId) -> Result<(), ClusterError> {
        match self.invoke(BackendRequest::CloseSession { session_id }).await? {
            BackendResponse::Accepted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn acquire_server(&self, session_id: SessionId) -> Result<ServerId, ClusterError> {
        match self.invoke(BackendRequest::AcquireServer { session_id }).await? {
            BackendResponse::ServerAcquired(server_id) => Ok(server_id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn server_status(&self, server_id: ServerId) -> Result<ServerStatus, ClusterError> {
        match self.invoke(BackendRequest::ServerStatus { server_id }).await? {
            BackendResponse::ServerStatus(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&self) -> Result<(), ClusterError> {
        match self.invoke(BackendRequest::Ping).await? {
            BackendResponse::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
