//! Requests a front-end sends to the backend runtime

use crate::dedicated_server::ServerStatus;
use crate::error::ActorError;
use serde::{Deserialize, Serialize};
use shared::{
    PlayerContext, PlayerIndex, PlayerMutableState, ProfileId, Reservation, ServerId, SessionId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendRequest {
    AddPlayer {
        session_id: SessionId,
        context: PlayerContext,
        state: Option<PlayerMutableState>,
    },
    RemovePlayer {
        session_id: SessionId,
        profile_id: ProfileId,
    },
    SetPlayerMutableState {
        session_id: SessionId,
        state: PlayerMutableState,
    },
    GetPlayers {
        session_id: SessionId,
    },
    GetReservations {
        session_id: SessionId,
    },
    StartMerge {
        session_id: SessionId,
        reservations: Vec<Reservation>,
    },
    EndMerge {
        session_id: SessionId,
    },
    CloseSession {
        session_id: SessionId,
    },
    AcquireServer {
        session_id: SessionId,
    },
    ServerStatus {
        server_id: ServerId,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendResponse {
    Added { index: PlayerIndex, success: bool },
    Removed(bool),
    Indices(Vec<PlayerIndex>),
    Reservations(Vec<Reservation>),
    ServerAcquired(ServerId),
    ServerStatus(ServerStatus),
    Accepted,
    Pong,
    Failed(ActorError),
}

/// A request tagged with a correlation id so replies can arrive out of order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: BackendRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendReply {
    pub id: u64,
    pub response: BackendResponse,
}
