//! Message types exchanged between launcher, node processes, edge clients
//! and dedicated servers
//!
//! Everything here travels through [`crate::framing`] as bincode frames.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type SessionId = u64;
pub type ServerId = u64;
pub type ProfileId = u64;
pub type PlayerIndex = u32;

/// Returned by `AddPlayer` when no index could be assigned
pub const INVALID_PLAYER_INDEX: PlayerIndex = u32::MAX;

/// Sent by the launcher down a node process's control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorCommand {
    Finalize { signal: String, graceful: bool },
}

impl SupervisorCommand {
    pub fn signal_name(&self) -> &str {
        match self {
            SupervisorCommand::Finalize { signal, .. } => signal,
        }
    }
}

/// Raised by a node process on its control channel
///
/// `Ready` and `Failed` both release a launcher waiting on readiness;
/// `Finalized` acknowledges a finalize request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeSignal {
    Ready {
        signal: String,
    },
    Failed {
        signal: String,
        reason: String,
        /// The node already logged the failure; the launcher should not repeat it
        already_logged: bool,
    },
    Finalized {
        signal: String,
    },
}

impl NodeSignal {
    pub fn signal_name(&self) -> &str {
        match self {
            NodeSignal::Ready { signal }
            | NodeSignal::Failed { signal, .. }
            | NodeSignal::Finalized { signal } => signal,
        }
    }
}

/// Identity of a physical dedicated server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedicatedServerInfo {
    pub ip: String,
    pub port: u16,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    OnAcquired,
    MetaMsg,
    LoadLevel,
}

/// Type-tagged payload of a [`ServerCommand`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandArgs {
    SessionId(SessionId),
    Text(String),
    Level {
        map: String,
        rules: String,
        custom: Option<Vec<u8>>,
    },
}

/// Command envelope delivered to a dedicated server through its message sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCommand {
    pub command: CommandKind,
    pub args: CommandArgs,
}

impl ServerCommand {
    pub fn on_acquired(session_id: SessionId) -> Self {
        Self {
            command: CommandKind::OnAcquired,
            args: CommandArgs::SessionId(session_id),
        }
    }

    pub fn meta_msg(msg: impl Into<String>) -> Self {
        Self {
            command: CommandKind::MetaMsg,
            args: CommandArgs::Text(msg.into()),
        }
    }

    pub fn load_level(map: impl Into<String>, rules: impl Into<String>, custom: Option<Vec<u8>>) -> Self {
        Self {
            command: CommandKind::LoadLevel,
            args: CommandArgs::Level {
                map: map.into(),
                rules: rules.into(),
                custom,
            },
        }
    }
}

/// Packets a dedicated server sends to the backend gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedicatedServerPacket {
    Enroll { info: DedicatedServerInfo },
    Enrolled { server_id: ServerId },
    Rejected { reason: String },
    Command(ServerCommand),
}

/// A reserved player slot carried into a session merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub profile_id: ProfileId,
    pub squad_id: ProfileId,
    pub mission_suite_guid: Uuid,
    pub slot_group_index: u32,
}

impl Reservation {
    /// 0 for the squad leader, 1 for members
    pub fn slot_index(&self) -> u32 {
        if self.profile_id == self.squad_id {
            0
        } else {
            1
        }
    }
}

/// Who a player is, as presented when joining
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerContext {
    pub profile_id: ProfileId,
    pub display_name: String,
}

/// Lobby-side state a player may change at will
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerMutableState {
    pub profile_id: ProfileId,
    pub ready: bool,
    pub team: u8,
}

/// Packets a player client sends to the edge service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientPacket {
    Join {
        context: PlayerContext,
        session_id: SessionId,
        token: String,
    },
    SetState {
        ready: bool,
        team: u8,
    },
    Leave,
}

/// Packets the edge service sends back to a player client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerPacket {
    Joined {
        index: PlayerIndex,
        connection_sequence: u64,
    },
    Rejected {
        reason: String,
    },
    Closed {
        reason: String,
    },
}
