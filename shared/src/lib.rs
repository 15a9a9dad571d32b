//! Types shared by the launcher and node processes
//!
//! - [`role`]: the closed set of service roles and their launch ordering
//! - [`protocol`]: control-channel signals, dedicated-server commands and
//!   edge client packets
//! - [`framing`]: length-prefixed bincode frames over async streams

pub mod framing;
pub mod protocol;
pub mod role;

pub use framing::{read_frame, write_frame, FrameError, MAX_FRAME_LEN};
pub use protocol::{
    ClientPacket, CommandArgs, CommandKind, DedicatedServerInfo, DedicatedServerPacket,
    NodeSignal, PlayerContext, PlayerIndex, PlayerMutableState, ProfileId, Reservation,
    ServerCommand, ServerId, ServerPacket, SessionId, SupervisorCommand, INVALID_PLAYER_INDEX,
};
pub use role::{dependency_closure, resolve_launch_order, Role, RoleError, RoleSet};

/// Command-line flag names a node process accepts. The launcher builds its
/// child command lines from these so the two binaries cannot drift apart.
pub mod node_args {
    pub const NODE_NAME: &str = "--node-name";
    pub const ROLE: &str = "--role";
    pub const CONFIG: &str = "--config";
    pub const OVERRIDES: &str = "--overrides";
    pub const SIGNAL: &str = "--signal";
}
