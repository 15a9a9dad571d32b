use shared::{FrameError, Role, RoleError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to spawn the {role} node: {source}")]
    Spawn {
        role: Role,
        #[source]
        source: io::Error,
    },

    /// The node reported a failure it already logged itself
    #[error("the {0} node failed to start")]
    AlreadyLogged(Role),

    #[error("the {role} node failed: {reason}")]
    NodeFailed { role: Role, reason: String },

    #[error("control channel error: {0}")]
    Control(#[from] FrameError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl LaunchError {
    pub fn is_already_logged(&self) -> bool {
        matches!(self, LaunchError::AlreadyLogged(_))
    }
}

impl From<RoleError> for LaunchError {
    fn from(e: RoleError) -> Self {
        LaunchError::InvalidArgument(e.to_string())
    }
}
