//! Error types for node processes
//!
//! - **ActorError**: typed failures returned by actor calls; these travel
//!   back to callers (and across the backend wire) instead of tearing the
//!   actor down
//! - **ClusterError**: cluster runtime and coordinator failures, split into
//!   transient races and everything else
//! - **NodeError**: bootstrap-level failures of a node process

use serde::{Deserialize, Serialize};
use shared::FrameError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("argument out of range: {0}")]
    OutOfRange(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A call from an actor's own call chain reached it while it is not reentrant
    #[error("reentrant call into non-reentrant actor {0}")]
    Reentrancy(String),

    #[error("call to {0} timed out")]
    Timeout(String),

    #[error("actor {0} is no longer active")]
    Stopped(String),
}

impl ActorError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self::OutOfRange(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    /// The coordinator has no node at this path yet. Expected while roles
    /// start before their coordinator has finished writing.
    #[error("coordination node not found: {0}")]
    NodeNotFound(String),

    /// The backend runtime could not be reached or dropped the connection
    #[error("backend runtime unavailable: {0}")]
    Runtime(String),

    #[error("cluster protocol error: {0}")]
    Protocol(String),

    #[error("not connected to the backend runtime")]
    NotConnected,

    #[error(transparent)]
    Actor(#[from] ActorError),

    #[error("coordinator storage error: {0}")]
    Storage(#[from] io::Error),
}

impl ClusterError {
    /// Races that resolve on their own once the cluster finishes starting
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::NodeNotFound(_) | ClusterError::Runtime(_))
    }
}

impl From<FrameError> for ClusterError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => ClusterError::Runtime(e.to_string()),
            other => ClusterError::Protocol(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Module initialisation failed and the failure was already logged
    #[error("module initialisation failed for role {0}")]
    ModuleInit(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Actor(#[from] ActorError),

    #[error("control channel error: {0}")]
    Control(#[from] FrameError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl NodeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    pub fn is_already_logged(&self) -> bool {
        matches!(self, NodeError::ModuleInit(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Cluster(e) if e.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClusterError::NodeNotFound("config/cluster".into()).is_transient());
        assert!(ClusterError::Runtime("refused".into()).is_transient());
        assert!(!ClusterError::Protocol("bad frame".into()).is_transient());
        assert!(!ClusterError::NotConnected.is_transient());

        let wrapped = NodeError::from(ClusterError::NodeNotFound("x".into()));
        assert!(wrapped.is_transient());
        assert!(!NodeError::config("missing").is_transient());
    }

    #[test]
    fn test_frame_io_errors_are_runtime_errors() {
        let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err = ClusterError::from(FrameError::Io(io));
        assert!(matches!(err, ClusterError::Runtime(_)));

        let err = ClusterError::from(FrameError::TooLarge(u32::MAX));
        assert!(matches!(err, ClusterError::Protocol(_)));
    }

    #[test]
    fn test_actor_error_helpers() {
        let err = ActorError::invalid_argument("session id 0 is reserved");
        assert!(matches!(&err, ActorError::InvalidArgument(m) if m == "session id 0 is reserved"));
        assert!(matches!(ActorError::invalid_operation("busy"), ActorError::InvalidOperation(_)));
        assert!(matches!(ActorError::out_of_range("slot"), ActorError::OutOfRange(_)));
    }

    #[test]
    fn test_only_module_init_is_already_logged() {
        assert!(NodeError::ModuleInit("FrontEnd".into()).is_already_logged());
        assert!(!NodeError::certificate("unreadable").is_already_logged());
    }
}
