//! Message sinks toward connected dedicated servers
//!
//! A sink is the outbound half of a dedicated server's connection. The
//! gateway registers one per connected server; actors resolve it by server
//! id when they need to push a [`ServerCommand`].

use shared::{ServerCommand, ServerId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("dedicated server connection is gone")]
    Disconnected,
}

pub trait MessageSink: Send + Sync {
    fn send(&self, command: ServerCommand) -> Result<(), SinkError>;
}

pub trait SinkResolver: Send + Sync {
    /// The sink currently attached for `server_id`, if any
    fn resolve(&self, server_id: ServerId) -> Option<Arc<dyn MessageSink>>;
}

/// Identity comparison on the sink object itself, ignoring vtables
pub fn same_sink(a: &Arc<dyn MessageSink>, b: &Arc<dyn MessageSink>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const u8,
        Arc::as_ptr(b) as *const u8,
    )
}

/// Sink feeding an unbounded channel drained by the connection's writer task
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ServerCommand>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageSink for ChannelSink {
    fn send(&self, command: ServerCommand) -> Result<(), SinkError> {
        self.tx.send(command).map_err(|_| SinkError::Disconnected)
    }
}

#[derive(Default)]
pub struct SinkRegistry {
    sinks: RwLock<HashMap<ServerId, Arc<dyn MessageSink>>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, server_id: ServerId, sink: Arc<dyn MessageSink>) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.insert(server_id, sink);
        }
    }

    pub fn remove(&self, server_id: ServerId) -> Option<Arc<dyn MessageSink>> {
        self.sinks.write().ok()?.remove(&server_id)
    }
}

impl SinkResolver for SinkRegistry {
    fn resolve(&self, server_id: ServerId) -> Option<Arc<dyn MessageSink>> {
        self.sinks.read().ok()?.get(&server_id).cloned()
    }
}
