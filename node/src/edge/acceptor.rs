//! Player connection acceptor

use super::congestion::CongestionPolicy;
use super::tls::{Certificate, TlsSettings};
use crate::trap::{spawn_observed, ObservedTask};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;

pub struct AcceptorSettings {
    pub bind: SocketAddr,
    pub backlog: u32,
    /// Concurrent connections; further connections are closed on accept
    pub capacity: usize,
    pub tls: TlsSettings,
    pub certificate: Option<Certificate>,
    /// Bytes per second a single connection may use, 0 for unlimited
    pub channel_bandwidth: u32,
    pub congestion: Option<Arc<dyn CongestionPolicy>>,
}

/// An accepted player connection with the resources configured for it
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub channel_bandwidth: u32,
    pub congestion: Option<Arc<dyn CongestionPolicy>>,
}

#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn handle(&self, connection: Connection);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptorStats {
    pub active: usize,
    pub accepted: u64,
    pub rejected: u64,
}

#[async_trait]
pub trait ConnectionAcceptor: Send + Sync {
    /// Binds and starts accepting; returns the bound address
    async fn start(&self, settings: AcceptorSettings, handler: Arc<dyn ConnectionHandler>) -> io::Result<SocketAddr>;
    async fn stop(&self);
    fn stats(&self) -> AcceptorStats;
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// Plaintext TCP acceptor
///
/// TLS termination is not implemented here; starting with TLS enabled fails
/// instead of silently serving plaintext.
#[derive(Default)]
pub struct TcpConnectionAcceptor {
    counters: Arc<Counters>,
    task: Mutex<Option<ObservedTask>>,
}

impl TcpConnectionAcceptor {
    pub fn new() -> Self {
        Self::default()
    }
}

fn listen(bind: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if bind.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(bind)?;
    socket.listen(backlog.max(1))
}

async fn accept_loop(
    listener: TcpListener,
    settings: AcceptorSettings,
    handler: Arc<dyn ConnectionHandler>,
    counters: Arc<Counters>,
) -> io::Result<()> {
    let slots = Arc::new(Semaphore::new(settings.capacity));
    loop {
        let (stream, peer) = listener.accept().await?;
        let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("At capacity, refusing connection from {}", peer);
            continue;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", peer, e);
        }
        counters.accepted.fetch_add(1, Ordering::Relaxed);
        counters.active.fetch_add(1, Ordering::Relaxed);

        let connection = Connection {
            stream,
            peer,
            channel_bandwidth: settings.channel_bandwidth,
            congestion: settings.congestion.clone(),
        };
        let handler = Arc::clone(&handler);
        let counters = Arc::clone(&counters);
        tokio::spawn(async move {
            handler.handle(connection).await;
            counters.active.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }
}

#[async_trait]
impl ConnectionAcceptor for TcpConnectionAcceptor {
    async fn start(&self, settings: AcceptorSettings, handler: Arc<dyn ConnectionHandler>) -> io::Result<SocketAddr> {
        if settings.tls.is_enabled() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!(
                    "TLS ({:?}) requested but this acceptor only serves plaintext",
                    settings.tls.protocol
                ),
            ));
        }

        let listener = listen(settings.bind, settings.backlog)?;
        let local_addr = listener.local_addr()?;
        info!(
            "Accepting players on {} (capacity {}, backlog {})",
            local_addr, settings.capacity, settings.backlog
        );

        let accept = spawn_observed(
            "edge-acceptor",
            accept_loop(listener, settings, handler, Arc::clone(&self.counters)),
        );

        if let Ok(mut task) = self.task.lock() {
            if let Some(previous) = task.replace(accept) {
                previous.abort();
            }
        }
        Ok(local_addr)
    }

    async fn stop(&self) {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.abort();
            task.join().await;
            info!("Player acceptor stopped");
        }
    }

    fn stats(&self) -> AcceptorStats {
        AcceptorStats {
            active: self.counters.active.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}
