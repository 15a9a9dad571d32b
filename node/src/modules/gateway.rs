//! TCP gateway for physical dedicated servers
//!
//! A dedicated server connects, sends `Enroll`, and from then on receives
//! every [`ServerCommand`] its actor pushes through the message sink. Losing
//! the connection withdraws the server.

use crate::actor::CallChain;
use crate::cluster::BackendRuntime;
use crate::drain::{ConnectionGuard, Drain};
use crate::error::NodeError;
use crate::sink::{ChannelSink, MessageSink};
use crate::trap::{spawn_observed, ObservedTask};
use log::{debug, info, warn};
use shared::{read_frame, write_frame, DedicatedServerPacket, FrameError, ServerCommand};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// How long `shutdown` waits for connected servers to be withdrawn
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DedicatedServerGateway {
    local_addr: SocketAddr,
    accept: ObservedTask,
    drain: Arc<Drain>,
}

impl DedicatedServerGateway {
    pub async fn bind(addr: SocketAddr, runtime: Arc<BackendRuntime>) -> Result<Self, NodeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NodeError::Bind { endpoint: addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("Dedicated server gateway listening on {}", local_addr);

        let drain = Arc::new(Drain::new());
        let accept = spawn_observed("ds-gateway", accept_loop(listener, runtime, Arc::clone(&drain)));
        Ok(Self {
            local_addr,
            accept,
            drain,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and disconnects every dedicated server, which
    /// withdraws it
    pub fn stop(&self) {
        self.accept.abort();
        self.drain.trigger();
    }

    /// `stop`, then waits until the connected servers are withdrawn
    pub async fn shutdown(&self) {
        self.stop();
        if !self.drain.drained(DRAIN_TIMEOUT).await {
            warn!("Dedicated servers still connected after {:?}", DRAIN_TIMEOUT);
        }
    }
}

async fn accept_loop(listener: TcpListener, runtime: Arc<BackendRuntime>, drain: Arc<Drain>) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let Some(guard) = drain.guard() else {
            return Ok(());
        };
        debug!("Dedicated server connected from {}", peer);
        spawn_observed(
            format!("ds-conn-{}", peer),
            serve_server(stream, peer, Arc::clone(&runtime), guard),
        );
    }
}

async fn serve_server(
    stream: TcpStream,
    peer: SocketAddr,
    runtime: Arc<BackendRuntime>,
    mut guard: ConnectionGuard,
) -> Result<(), FrameError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let first = tokio::select! {
        first = read_frame::<_, DedicatedServerPacket>(&mut reader) => first?,
        _ = guard.stopped() => return Ok(()),
    };
    let info = match first {
        Some(DedicatedServerPacket::Enroll { info }) => info,
        Some(other) => {
            warn!("Dedicated server {} sent {:?} before enrolling", peer, other);
            let reply = DedicatedServerPacket::Rejected {
                reason: "expected Enroll".to_string(),
            };
            return write_frame(&mut writer, &reply).await;
        }
        None => return Ok(()),
    };

    let chain = CallChain::root();
    let server_id = runtime.allocate_server_id();
    let (sink, commands) = ChannelSink::new();
    runtime.sinks().insert(server_id, Arc::new(sink) as Arc<dyn MessageSink>);

    let server = runtime.server(server_id).await;
    if let Err(e) = server.enroll(&chain, info).await {
        runtime.sinks().remove(server_id);
        warn!("Enrollment from {} refused: {}", peer, e);
        let reply = DedicatedServerPacket::Rejected { reason: e.to_string() };
        return write_frame(&mut writer, &reply).await;
    }
    write_frame(&mut writer, &DedicatedServerPacket::Enrolled { server_id }).await?;
    info!("Dedicated server {} enrolled from {}", server_id, peer);

    let forward = tokio::spawn(forward_commands(commands, writer, peer));

    let outcome = loop {
        let packet = tokio::select! {
            packet = read_frame::<_, DedicatedServerPacket>(&mut reader) => packet,
            _ = guard.stopped() => {
                info!("Gateway stopping, withdrawing dedicated server {}", server_id);
                break Ok(());
            }
        };
        match packet {
            Ok(Some(packet)) => debug!("Ignoring {:?} from dedicated server {}", packet, server_id),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    forward.abort();
    if let Err(e) = server.withdraw(&chain).await {
        warn!("Withdrawing dedicated server {} failed: {}", server_id, e);
    }
    runtime.sinks().remove(server_id);
    info!("Dedicated server {} at {} disconnected", server_id, peer);
    outcome
}

async fn forward_commands(
    mut commands: mpsc::UnboundedReceiver<ServerCommand>,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    peer: SocketAddr,
) {
    while let Some(command) = commands.recv().await {
        if let Err(e) = write_frame(&mut writer, &DedicatedServerPacket::Command(command)).await {
            warn!("Failed to deliver command to dedicated server {}: {}", peer, e);
            break;
        }
    }
}
