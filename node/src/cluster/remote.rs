//! Backend runtime over TCP
//!
//! [`BackendHost`] serves a [`BackendRuntime`] on the backend node.
//! [`RemoteCluster`] is the front-end side: one connection per client,
//! requests tagged with correlation ids so slow actor calls do not hold up
//! unrelated ones.

use super::coordinator::ServiceRegistry;
use super::protocol::{BackendReply, BackendRequest, BackendResponse, RequestFrame};
use super::runtime::BackendRuntime;
use super::{BackendInvoker, ClusterClient, BACKEND_SERVICE};
use crate::actor::CallChain;
use crate::drain::{ConnectionGuard, Drain};
use crate::error::{ClusterError, NodeError};
use crate::trap::{spawn_observed, ObservedTask};
use async_trait::async_trait;
use log::{debug, info, warn};
use shared::{read_frame, write_frame, FrameError};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Upper bound on a remote call; above the actor call timeout so actor
/// timeouts come back as typed errors first
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(35);

/// How long `shutdown` waits for open front-end links to close
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BackendHost {
    local_addr: SocketAddr,
    accept: ObservedTask,
    drain: Arc<Drain>,
}

impl BackendHost {
    pub async fn bind(addr: SocketAddr, runtime: Arc<BackendRuntime>) -> Result<Self, NodeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NodeError::Bind { endpoint: addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("Backend runtime listening on {}", local_addr);

        let drain = Arc::new(Drain::new());
        let accept = spawn_observed("backend-host", accept_loop(listener, runtime, Arc::clone(&drain)));
        Ok(Self {
            local_addr,
            accept,
            drain,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and tells every open front-end link to close
    pub fn stop(&self) {
        self.accept.abort();
        self.drain.trigger();
    }

    /// `stop`, then waits for the links to close
    pub async fn shutdown(&self) {
        self.stop();
        if !self.drain.drained(DRAIN_TIMEOUT).await {
            warn!("Front-end links still open after {:?}", DRAIN_TIMEOUT);
        }
    }
}

async fn accept_loop(listener: TcpListener, runtime: Arc<BackendRuntime>, drain: Arc<Drain>) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let Some(guard) = drain.guard() else {
            return Ok(());
        };
        debug!("Front-end connected from {}", peer);
        spawn_observed(
            format!("backend-conn-{}", peer),
            serve_connection(stream, peer, Arc::clone(&runtime), guard),
        );
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    runtime: Arc<BackendRuntime>,
    mut guard: ConnectionGuard,
) -> Result<(), FrameError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<BackendReply>();

    let writer_task = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &reply).await {
                warn!("Failed to reply to front-end {}: {}", peer, e);
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = read_frame::<_, RequestFrame>(&mut reader) => frame,
            _ = guard.stopped() => {
                debug!("Closing link to front-end {}", peer);
                writer_task.abort();
                return Ok(());
            }
        };
        let Some(frame) = frame? else {
            break;
        };

        let runtime = Arc::clone(&runtime);
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            let response = runtime.dispatch(&CallChain::root(), frame.request).await;
            let _ = reply_tx.send(BackendReply {
                id: frame.id,
                response,
            });
        });
    }

    drop(reply_tx);
    let _ = writer_task.await;
    debug!("Front-end {} disconnected", peer);
    Ok(())
}

/// Waiters for replies; once `closed` no new waiter may be added
#[derive(Default)]
struct PendingCalls {
    waiters: HashMap<u64, oneshot::Sender<BackendResponse>>,
    closed: bool,
}

impl PendingCalls {
    fn close(&mut self) {
        self.closed = true;
        self.waiters.clear();
    }
}

type Pending = Arc<Mutex<PendingCalls>>;

struct Connection {
    requests: mpsc::UnboundedSender<RequestFrame>,
    pending: Pending,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn close(self) {
        for task in self.tasks {
            task.abort();
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.close();
        }
    }
}

struct Link {
    connection: Mutex<Option<Connection>>,
    next_id: AtomicU64,
    reply_timeout: Duration,
}

impl Link {
    fn new(reply_timeout: Duration) -> Self {
        Self {
            connection: Mutex::new(None),
            next_id: AtomicU64::new(0),
            reply_timeout,
        }
    }

    fn forget(&self, pending: &Pending, id: u64) {
        if let Ok(mut pending) = pending.lock() {
            pending.waiters.remove(&id);
        }
    }
}

#[async_trait]
impl BackendInvoker for Link {
    async fn invoke(&self, request: BackendRequest) -> Result<BackendResponse, ClusterError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = {
            let guard = self
                .connection
                .lock()
                .map_err(|_| ClusterError::NotConnected)?;
            let connection = guard.as_ref().ok_or(ClusterError::NotConnected)?;
            {
                let mut pending = connection
                    .pending
                    .lock()
                    .map_err(|_| ClusterError::Runtime("backend connection state poisoned".to_string()))?;
                if pending.closed {
                    return Err(ClusterError::Runtime("backend connection lost".to_string()));
                }
                pending.waiters.insert(id, reply_tx);
            }
            if connection.requests.send(RequestFrame { id, request }).is_err() {
                self.forget(&connection.pending, id);
                return Err(ClusterError::Runtime("backend connection closed".to_string()));
            }
            Arc::clone(&connection.pending)
        };

        match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClusterError::Runtime("backend connection lost".to_string())),
            Err(_) => {
                self.forget(&pending, id);
                Err(ClusterError::Runtime(format!(
                    "backend reply {} timed out after {:?}",
                    id, self.reply_timeout
                )))
            }
        }
    }
}

/// Cluster client talking to a backend node over TCP
///
/// Endpoints come from configuration; when none are configured the service
/// registry is asked for registered `Backend` services.
pub struct RemoteCluster {
    endpoints: Vec<String>,
    registry: Arc<dyn ServiceRegistry>,
    link: Arc<Link>,
}

impl RemoteCluster {
    pub fn new(endpoints: Vec<String>, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self::with_reply_timeout(endpoints, registry, REPLY_TIMEOUT)
    }

    pub fn with_reply_timeout(
        endpoints: Vec<String>,
        registry: Arc<dyn ServiceRegistry>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            endpoints,
            registry,
            link: Arc::new(Link::new(reply_timeout)),
        }
    }

    async fn candidate_endpoints(&self) -> Result<Vec<String>, ClusterError> {
        if !self.endpoints.is_empty() {
            return Ok(self.endpoints.clone());
        }

        let endpoints: Vec<String> = self
            .registry
            .services()
            .await?
            .into_iter()
            .filter(|s| s.role_name == BACKEND_SERVICE)
            .map(|s| s.endpoint())
            .collect();
        if endpoints.is_empty() {
            return Err(ClusterError::NodeNotFound(format!("services/{}", BACKEND_SERVICE)));
        }
        Ok(endpoints)
    }

    fn attach(&self, stream: TcpStream) -> Connection {
        let (mut reader, mut writer) = stream.into_split();
        let (requests, mut request_rx) = mpsc::unbounded_channel::<RequestFrame>();
        let pending: Pending = Arc::new(Mutex::new(PendingCalls::default()));

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = request_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!("Failed to send backend request: {}", e);
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame::<_, BackendReply>(&mut reader).await {
                    Ok(Some(reply)) => {
                        let waiter = reader_pending
                            .lock()
                            .ok()
                            .and_then(|mut p| p.waiters.remove(&reply.id));
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(reply.response);
                            }
                            None => debug!("Dropping reply {} with no waiter", reply.id),
                        }
                    }
                    Ok(None) => {
                        warn!("Backend runtime closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Backend connection failed: {}", e);
                        break;
                    }
                }
            }
            // Fail every outstanding call and refuse new ones until reconnected
            if let Ok(mut p) = reader_pending.lock() {
                p.close();
            }
        });

        Connection {
            requests,
            pending,
            tasks: vec![writer_task, reader_task],
        }
    }
}

#[async_trait]
impl ClusterClient for RemoteCluster {
    async fn connect(&self) -> Result<(), ClusterError> {
        let mut failures = Vec::new();
        for endpoint in self.candidate_endpoints().await? {
            match TcpStream::connect(&endpoint).await {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .map_err(|e| ClusterError::Runtime(e.to_string()))?;
                    let connection = self.attach(stream);
                    let previous = self
                        .link
                        .connection
                        .lock()
                        .map_err(|_| ClusterError::Runtime("connection state poisoned".to_string()))?
                        .replace(connection);
                    if let Some(previous) = previous {
                        previous.close();
                    }
                    info!("Connected to backend runtime at {}", endpoint);
                    return Ok(());
                }
                Err(e) => failures.push(format!("{}: {}", endpoint, e)),
            }
        }
        Err(ClusterError::Runtime(format!(
            "no backend endpoint reachable ({})",
            failures.join(", ")
        )))
    }

    async fn disconnect(&self) {
        let connection = self.link.connection.lock().ok().and_then(|mut c| c.take());
        if let Some(connection) = connection {
            connection.close();
            info!("Disconnected from backend runtime");
        }
    }

    fn invoker(&self) -> Arc<dyn BackendInvoker> {
        self.link.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{FileCoordinator, RuntimeSettings, ServiceEntry};
    use shared::PlayerContext;
    use uuid::Uuid;

    fn registry() -> Arc<FileCoordinator> {
        Arc::new(FileCoordinator::new(
            std::env::temp_dir().join(format!("remote-{}", Uuid::new_v4())),
        ))
    }

    async fn host() -> (BackendHost, Arc<BackendRuntime>) {
        let runtime = BackendRuntime::new(RuntimeSettings::default());
        let host = BackendHost::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&runtime))
            .await
            .unwrap();
        (host, runtime)
    }

    #[tokio::test]
    async fn test_missing_backend_registration_is_transient() {
        let cluster = RemoteCluster::new(Vec::new(), registry());
        let err = cluster.connect().await.unwrap_err();
        assert!(matches!(err, ClusterError::NodeNotFound(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cluster = RemoteCluster::new(vec![addr.to_string()], registry());
        assert!(cluster.connect().await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_calls_fail_once_backend_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dropper = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let cluster = RemoteCluster::new(vec![addr.to_string()], registry());
        cluster.connect().await.unwrap();
        dropper.await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let result = tokio::time::timeout(Duration::from_secs(3), cluster.invoker().ping())
            .await
            .expect("call after backend drop must not hang");
        match result {
            Err(e) => assert!(matches!(e, ClusterError::Runtime(_)) && e.is_transient()),
            Ok(()) => panic!("ping succeeded over a dropped connection"),
        }
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let holder = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let cluster =
            RemoteCluster::with_reply_timeout(vec![addr.to_string()], registry(), Duration::from_millis(100));
        cluster.connect().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(3), cluster.invoker().ping())
            .await
            .expect("reply timeout must bound the call");
        assert!(matches!(result, Err(ClusterError::Runtime(_))));
        cluster.disconnect().await;
        holder.abort();
    }

    #[tokio::test]
    async fn test_requests_round_trip_through_host() {
        let (host, _runtime) = host().await;
        let registry = registry();
        registry
            .register_service(
                "backend-node",
                ServiceEntry {
                    role_name: BACKEND_SERVICE.to_string(),
                    access_address: "127.0.0.1".to_string(),
                    port: host.local_addr().port(),
                },
            )
            .await
            .unwrap();

        let cluster = RemoteCluster::new(Vec::new(), registry.clone());
        cluster.connect().await.unwrap();
        let invoker = cluster.invoker();

        let outcome = invoker
            .add_player(
                9,
                PlayerContext {
                    profile_id: 100,
                    display_name: "remote".to_string(),
                },
                None,
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(invoker.get_players(9).await.unwrap(), vec![outcome.index]);

        let failed = invoker.end_merge(9).await;
        assert!(matches!(failed, Err(ClusterError::Actor(_))));

        cluster.disconnect().await;
        assert!(matches!(invoker.ping().await, Err(ClusterError::NotConnected)));
        host.stop();
        let _ = tokio::fs::remove_dir_all(registry.root()).await;
    }

    #[tokio::test]
    async fn test_host_shutdown_closes_open_links() {
        let (host, _runtime) = host().await;
        let registry = registry();
        registry
            .register_service(
                "backend-node",
                ServiceEntry {
                    role_name: BACKEND_SERVICE.to_string(),
                    access_address: "127.0.0.1".to_string(),
                    port: host.local_addr().port(),
                },
            )
            .await
            .unwrap();

        let cluster = RemoteCluster::new(Vec::new(), registry.clone());
        cluster.connect().await.unwrap();
        let invoker = cluster.invoker();
        invoker.ping().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), host.shutdown())
            .await
            .unwrap();
        let err = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match invoker.ping().await {
                    Ok(()) => tokio::time::sleep(Duration::from_millis(20)).await,
                    Err(e) => return e,
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(err, ClusterError::Runtime(_)));

        cluster.disconnect().await;
        let _ = tokio::fs::remove_dir_all(registry.root()).await;
    }
}
