//! Front-end edge service
//!
//! Terminates player connections and bridges them into the backend runtime.
//! Launch connects to the backend (retrying until it is reachable), resolves
//! endpoints and TLS settings, starts the acceptor and publishes the access
//! endpoint in the service registry. Shutdown undoes it in reverse.

pub mod acceptor;
pub mod congestion;
pub mod endpoint;
pub mod providers;
pub mod retry;
pub mod session;
pub mod tls;

use crate::cluster::{ClusterClient, ServiceEntry, ServiceRegistry};
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::trap::{spawn_observed, ObservedTask};
use acceptor::{AcceptorSettings, ConnectionAcceptor};
use congestion::{build_congestion_policy, CongestionPolicy};
use endpoint::resolve_endpoints;
use log::{error, info, warn};
use providers::{AuthProviderManager, MetricsSample, TelemetryProvider};
use retry::RetryPolicy;
use session::{SequenceGenerator, UserSessionConfig, UserSessionFactory};
use shared::Role;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tls::{load_certificate, CertificateLoader, TlsSettings};

/// Collaborators the edge service is assembled from
#[derive(Clone)]
pub struct EdgeDeps {
    pub cluster: Arc<dyn ClusterClient>,
    pub registry: Arc<dyn ServiceRegistry>,
    pub acceptor: Arc<dyn ConnectionAcceptor>,
    pub certificates: Arc<dyn CertificateLoader>,
    pub telemetry: Arc<dyn TelemetryProvider>,
}

struct Running {
    bound: SocketAddr,
    metrics: ObservedTask,
}

pub struct EdgeService {
    node_name: String,
    role: Role,
    config: NodeConfig,
    deps: EdgeDeps,
    auth: Arc<AuthProviderManager>,
    running: Mutex<Option<Running>>,
}

impl EdgeService {
    pub fn new(node_name: impl Into<String>, role: Role, config: NodeConfig, deps: EdgeDeps) -> Self {
        let auth = Arc::new(AuthProviderManager::from_config(&config.front_end.auth));
        Self {
            node_name: node_name.into(),
            role,
            config,
            deps,
            auth,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Address the acceptor is bound to, once launched
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.running.lock().ok()?.as_ref().map(|r| r.bound)
    }

    pub async fn launch(&self) -> Result<SocketAddr> {
        let retry = RetryPolicy::fixed(Duration::from_millis(self.config.cluster.retry_interval_ms));
        retry
            .run("backend runtime", || self.deps.cluster.connect())
            .await?;

        let session_config = UserSessionConfig {
            invoker: self.deps.cluster.invoker(),
            sequence: Arc::new(SequenceGenerator::new(self.role.name())),
            auth: Arc::clone(&self.auth),
            telemetry: Arc::clone(&self.deps.telemetry),
        };

        let endpoint = &self.config.front_end.endpoint;
        let endpoints = resolve_endpoints(endpoint).await?;
        let tls = TlsSettings::from_endpoint(endpoint)?;
        let certificate = load_certificate(self.deps.certificates.as_ref(), &tls).await?;
        let congestion = build_congestion_policy(&self.config.front_end.congestion);

        let settings = AcceptorSettings {
            bind: endpoints.bind,
            backlog: endpoint.backlog,
            capacity: endpoint.capacity,
            tls,
            certificate,
            channel_bandwidth: endpoint.channel_bandwidth,
            congestion: congestion.clone(),
        };
        let handler = Arc::new(UserSessionFactory::new(session_config));
        let bound = self
            .deps
            .acceptor
            .start(settings, handler)
            .await
            .map_err(|source| {
                error!(
                    "Failed to bind {}: {}. The {} service is now inaccessible",
                    endpoints.bind, source, self.role
                );
                NodeError::Bind {
                    endpoint: endpoints.bind,
                    source,
                }
            })?;

        let metrics = self.spawn_metrics_reporter(congestion);
        let entry = ServiceEntry {
            role_name: self.role.name().to_string(),
            access_address: endpoints.access_address,
            port: bound.port(),
        };
        if let Err(e) = self.deps.registry.register_service(&self.node_name, entry.clone()).await {
            metrics.abort();
            self.deps.acceptor.stop().await;
            return Err(e.into());
        }
        info!("{} reachable at {} (bound to {})", self.role, entry.endpoint(), bound);

        if let Ok(mut slot) = self.running.lock() {
            if let Some(previous) = slot.replace(Running { bound, metrics }) {
                previous.metrics.abort();
            }
        }
        Ok(bound)
    }

    fn spawn_metrics_reporter(&self, congestion: Option<Arc<dyn CongestionPolicy>>) -> ObservedTask {
        let every = Duration::from_secs(self.config.front_end.metrics_interval_secs.max(1));
        spawn_observed(
            "edge-metrics",
            report_metrics(
                Arc::clone(&self.deps.acceptor),
                Arc::clone(&self.deps.telemetry),
                congestion,
                every,
            ),
        )
    }

    /// Stops accepting, disposes auth, disconnects from the backend
    pub async fn shutdown(&self) {
        let running = self.running.lock().ok().and_then(|mut r| r.take());

        self.deps.acceptor.stop().await;
        self.auth.dispose();
        self.deps.cluster.disconnect().await;

        if let Some(running) = running {
            running.metrics.abort();
            if let Err(e) = self
                .deps
                .registry
                .deregister_service(&self.node_name, self.role.name())
                .await
            {
                warn!("Failed to deregister {}: {}", self.role, e);
            }
        }
        info!("{} edge service stopped", self.role);
    }
}

async fn report_metrics(
    acceptor: Arc<dyn ConnectionAcceptor>,
    telemetry: Arc<dyn TelemetryProvider>,
    congestion: Option<Arc<dyn CongestionPolicy>>,
    every: Duration,
) -> Result<()> {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        let stats = acceptor.stats();
        telemetry.report(&MetricsSample {
            active_connections: stats.active,
            accepted_total: stats.accepted,
            rejected_total: stats.rejected,
            throttled_total: congestion.as_ref().map_or(0, |c| c.throttled()),
        });
    }
}
