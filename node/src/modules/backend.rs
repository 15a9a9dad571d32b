//! Backend role: hosts the actor runtime

use super::gateway::DedicatedServerGateway;
use crate::bootstrap::{ModuleContext, NodeModule};
use crate::cluster::{BackendHost, BackendRuntime, RuntimeSettings, ServiceEntry, ServiceRegistry, BACKEND_SERVICE};
use crate::config::BackendSection;
use crate::edge::endpoint::best_guess_access_address;
use crate::error::{NodeError, Result};
use crate::trap::ObservedTask;
use async_trait::async_trait;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::lookup_host;

struct Running {
    host: BackendHost,
    gateway: Option<DedicatedServerGateway>,
    collector: ObservedTask,
}

impl Running {
    fn stop(self) {
        self.host.stop();
        if let Some(gateway) = &self.gateway {
            gateway.stop();
        }
        self.collector.abort();
    }

    /// Stops like `stop`, then waits for open links and dedicated servers to
    /// be released
    async fn shutdown(self) {
        self.collector.abort();
        if let Some(gateway) = &self.gateway {
            gateway.shutdown().await;
        }
        self.host.shutdown().await;
    }
}

pub struct BackendModule {
    node_name: String,
    settings: BackendSection,
    registry: Arc<dyn ServiceRegistry>,
    runtime: Arc<BackendRuntime>,
    running: Mutex<Option<Running>>,
}

impl BackendModule {
    pub fn new(node_name: impl Into<String>, settings: BackendSection, registry: Arc<dyn ServiceRegistry>) -> Self {
        let runtime = BackendRuntime::new(RuntimeSettings {
            session_capacity: settings.session_capacity,
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
        });
        Self {
            node_name: node_name.into(),
            settings,
            registry,
            runtime,
            running: Mutex::new(None),
        }
    }

    pub fn create(context: &ModuleContext) -> Result<Box<dyn NodeModule>> {
        Ok(Box::new(Self::new(
            context.node_name.clone(),
            context.config.backend.clone(),
            Arc::clone(&context.registry),
        )))
    }

    pub fn runtime(&self) -> &Arc<BackendRuntime> {
        &self.runtime
    }

    /// Address the backend runtime listens on, once launched
    pub fn host_addr(&self) -> Option<SocketAddr> {
        self.running.lock().ok()?.as_ref().map(|r| r.host.local_addr())
    }

    pub fn gateway_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .ok()?
            .as_ref()
            .and_then(|r| r.gateway.as_ref().map(DedicatedServerGateway::local_addr))
    }

    async fn start(&self) -> Result<Running> {
        let bind = resolve_bind(&self.settings.bind).await?;
        let host = BackendHost::bind(bind, Arc::clone(&self.runtime)).await?;

        let gateway = match self.settings.gateway_bind.as_deref().map(str::trim) {
            Some(addr) if !addr.is_empty() => {
                let addr = resolve_bind(addr).await?;
                match DedicatedServerGateway::bind(addr, Arc::clone(&self.runtime)).await {
                    Ok(gateway) => Some(gateway),
                    Err(e) => {
                        host.stop();
                        return Err(e);
                    }
                }
            }
            _ => None,
        };

        let sweep = Duration::from_secs((self.settings.idle_timeout_secs / 2).max(1));
        let collector = self.runtime.spawn_idle_collector(sweep);
        Ok(Running {
            host,
            gateway,
            collector,
        })
    }
}

async fn resolve_bind(addr: &str) -> Result<SocketAddr> {
    lookup_host(addr)
        .await
        .map_err(|e| NodeError::config(format!("invalid bind endpoint '{}': {}", addr, e)))?
        .next()
        .ok_or_else(|| NodeError::config(format!("bind endpoint '{}' resolved to nothing", addr)))
}

#[async_trait]
impl NodeModule for BackendModule {
    async fn init(&self) -> Result<()> {
        resolve_bind(&self.settings.bind).await?;
        Ok(())
    }

    async fn launch(&self) -> Result<()> {
        let running = self.start().await?;

        let access_address = match self.settings.access_address.trim() {
            "" => best_guess_access_address().await,
            explicit => explicit.to_string(),
        };
        let entry = ServiceEntry {
            role_name: BACKEND_SERVICE.to_string(),
            access_address,
            port: running.host.local_addr().port(),
        };

        if let Err(e) = self.registry.register_service(&self.node_name, entry.clone()).await {
            running.stop();
            return Err(e.into());
        }
        info!("Backend runtime registered as {}", entry.endpoint());

        if let Ok(mut slot) = self.running.lock() {
            if let Some(previous) = slot.replace(running) {
                previous.stop();
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let running = self.running.lock().ok().and_then(|mut r| r.take());
        let Some(running) = running else {
            return;
        };

        if let Err(e) = self.registry.deregister_service(&self.node_name, BACKEND_SERVICE).await {
            warn!("Failed to deregister backend runtime: {}", e);
        }
        running.shutdown().await;
        info!("Backend runtime stopped");
    }
}
