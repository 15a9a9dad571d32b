use super::runtime::BackendRuntime;
use super::{BackendInvoker, BackendRequest, BackendResponse, ClusterClient};
use crate::actor::CallChain;
use crate::error::ClusterError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cluster client for a backend runtime living in the same process
pub struct LocalCluster {
    invoker: Arc<LocalInvoker>,
}

struct LocalInvoker {
    runtime: Arc<BackendRuntime>,
    connected: AtomicBool,
}

impl LocalCluster {
    pub fn new(runtime: Arc<BackendRuntime>) -> Self {
        Self {
            invoker: Arc::new(LocalInvoker {
                runtime,
                connected: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl BackendInvoker for LocalInvoker {
    async fn invoke(&self, request: BackendRequest) -> Result<BackendResponse, ClusterError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ClusterError::NotConnected);
        }
        Ok(self.runtime.dispatch(&CallChain::root(), request).await)
    }
}

#[async_trait]
impl ClusterClient for LocalCluster {
    async fn connect(&self) -> Result<(), ClusterError> {
        self.invoker.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) {
        self.invoker.connected.store(false, Ordering::Release);
    }

    fn invoker(&self) -> Arc<dyn BackendInvoker> {
        self.invoker.clone()
    }
}
