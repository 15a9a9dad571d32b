//! Coordinator role: publishes the cluster configuration

use crate::bootstrap::{ModuleContext, NodeModule};
use crate::cluster::ClusterCoordinator;
use crate::config::{LocalConfig, CLUSTER_CONFIG_NODE};
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;

pub struct ConfigBootstrapperModule {
    local: LocalConfig,
    coordinator: Arc<dyn ClusterCoordinator>,
}

impl ConfigBootstrapperModule {
    pub fn new(local: LocalConfig, coordinator: Arc<dyn ClusterCoordinator>) -> Self {
        Self { local, coordinator }
    }

    pub fn create(context: &ModuleContext) -> Result<Box<dyn NodeModule>> {
        Ok(Box::new(Self::new(
            context.local.clone(),
            Arc::clone(&context.coordinator),
        )))
    }
}

#[async_trait]
impl NodeModule for ConfigBootstrapperModule {
    /// Everything else merges this document, so publishing is the whole job
    async fn launch(&self) -> Result<()> {
        let text = toml::to_string(&self.local.document)
            .map_err(|e| NodeError::config(format!("cannot serialise cluster configuration: {}", e)))?;
        self.coordinator.write_node(CLUSTER_CONFIG_NODE, text.as_bytes()).await?;
        info!(
            "Published cluster configuration from {} to {}",
            self.local.path.display(),
            CLUSTER_CONFIG_NODE
        );
        Ok(())
    }

    async fn shutdown(&self) {}
}
