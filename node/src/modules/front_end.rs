//! Front-end role: the player-facing edge service

use crate::bootstrap::{ModuleContext, NodeModule};
use crate::cluster::RemoteCluster;
use crate::edge::acceptor::TcpConnectionAcceptor;
use crate::edge::providers::LogTelemetryProvider;
use crate::edge::tls::{FileCertificateLoader, TlsSettings};
use crate::edge::{EdgeDeps, EdgeService};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub struct FrontEndModule {
    edge: EdgeService,
}

impl FrontEndModule {
    pub fn new(edge: EdgeService) -> Self {
        Self { edge }
    }

    pub fn create(context: &ModuleContext) -> Result<Box<dyn NodeModule>> {
        let cluster = RemoteCluster::new(
            context.config.cluster.backend_endpoints.clone(),
            Arc::clone(&context.registry),
        );
        let deps = EdgeDeps {
            cluster: Arc::new(cluster),
            registry: Arc::clone(&context.registry),
            acceptor: Arc::new(TcpConnectionAcceptor::new()),
            certificates: Arc::new(FileCertificateLoader),
            telemetry: Arc::new(LogTelemetryProvider::new(context.role.name())),
        };
        let edge = EdgeService::new(context.node_name.clone(), context.role, context.config.clone(), deps);
        Ok(Box::new(Self::new(edge)))
    }

    pub fn edge(&self) -> &EdgeService {
        &self.edge
    }
}

#[async_trait]
impl NodeModule for FrontEndModule {
    /// Rejects endpoint settings that could never launch
    async fn init(&self) -> Result<()> {
        TlsSettings::from_endpoint(&self.edge.config().front_end.endpoint)?;
        Ok(())
    }

    async fn launch(&self) -> Result<()> {
        self.edge.launch().await?;
        Ok(())
    }

    async fn shutdown(&self) {
        self.edge.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::FileCoordinator;
    use crate::config::{LocalConfig, NodeConfig};
    use crate::error::NodeError;
    use shared::Role;
    use std::path::PathBuf;

    fn context(ssl_protocol: Option<&str>, certificate_file: Option<&str>) -> ModuleContext {
        let mut config = NodeConfig::default();
        config.front_end.endpoint.bind = "127.0.0.1:0".to_string();
        config.front_end.endpoint.ssl_protocol = ssl_protocol.map(str::to_string);
        config.front_end.endpoint.certificate_file = certificate_file.map(str::to_string);

        let files = Arc::new(FileCoordinator::new(std::env::temp_dir().join("front-end-unused")));
        ModuleContext {
            node_name: "edge-node".to_string(),
            role: Role::FrontEnd,
            local: LocalConfig {
                path: PathBuf::from("node.toml"),
                document: toml::Table::new(),
                config: config.clone(),
            },
            config,
            coordinator: files.clone(),
            registry: files,
        }
    }

    #[tokio::test]
    async fn test_init_requires_ssl_protocol() {
        let module = FrontEndModule::create(&context(None, None)).unwrap();
        assert!(matches!(module.init().await, Err(NodeError::Config(_))));
    }

    #[tokio::test]
    async fn test_init_requires_certificate_for_tls() {
        let module = FrontEndModule::create(&context(Some("tls12"), None)).unwrap();
        assert!(module.init().await.is_err());

        let plaintext = FrontEndModule::create(&context(Some("none"), None)).unwrap();
        plaintext.init().await.unwrap();
    }
}
