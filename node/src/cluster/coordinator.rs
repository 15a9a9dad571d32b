//! Coordination service: shared configuration nodes and the service registry
//!
//! [`FileCoordinator`] keeps both in a directory every node of the cluster
//! can reach. Writes go to a temporary file first and are renamed into
//! place, so readers never see a partial node.

use crate::error::ClusterError;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

const SERVICES_DIR: &str = "services";

#[async_trait]
pub trait ClusterCoordinator: Send + Sync {
    /// `ClusterError::NodeNotFound` until someone has written `path`
    async fn read_node(&self, path: &str) -> Result<Vec<u8>, ClusterError>;
    async fn write_node(&self, path: &str, data: &[u8]) -> Result<(), ClusterError>;
}

/// Where a role can be reached once it has bound its listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub role_name: String,
    pub access_address: String,
    pub port: u16,
}

impl ServiceEntry {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.access_address, self.port)
    }
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn register_service(&self, node_name: &str, entry: ServiceEntry) -> Result<(), ClusterError>;
    async fn deregister_service(&self, node_name: &str, role_name: &str) -> Result<(), ClusterError>;
    async fn services(&self) -> Result<Vec<ServiceEntry>, ClusterError>;
}

#[derive(Debug, Clone)]
pub struct FileCoordinator {
    root: PathBuf,
}

impl FileCoordinator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ClusterError> {
        let relative = Path::new(path);
        let valid = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(ClusterError::Protocol(format!(
                "invalid coordination path '{}'",
                path
            )));
        }
        Ok(self.root.join(relative))
    }

    fn service_path(node_name: &str, role_name: &str) -> String {
        format!("{}/{}.{}.toml", SERVICES_DIR, role_name, node_name)
    }
}

#[async_trait]
impl ClusterCoordinator for FileCoordinator {
    async fn read_node(&self, path: &str) -> Result<Vec<u8>, ClusterError> {
        let file = self.resolve(path)?;
        match tokio::fs::read(&file).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ClusterError::NodeNotFound(path.to_string()))
            }
            Err(e) => Err(ClusterError::Storage(e)),
        }
    }

    async fn write_node(&self, path: &str, data: &[u8]) -> Result<(), ClusterError> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let staging = file.with_extension(format!("tmp.{}", Uuid::new_v4().simple()));
        tokio::fs::write(&staging, data).await?;
        if let Err(e) = tokio::fs::rename(&staging, &file).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        debug!("Wrote coordination node {} ({} bytes)", path, data.len());
        Ok(())
    }
}

#[async_trait]
impl ServiceRegistry for FileCoordinator {
    async fn register_service(&self, node_name: &str, entry: ServiceEntry) -> Result<(), ClusterError> {
        let text = toml::to_string(&entry).map_err(|e| ClusterError::Protocol(e.to_string()))?;
        self.write_node(&Self::service_path(node_name, &entry.role_name), text.as_bytes())
            .await
    }

    async fn deregister_service(&self, node_name: &str, role_name: &str) -> Result<(), ClusterError> {
        let file = self.resolve(&Self::service_path(node_name, role_name))?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn services(&self) -> Result<Vec<ServiceEntry>, ClusterError> {
        let dir = self.root.join(SERVICES_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut services = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await?;
            match toml::from_str::<ServiceEntry>(&text) {
                Ok(service) => services.push(service),
                Err(e) => debug!("Skipping malformed service entry {}: {}", path.display(), e),
            }
        }
        services.sort_by(|a, b| (&a.role_name, a.port).cmp(&(&b.role_name, b.port)));
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> FileCoordinator {
        FileCoordinator::new(std::env::temp_dir().join(format!("coordinator-{}", Uuid::new_v4())))
    }

    #[tokio::test]
    async fn test_missing_node_is_not_found() {
        let coordinator = scratch();
        let err = coordinator.read_node("config/cluster.toml").await.unwrap_err();
        assert!(matches!(err, ClusterError::NodeNotFound(ref p) if p == "config/cluster.toml"));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_written_node_reads_back_and_overwrites() {
        let coordinator = scratch();
        coordinator.write_node("config/cluster.toml", b"a = 1").await.unwrap();
        coordinator.write_node("config/cluster.toml", b"a = 2").await.unwrap();

        let data = coordinator.read_node("config/cluster.toml").await.unwrap();
        assert_eq!(data, b"a = 2");

        let _ = tokio::fs::remove_dir_all(coordinator.root()).await;
    }

    #[tokio::test]
    async fn test_paths_escaping_the_root_are_rejected() {
        let coordinator = scratch();
        for path in ["../outside", "/etc/passwd", ""] {
            let result = coordinator.write_node(path, b"x").await;
            assert!(matches!(result, Err(ClusterError::Protocol(_))), "{}", path);
        }
    }

    #[tokio::test]
    async fn test_service_registry_lists_registered_entries() {
        let coordinator = scratch();
        assert!(coordinator.services().await.unwrap().is_empty());

        let entry = ServiceEntry {
            role_name: "Backend".to_string(),
            access_address: "127.0.0.1".to_string(),
            port: 7000,
        };
        coordinator.register_service("node-a", entry.clone()).await.unwrap();
        assert_eq!(coordinator.services().await.unwrap(), vec![entry.clone()]);
        assert_eq!(entry.endpoint(), "127.0.0.1:7000");

        coordinator.deregister_service("node-a", "Backend").await.unwrap();
        coordinator.deregister_service("node-a", "Backend").await.unwrap();
        assert!(coordinator.services().await.unwrap().is_empty());

        let _ = tokio::fs::remove_dir_all(coordinator.root()).await;
    }
}
