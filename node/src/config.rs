//! Node configuration
//!
//! Configuration is a TOML document. The coordinator role reads its local
//! file as-is and publishes it to the cluster; every other role reads the
//! published cluster document, layers its own local file on top, then
//! applies the command-line override string.

use crate::cluster::ClusterCoordinator;
use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use toml::{Table, Value};

/// Coordinator node holding the published cluster configuration
pub const CLUSTER_CONFIG_NODE: &str = "config/cluster.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub cluster: ClusterSection,
    pub backend: BackendSection,
    pub front_end: FrontEndSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Root directory of the file-backed coordinator
    pub coordinator_dir: PathBuf,
    /// Backend endpoints to try; when empty the service registry is consulted
    pub backend_endpoints: Vec<String>,
    pub retry_interval_ms: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            coordinator_dir: std::env::temp_dir().join("gamecloud"),
            backend_endpoints: Vec::new(),
            retry_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub bind: String,
    pub access_address: String,
    /// Listener for physical dedicated servers; disabled when unset
    pub gateway_bind: Option<String>,
    pub session_capacity: usize,
    pub idle_timeout_secs: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7000".to_string(),
            access_address: String::new(),
            gateway_bind: None,
            session_capacity: 16,
            idle_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontEndSection {
    pub endpoint: EndpointSection,
    pub congestion: CongestionSection,
    pub auth: AuthSection,
    pub metrics_interval_secs: u64,
}

impl Default for FrontEndSection {
    fn default() -> Self {
        Self {
            endpoint: EndpointSection::default(),
            congestion: CongestionSection::default(),
            auth: AuthSection::default(),
            metrics_interval_secs: 30,
        }
    }
}

/// The `<Endpoint>` block. `ssl_protocol` has no default on purpose: a
/// front-end without it refuses to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSection {
    pub bind: String,
    pub access_address: String,
    pub backlog: u32,
    pub capacity: usize,
    pub ssl_protocol: Option<String>,
    pub certificate_file: Option<String>,
    pub certificate_pass: Option<String>,
    pub channel_bandwidth: u32,
}

impl Default for EndpointSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
            access_address: String::new(),
            backlog: 128,
            capacity: 1024,
            ssl_protocol: None,
            certificate_file: None,
            certificate_pass: None,
            channel_bandwidth: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionSection {
    pub enabled: bool,
    pub window_bytes: u64,
    pub interval_ms: u64,
    pub log_metrics: bool,
}

impl Default for CongestionSection {
    fn default() -> Self {
        Self {
            enabled: false,
            window_bytes: 256 * 1024,
            interval_ms: 100,
            log_metrics: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Empty means every player is admitted
    pub shared_secret: String,
}

/// The local file after overrides, both as a raw document and parsed
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub path: PathBuf,
    pub document: Table,
    pub config: NodeConfig,
}

impl LocalConfig {
    pub async fn load(path: &Path, overrides: &str) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            NodeError::config(format!("cannot read {}: {}", path.display(), e))
        })?;

        let mut document = parse_document(&text)?;
        apply_overrides(&mut document, overrides)?;
        let config = NodeConfig::from_document(document.clone())?;

        Ok(Self {
            path: path.to_path_buf(),
            document,
            config,
        })
    }
}

impl NodeConfig {
    pub fn from_document(document: Table) -> Result<Self> {
        Value::Table(document)
            .try_into()
            .map_err(|e| NodeError::config(format!("invalid configuration: {}", e)))
    }

    /// Merges the published cluster document with the local file
    ///
    /// Fails with a transient `NodeNotFound` until the coordinator role has
    /// published its document.
    pub async fn load_merged(
        local: &LocalConfig,
        overrides: &str,
        coordinator: &dyn ClusterCoordinator,
    ) -> Result<Self> {
        let published = coordinator.read_node(CLUSTER_CONFIG_NODE).await?;
        let text = String::from_utf8(published)
            .map_err(|_| NodeError::config("published cluster configuration is not UTF-8"))?;

        let mut merged = parse_document(&text)?;
        merge_tables(&mut merged, local.document.clone());
        apply_overrides(&mut merged, overrides)?;
        Self::from_document(merged)
    }
}

pub fn parse_document(text: &str) -> Result<Table> {
    text.parse::<Table>()
        .map_err(|e| NodeError::config(format!("malformed configuration: {}", e)))
}

/// Deep merge; values in `overlay` win, nested tables merge key by key
pub fn merge_tables(base: &mut Table, overlay: Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Applies `section.key=value;other.key=value` on top of a document
///
/// Values are read as TOML scalars when they parse as such (`42`, `true`,
/// `"quoted"`), otherwise taken as bare strings.
pub fn apply_overrides(document: &mut Table, overrides: &str) -> Result<()> {
    for pair in overrides.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (path, raw) = pair
            .split_once('=')
            .ok_or_else(|| NodeError::config(format!("override '{}' is missing '='", pair)))?;

        let keys: Vec<&str> = path.trim().split('.').map(str::trim).collect();
        if keys.iter().any(|k| k.is_empty()) {
            return Err(NodeError::config(format!("override path '{}' is malformed", path)));
        }

        let value = parse_scalar(raw.trim());
        let Some((last, parents)) = keys.split_last() else {
            continue;
        };

        let mut table = &mut *document;
        for key in parents {
            let entry = table
                .entry(key.to_string())
                .or_insert_with(|| Value::Table(Table::new()));
            table = match entry {
                Value::Table(inner) => inner,
                _ => {
                    return Err(NodeError::config(format!(
                        "override '{}' descends into non-table key '{}'",
                        pair, key
                    )))
                }
            };
        }
        table.insert(last.to_string(), value);
    }
    Ok(())
}

fn parse_scalar(raw: &str) -> Value {
    format!("v = {}", raw)
        .parse::<Table>()
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| Value::String(raw.to_string()))
}
