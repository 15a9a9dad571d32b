//! TLS settings and certificate loading for the player endpoint

use crate::config::EndpointSection;
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use log::warn;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslProtocol {
    None,
    Tls12,
    Tls13,
}

impl FromStr for SslProtocol {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(SslProtocol::None),
            "tls12" | "tls1.2" => Ok(SslProtocol::Tls12),
            "tls13" | "tls1.3" => Ok(SslProtocol::Tls13),
            other => Err(NodeError::config(format!(
                "unknown ssl_protocol '{}' (expected none, tls12 or tls13)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub protocol: SslProtocol,
    pub certificate_file: Option<PathBuf>,
    pub certificate_pass: Option<String>,
}

impl TlsSettings {
    /// `ssl_protocol` is mandatory; certificate fields are mandatory unless
    /// the protocol is `none`
    pub fn from_endpoint(endpoint: &EndpointSection) -> Result<Self> {
        let protocol: SslProtocol = endpoint
            .ssl_protocol
            .as_deref()
            .ok_or_else(|| {
                NodeError::config("front_end.endpoint.ssl_protocol is required (use \"none\" to disable TLS)")
            })?
            .parse()?;

        if protocol == SslProtocol::None {
            return Ok(Self::plaintext());
        }

        let certificate_file = non_empty(&endpoint.certificate_file).ok_or_else(|| {
            NodeError::config(format!(
                "front_end.endpoint.certificate_file is required when ssl_protocol is {:?}",
                protocol
            ))
        })?;
        let certificate_pass = non_empty(&endpoint.certificate_pass).ok_or_else(|| {
            NodeError::config(format!(
                "front_end.endpoint.certificate_pass is required when ssl_protocol is {:?}",
                protocol
            ))
        })?;

        Ok(Self {
            protocol,
            certificate_file: Some(PathBuf::from(certificate_file)),
            certificate_pass: Some(certificate_pass.to_string()),
        })
    }

    pub fn plaintext() -> Self {
        Self {
            protocol: SslProtocol::None,
            certificate_file: None,
            certificate_pass: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.protocol != SslProtocol::None
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Raw certificate material; parsing is left to the TLS implementation
#[derive(Clone)]
pub struct Certificate {
    pub data: Vec<u8>,
    pub password: String,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("bytes", &self.data.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait CertificateLoader: Send + Sync {
    async fn load(&self, path: &Path, password: &str) -> io::Result<Certificate>;
}

pub struct FileCertificateLoader;

#[async_trait]
impl CertificateLoader for FileCertificateLoader {
    async fn load(&self, path: &Path, password: &str) -> io::Result<Certificate> {
        let data = tokio::fs::read(path).await?;
        if data.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "certificate file is empty"));
        }
        Ok(Certificate {
            data,
            password: password.to_string(),
        })
    }
}

/// Loads the certificate when TLS is enabled; failures are logged as
/// warnings and returned
pub async fn load_certificate(
    loader: &dyn CertificateLoader,
    settings: &TlsSettings,
) -> Result<Option<Certificate>> {
    let (Some(path), Some(password)) = (&settings.certificate_file, &settings.certificate_pass) else {
        return Ok(None);
    };

    match loader.load(path, password).await {
        Ok(certificate) => Ok(Some(certificate)),
        Err(e) => {
            warn!("Failed to load certificate {}: {}", path.display(), e);
            Err(NodeError::certificate(format!("{}: {}", path.display(), e)))
        }
    }
}
