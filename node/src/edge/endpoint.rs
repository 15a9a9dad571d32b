//! Bind and access endpoint resolution

use crate::config::EndpointSection;
use crate::error::{NodeError, Result};
use log::{error, info};
use std::net::{IpAddr, SocketAddr};
use tokio::net::lookup_host;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoints {
    /// Address the listener binds to
    pub bind: SocketAddr,
    /// Address advertised to clients through the service registry
    pub access_address: String,
}

pub async fn resolve_endpoints(endpoint: &EndpointSection) -> Result<ResolvedEndpoints> {
    let bind = lookup_host(endpoint.bind.as_str())
        .await
        .map_err(|e| NodeError::config(format!("invalid bind endpoint '{}': {}", endpoint.bind, e)))?
        .next()
        .ok_or_else(|| NodeError::config(format!("bind endpoint '{}' resolved to nothing", endpoint.bind)))?;

    let access_address = match endpoint.access_address.trim() {
        "" => {
            let guess = best_guess_access_address().await;
            // A release deployment should always configure this explicitly
            if cfg!(debug_assertions) {
                info!("No access address configured for {}, advertising {}", bind, guess);
            } else {
                error!("No access address configured for {}, advertising best guess {}", bind, guess);
            }
            guess
        }
        explicit => explicit.to_string(),
    };

    Ok(ResolvedEndpoints { bind, access_address })
}

/// Resolves the local host name, preferring a routable IPv4 address
pub async fn best_guess_access_address() -> String {
    let name = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => return "127.0.0.1".to_string(),
    };

    let resolved = lookup_host((name.clone(), 0)).await;
    let addrs: Vec<IpAddr> = match resolved {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(_) => return name,
    };

    addrs
        .iter()
        .find(|ip| ip.is_ipv4() && !ip.is_loopback())
        .or_else(|| addrs.iter().find(|ip| !ip.is_loopback()))
        .or_else(|| addrs.first())
        .map(|ip| ip.to_string())
        .unwrap_or(name)
}
