//! DNS seed discovery.
//!
//! Used when the address pool runs dry. Seeds resolve to plain IP
//! addresses; the port comes from the chain parameters.

use std::collections::BTreeSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Peer discovery service.
#[derive(Debug, Clone)]
pub struct PeerDiscovery {
    /// DNS seed host names.
    seeds: Vec<String>,
    /// Port used for the lookup.
    port: u16,
    /// DNS resolution timeout.
    dns_timeout: Duration,
}

impl PeerDiscovery {
    /// Create a discovery service for a seed list.
    pub fn new(seeds: Vec<String>, port: u16) -> Self {
        Self {
            seeds,
            port,
            dns_timeout: Duration::from_secs(10),
        }
    }

    /// Set DNS resolution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = timeout;
        self
    }

    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    /// Resolve every seed and return the distinct IPs.
    pub async fn lookup(&self) -> Vec<String> {
        let mut ips = BTreeSet::new();

        for seed in &self.seeds {
            match self.resolve_seed(seed).await {
                Ok(addrs) => {
                    info!(seed = %seed, count = addrs.len(), "Resolved DNS seed");
                    ips.extend(addrs.into_iter().map(|addr| addr.ip().to_string()));
                }
                Err(e) => {
                    warn!(seed = %seed, error = %e, "Failed to resolve DNS seed");
                }
            }
        }

        ips.into_iter().collect()
    }

    async fn resolve_seed(&self, seed: &str) -> Result<Vec<SocketAddr>, std::io::Error> {
        let target = format!("{}:{}", seed, self.port);

        let result = timeout(
            self.dns_timeout,
            tokio::task::spawn_blocking(move || {
                target.to_socket_addrs().map(|iter| iter.collect::<Vec<_>>())
            }),
        )
        .await;

        match result {
            Ok(Ok(Ok(addrs))) => Ok(addrs),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Task join error: {}", e),
            )),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "DNS resolution timed out",
            )),
        }
    }
}
