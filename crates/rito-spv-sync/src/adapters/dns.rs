//! DNS Seed Resolver Adapter
//!
//! Implements the `SeedResolver` port with the system resolver.

use crate::domain::SpvError;
use crate::ports::outbound::SeedResolver;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

/// Resolves DNS seeds through tokio's `lookup_host`.
#[derive(Clone, Debug)]
pub struct DnsSeedResolver {
    /// Per-seed lookup timeout.
    timeout: Duration,
}

impl DnsSeedResolver {
    /// Create a resolver with a per-seed timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for DnsSeedResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl SeedResolver for DnsSeedResolver {
    async fn resolve(&self, seed: &str, port: u16) -> Result<Vec<SocketAddr>, SpvError> {
        let host = seed.trim_end_matches('.');
        let lookup = tokio::net::lookup_host((host, port));
        let addrs = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| SpvError::Connectivity(format!("DNS lookup of {host} timed out")))?
            .map_err(|e| SpvError::Connectivity(format!("DNS lookup of {host} failed: {e}")))?
            .collect::<Vec<_>>();
        debug!(seed = host, count = addrs.len(), "resolved DNS seed");
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let resolver = DnsSeedResolver::default();
        let addrs = resolver.resolve("127.0.0.1", 7342).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:7342".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_resolve_strips_trailing_dot() {
        let resolver = DnsSeedResolver::default();
        let addrs = resolver.resolve("127.0.0.1.", 17342).await.unwrap();
        assert_eq!(addrs[0].port(), 17342);
    }
}
