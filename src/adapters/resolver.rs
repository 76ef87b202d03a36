use std::net::IpAddr;

use async_trait::async_trait;
use tokio::net::lookup_host;

use crate::ports::resolver::{Resolver, ResolverError, ResolverResult};

/// Hostname resolver backed by the runtime's `lookup_host`.
///
/// Uses the system resolver via the standard library, so `/etc/hosts`
/// entries and search domains behave the same as for any other process.
pub struct SystemResolver;

impl SystemResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> ResolverResult<Vec<IpAddr>> {
        // lookup_host wants a socket address; the port is discarded
        let query = format!("{host}:0");
        let addrs: Vec<IpAddr> = lookup_host(query)
            .await
            .map_err(|err| ResolverError::Failed {
                host: host.to_string(),
                reason: err.to_string(),
            })?
            .map(|addr| addr.ip())
            .collect();

        if addrs.is_empty() {
            return Err(ResolverError::Failed {
                host: host.to_string(),
                reason: "no addresses returned".to_string(),
            });
        }

        tracing::debug!(host, count = addrs.len(), "resolved host");
        Ok(addrs)
    }
}
