use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

/// Custom error type for name resolution operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ResolverError {
    /// Error when a hostname cannot be resolved
    #[error("Resolution failed for '{host}': {reason}")]
    Failed { host: String, reason: String },
}

/// Result type alias for resolver operations
pub type ResolverResult<T> = Result<T, ResolverError>;

/// Resolver defines the port (interface) for symbolic hostname lookups.
///
/// The host refresher is its only consumer; it needs just enough of a
/// resolver to turn configured names into address-qualified origins.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Resolve a hostname to its addresses
    ///
    /// # Arguments
    /// * `host` - The hostname to resolve, without scheme or port
    ///
    /// # Returns
    /// Addresses in the order the system returned them
    async fn resolve(&self, host: &str) -> ResolverResult<Vec<IpAddr>>;
}
