use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Custom error type for backend transport operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectorError {
    /// Error when the transport connection fails
    #[error("Connection to {authority} failed: {source}")]
    Io {
        /// The authority that was dialed
        authority: String,
        #[source]
        source: std::io::Error,
    },

    /// Error when no connection materializes within the configured window
    #[error("Connection to {authority} timed out after {timeout:?}")]
    Timeout {
        /// The authority that was dialed
        authority: String,
        /// The configured connect timeout
        timeout: Duration,
    },
}

/// Result type alias for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Bidirectional byte stream as produced by a connector
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Transport for T {}

/// Boxed transport stream, the unit the pool and pairings move around
pub type BoxedTransport = Box<dyn Transport>;

/// Connector defines the port (interface) for opening backend connections
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a transport stream to an authority
    ///
    /// # Arguments
    /// * `authority` - Dial target in `host:port` form
    ///
    /// # Returns
    /// A connected stream, ready for the first write
    async fn connect(&self, authority: &str) -> ConnectorResult<BoxedTransport>;
}
