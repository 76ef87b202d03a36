use std::time::Duration;

use async_trait::async_trait;
use tokio::{net::TcpStream, time::timeout};

use crate::ports::connector::{BoxedTransport, Connector, ConnectorError, ConnectorResult};

/// TCP transport dialer with a bounded connect phase.
///
/// The timeout covers name lookup and the TCP handshake together; an
/// origin that accepts slowly is indistinguishable from one that is down.
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, authority: &str) -> ConnectorResult<BoxedTransport> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(authority)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ConnectorError::Io {
                    authority: authority.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(ConnectorError::Timeout {
                    authority: authority.to_string(),
                    timeout: self.connect_timeout,
                });
            }
        };

        // Relayed chunks should hit the wire without Nagle batching
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(authority, %err, "could not disable Nagle on origin socket");
        }

        tracing::debug!(authority, "origin connected");
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    #[tokio::test]
    async fn test_connects_to_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authority = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).await.unwrap();
            buf
        });

        let connector = TcpConnector::new(Duration::from_secs(5));
        let mut transport = connector.connect(&authority).await.unwrap();
        transport.write_all(b"ping").await.unwrap();

        assert_eq!(&accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_refused_connection_is_io_error() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authority = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = TcpConnector::new(Duration::from_secs(5));
        let result = connector.connect(&authority).await;
        assert!(matches!(result, Err(ConnectorError::Io { .. })));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_as_timeout() {
        // RFC 5737 test address; connection attempts hang rather than refuse
        let connector = TcpConnector::new(Duration::from_millis(50));
        let result = connector.connect("192.0.2.1:81").await;
        assert!(matches!(
            result,
            Err(ConnectorError::Timeout { .. }) | Err(ConnectorError::Io { .. })
        ));
    }
}
