//! TCP accept loop for the relay front.

use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::session::{self, SessionContext},
    metrics,
};

/// Accepts front connections and hands each to a session task.
///
/// Shutdown happens in two stages: `accept_cancel` stops the accept loop
/// while live connections keep relaying, `conn_cancel` tears the
/// connections down once the drain grace lapses.
pub struct RelayServer {
    ctx: Arc<SessionContext>,
    listen: String,
    accept_cancel: CancellationToken,
    conn_cancel: CancellationToken,
}

impl RelayServer {
    pub fn new(
        ctx: Arc<SessionContext>,
        listen: impl Into<String>,
        accept_cancel: CancellationToken,
        conn_cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            listen: listen.into(),
            accept_cancel,
            conn_cancel,
        }
    }

    /// Bind the front listener and accept until cancelled
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .wrap_err_with(|| format!("failed to bind front listener on {}", self.listen))?;
        let local = listener
            .local_addr()
            .wrap_err("front listener has no local address")?;
        tracing::info!(listen = %local, "relay front listening");

        loop {
            tokio::select! {
                _ = self.accept_cancel.cancelled() => {
                    tracing::info!("accept loop stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(error) => {
                            tracing::warn!(%error, "accept failed");
                            continue;
                        }
                    };
                    if let Err(error) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, %error, "set_nodelay failed");
                    }

                    let ctx = self.ctx.clone();
                    let conn_cancel = self.conn_cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = conn_cancel.cancelled() => {
                                tracing::debug!(%peer, "connection torn down by shutdown");
                            }
                            _ = session::serve_connection(ctx, stream, peer) => {}
                        }
                    });
                }
            }
        }
    }

    /// Wait for in-flight exchanges to finish, bounded by `grace`
    pub async fn drain(&self, grace: Duration) -> bool {
        let drained = self.ctx.pairings.wait_for_drain(grace).await;
        metrics::set_active_pairings(self.ctx.pairings.active_pairings());
        drained
    }
}
