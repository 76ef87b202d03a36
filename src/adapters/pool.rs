use std::{collections::VecDeque, sync::Arc, time::Duration};

use scc::HashMap;
use tokio::{io::AsyncReadExt, time::Instant, time::timeout};

use crate::ports::connector::BoxedTransport;

/// Idle connections older than this are discarded at checkout
const MAX_PARKED_AGE: Duration = Duration::from_secs(60);

/// Idle connections kept per origin before the oldest is dropped
const MAX_PARKED_PER_ORIGIN: usize = 8;

struct ParkedTransport {
    transport: BoxedTransport,
    parked_at: Instant,
}

/// Keep-alive pool of idle origin connections, keyed by origin URL.
///
/// Connections are parked after an exchange where both peers allowed
/// reuse, and revalidated at checkout: a closed socket or one with
/// unsolicited bytes waiting is discarded rather than handed out, since
/// its framing state can no longer be trusted.
#[derive(Clone)]
pub struct OriginPool {
    parked: Arc<HashMap<String, VecDeque<ParkedTransport>>>,
}

impl OriginPool {
    pub fn new() -> Self {
        Self {
            parked: Arc::new(HashMap::new()),
        }
    }

    /// Park an idle connection for later reuse
    pub fn checkin(&self, key: &str, transport: BoxedTransport) {
        let mut entry = self
            .parked
            .entry(key.to_string())
            .or_insert_with(VecDeque::new);
        let queue = entry.get_mut();
        if queue.len() >= MAX_PARKED_PER_ORIGIN {
            queue.pop_front();
            tracing::debug!(origin = key, "pool full, dropping oldest idle connection");
        }
        queue.push_back(ParkedTransport {
            transport,
            parked_at: Instant::now(),
        });
        tracing::debug!(origin = key, idle = queue.len(), "connection parked");
    }

    /// Take a live idle connection for this origin, if one survives
    /// revalidation
    pub async fn checkout(&self, key: &str) -> Option<BoxedTransport> {
        loop {
            let candidate = match self.parked.get(key) {
                Some(mut entry) => {
                    let queue = entry.get_mut();
                    let popped = queue.pop_front();
                    if queue.is_empty() {
                        entry.remove_entry();
                    }
                    popped
                }
                None => None,
            };

            let Some(parked) = candidate else {
                return None;
            };
            if parked.parked_at.elapsed() > MAX_PARKED_AGE {
                tracing::debug!(origin = key, "discarding idle connection past max age");
                continue;
            }
            let mut transport = parked.transport;
            if Self::is_live(&mut transport).await {
                tracing::debug!(origin = key, "reusing idle connection");
                return Some(transport);
            }
            tracing::debug!(origin = key, "discarding dead idle connection");
        }
    }

    /// Idle connections currently parked for an origin
    pub fn idle_count(&self, key: &str) -> usize {
        self.parked.read(key, |_, queue| queue.len()).unwrap_or(0)
    }

    /// A zero-duration read distinguishes the three parked states: a
    /// pending read means the socket is open and quiet, EOF means the
    /// origin closed it, and readable bytes mean the origin spoke out of
    /// turn.
    async fn is_live(transport: &mut BoxedTransport) -> bool {
        let mut probe = [0u8; 1];
        match timeout(Duration::ZERO, transport.read(&mut probe)).await {
            Err(_) => true,
            Ok(Ok(0)) => false,
            Ok(Ok(_)) => false,
            Ok(Err(_)) => false,
        }
    }
}

impl Default for OriginPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, duplex};

    use super::*;

    const KEY: &str = "http://origin.test:80";

    #[tokio::test]
    async fn test_checkout_from_empty_pool() {
        let pool = OriginPool::new();
        assert!(pool.checkout(KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_parked_connection_round_trips() {
        let pool = OriginPool::new();
        let (near, mut far) = duplex(64);
        pool.checkin(KEY, Box::new(near));
        assert_eq!(pool.idle_count(KEY), 1);

        let mut reused = pool.checkout(KEY).await.expect("live connection");
        assert_eq!(pool.idle_count(KEY), 0);

        reused.write_all(b"reused").await.unwrap();
        let mut buf = [0u8; 6];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reused");
    }

    #[tokio::test]
    async fn test_closed_connection_is_discarded() {
        let pool = OriginPool::new();
        let (near, far) = duplex(64);
        drop(far);
        pool.checkin(KEY, Box::new(near));

        assert!(pool.checkout(KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_connection_with_unsolicited_bytes_is_discarded() {
        let pool = OriginPool::new();
        let (near, mut far) = duplex(64);
        far.write_all(b"stray").await.unwrap();
        pool.checkin(KEY, Box::new(near));

        assert!(pool.checkout(KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_discard_falls_through_to_next_parked() {
        let pool = OriginPool::new();
        let (dead, gone) = duplex(64);
        drop(gone);
        let (live, _far) = duplex(64);
        pool.checkin(KEY, Box::new(dead));
        pool.checkin(KEY, Box::new(live));

        assert!(pool.checkout(KEY).await.is_some());
        assert!(pool.checkout(KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_pool_caps_idle_per_origin() {
        let pool = OriginPool::new();
        let mut fars = Vec::new();
        for _ in 0..MAX_PARKED_PER_ORIGIN + 3 {
            let (near, far) = duplex(64);
            fars.push(far);
            pool.checkin(KEY, Box::new(near));
        }
        assert_eq!(pool.idle_count(KEY), MAX_PARKED_PER_ORIGIN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_out_connection_is_discarded() {
        let pool = OriginPool::new();
        let (near, _far) = duplex(64);
        pool.checkin(KEY, Box::new(near));

        tokio::time::advance(MAX_PARKED_AGE + Duration::from_secs(1)).await;
        assert!(pool.checkout(KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let pool = OriginPool::new();
        let (near, _far) = duplex(64);
        pool.checkin(KEY, Box::new(near));

        assert!(pool.checkout("http://other.test:80").await.is_none());
        assert_eq!(pool.idle_count(KEY), 1);
    }
}
