use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use scc::HashMap;

/// How a pairing is carrying traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMode {
    /// One request/response exchange at a time (HTTP/1.x)
    Sequential,
    /// Concurrent streams over one connection (HTTP/2)
    Multiplexed,
    /// Raw byte tunnel after CONNECT
    Tunnel,
}

/// Information about one client connection paired with its origins
#[derive(Debug)]
pub struct PairingInfo {
    /// Unique pairing ID
    pub id: String,
    /// Client socket address
    pub client: SocketAddr,
    /// Unix timestamp (seconds) when the pairing was established
    pub established_at: u64,
    /// Total exchanges relayed over this pairing
    pub relayed: AtomicU64,
    /// Exchanges currently in flight
    pub in_flight: AtomicU64,
    mode: std::sync::Mutex<PairingMode>,
}

impl PairingInfo {
    /// Mark the start of one relayed exchange
    pub fn exchange_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the end of one relayed exchange
    pub fn exchange_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn mode(&self) -> PairingMode {
        match self.mode.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Record a mode change, e.g. after an HTTP/2 preface or a CONNECT upgrade
    pub fn set_mode(&self, mode: PairingMode) {
        match self.mode.lock() {
            Ok(mut guard) => *guard = mode,
            Err(poisoned) => *poisoned.into_inner() = mode,
        }
    }
}

/// Tracks active pairings so shutdown can drain in-flight exchanges
#[derive(Clone)]
pub struct PairingTracker {
    pairings: Arc<HashMap<String, Arc<PairingInfo>>>,
    total_pairings: Arc<AtomicU64>,
}

impl PairingTracker {
    pub fn new() -> Self {
        Self {
            pairings: Arc::new(HashMap::new()),
            total_pairings: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a newly accepted client connection
    pub fn register(&self, client: SocketAddr) -> Arc<PairingInfo> {
        let id = uuid::Uuid::new_v4().to_string();
        let info = Arc::new(PairingInfo {
            id: id.clone(),
            client,
            established_at: chrono::Utc::now().timestamp().max(0) as u64,
            relayed: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            mode: std::sync::Mutex::new(PairingMode::Sequential),
        });

        let _ = self.pairings.insert(id.clone(), info.clone());
        self.total_pairings.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Pairing {} registered for client {}", id, client);
        info
    }

    /// Remove a pairing once its client connection closes
    pub fn unregister(&self, id: &str) {
        if let Some((_, info)) = self.pairings.remove(id) {
            tracing::debug!(
                "Pairing {} closed after {} exchanges",
                id,
                info.relayed.load(Ordering::Relaxed)
            );
        }
    }

    /// Look up a pairing by ID
    pub fn get(&self, id: &str) -> Option<Arc<PairingInfo>> {
        self.pairings.read(id, |_, info| info.clone())
    }

    /// Number of currently open pairings
    pub fn active_pairings(&self) -> usize {
        self.pairings.len()
    }

    /// Sum of in-flight exchanges across all pairings
    pub fn active_exchanges(&self) -> u64 {
        let mut total = 0;
        self.pairings.scan(|_, info| {
            total += info.in_flight.load(Ordering::Relaxed);
        });
        total
    }

    /// Total pairings accepted since startup
    pub fn total_pairings(&self) -> u64 {
        self.total_pairings.load(Ordering::Relaxed)
    }

    /// Wait until every in-flight exchange completes or the timeout expires.
    ///
    /// Returns `true` if the tracker drained, `false` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = Duration::from_millis(100);

        loop {
            let active = self.active_exchanges();
            if active == 0 {
                tracing::info!("All in-flight exchanges drained");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("Drain timed out with {} exchanges still in flight", active);
                return false;
            }

            tracing::debug!("Waiting for {} in-flight exchanges", active);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
    }
}

impl Default for PairingTracker {
    fn default() -> Self {
        Self::new()
    }
}
