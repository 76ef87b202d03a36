use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use thiserror::Error;
use url::Url;

/// Errors related to origin identities
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OriginError {
    /// Error when a configured origin URL cannot be parsed
    #[error("invalid origin URL: {0}")]
    InvalidUrl(String),
}

/// Result type for origin operations
pub type OriginResult<T> = Result<T, OriginError>;

/// A single backend address: scheme, host, and port.
///
/// Origins are the unit the balancer distributes across and the key the
/// idle connection pool is indexed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: String,
    host: String,
    port: u16,
    text: String,
}

impl Origin {
    /// Parse an origin from a URL string
    ///
    /// Only `http` and `https` origins are meaningful to the relay; the
    /// port defaults by scheme when absent.
    pub fn parse(url: &str) -> OriginResult<Self> {
        let parsed = Url::parse(url).map_err(|err| {
            OriginError::InvalidUrl(format!("{url}: {err}"))
        })?;
        let scheme = parsed.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(OriginError::InvalidUrl(format!(
                "origin must be http or https, got: {url}"
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| OriginError::InvalidUrl(format!("origin has no host: {url}")))?
            .to_string();
        let port = parsed
            .port()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        Ok(Self::assemble(scheme, host, port))
    }

    fn assemble(scheme: String, host: String, port: u16) -> Self {
        let host_part = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.clone()
        };
        let text = format!("{scheme}://{host_part}:{port}");
        Self {
            scheme,
            host,
            port,
            text,
        }
    }

    /// Rebuild this origin with a resolved address, keeping scheme and port
    pub fn with_host(&self, host: &str) -> Self {
        Self::assemble(self.scheme.clone(), host.to_string(), self.port)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form used when dialing
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Normalized URL text; the pool and pairing logs key on this
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether the host is a symbolic name rather than an address literal,
    /// and so participates in periodic re-resolution
    pub fn is_symbolic(&self) -> bool {
        self.host.trim_matches(|c| c == '[' || c == ']')
            .parse::<std::net::IpAddr>()
            .is_err()
    }
}

impl FromStr for Origin {
    type Err = OriginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Origin::parse(s)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Load-accounting slot shared between the balancer and the relay.
///
/// `in_flight` counts dispatched-but-unfinished requests; `last_release`
/// is stamped only when the count returns to zero, giving the smart
/// strategy its recency tie-break.
#[derive(Debug, Default)]
pub struct BusySlot {
    in_flight: AtomicUsize,
    last_release: AtomicU64,
}

impl BusySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one dispatched request
    pub fn acquire(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Count one finished request; stamps idle time on reaching zero
    pub fn release(&self, stamp: u64) {
        let before = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if before <= 1 {
            self.last_release.store(stamp, Ordering::SeqCst);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn last_release(&self) -> u64 {
        self.last_release.load(Ordering::SeqCst)
    }
}

/// One member of an origin set: the address plus its busy accounting
#[derive(Debug, Clone)]
pub struct OriginMember {
    pub origin: Origin,
    pub slot: Arc<BusySlot>,
}

impl OriginMember {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            slot: Arc::new(BusySlot::new()),
        }
    }
}

/// An ordered set of origins sharing one routing key.
///
/// The set is immutable once built; the refresher replaces whole sets
/// rather than mutating them in place. The round-robin rotation index
/// lives here so rotation state survives for the set's lifetime.
#[derive(Debug)]
pub struct OriginSet {
    key: String,
    members: Vec<OriginMember>,
    rotation: AtomicUsize,
}

impl OriginSet {
    /// Build a set with fresh accounting slots
    pub fn new(key: impl Into<String>, origins: Vec<Origin>) -> Self {
        Self::with_members(key, origins.into_iter().map(OriginMember::new).collect())
    }

    /// Build a set from members, letting callers carry slots over from a
    /// previous generation of the same entry
    pub fn with_members(key: impl Into<String>, members: Vec<OriginMember>) -> Self {
        Self {
            key: key.into(),
            members,
            rotation: AtomicUsize::new(0),
        }
    }

    /// Routing key this set was built for
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn members(&self) -> &[OriginMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Advance the rotation index, returning the previous value
    pub fn next_rotation(&self) -> usize {
        self.rotation.fetch_add(1, Ordering::SeqCst)
    }
}
