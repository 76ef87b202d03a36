//! Configuration data structures for Viaduct.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! intentionally serde-friendly and include defaults so that minimal configs remain concise.
//! The builder is considered part of the public API for embedding.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_strategy() -> String {
    "robin".to_string()
}

fn default_reuse() -> bool {
    true
}

fn default_deny_status() -> u16 {
    403
}

fn default_max_pending() -> usize {
    256 * 1024
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_recv_timeout() -> String {
    "90s".to_string()
}

fn default_refresh_interval() -> String {
    "5m".to_string()
}

/// One origin URL, or a tuple of origin URLs sharing a host key.
///
/// A tuple is distributed across by the configured balancing strategy;
/// a single URL is dispatched to directly.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum OriginsValue {
    One(String),
    Many(Vec<String>),
}

impl OriginsValue {
    /// All origin URLs in configured order
    pub fn urls(&self) -> &[String] {
        match self {
            OriginsValue::One(url) => std::slice::from_ref(url),
            OriginsValue::Many(urls) => urls,
        }
    }

    /// Whether this entry is a balanced tuple rather than a single origin
    pub fn is_set(&self) -> bool {
        matches!(self, OriginsValue::Many(_))
    }
}

/// One ordered regex routing rule.
///
/// `pattern` is matched against the full reconstructed request URL;
/// capture groups may be substituted into `target` as `$1`, `$2`, ...
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RuleConfig {
    pub pattern: String,
    pub target: String,
}

/// Top-level relay configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the front-end listener binds, e.g. "0.0.0.0:8080"
    pub listen: String,
    /// Ordered regex rules, consulted before host lookup
    pub rules: Vec<RuleConfig>,
    /// Host map: request host -> origin URL or tuple of origin URLs
    pub hosts: HashMap<String, OriginsValue>,
    /// Alias map: alternate host -> host key (at most two hops)
    pub aliases: HashMap<String, String>,
    /// Static fallback origin when no rule or host matches
    pub forward: Option<String>,
    /// Basic credentials per host key, as "user:password"
    pub auth: HashMap<String, String>,
    /// Client-visible redirects per host key
    pub redirects: HashMap<String, String>,
    /// Page shown instead of the deny status when a backend closes without responding
    pub error_pages: HashMap<String, String>,
    /// Balancing strategy: "robin" or "smart"
    pub strategy: String,
    /// Whether finished backend connections are pooled for reuse
    pub reuse: bool,
    /// Strict-Transport-Security max-age appended to responses; 0 disables the header
    pub sts_seconds: u64,
    /// Status sent when a backend closes before responding
    pub deny_status: u16,
    /// Outbound buffer bytes at which reads on the other side pause
    pub max_pending: usize,
    /// Backend connect timeout, parsed by humantime, e.g. "10s"
    pub connect_timeout: String,
    /// Backend receive idle timeout, parsed by humantime, e.g. "90s"
    pub recv_timeout: String,
    /// Interval between origin re-resolutions; "0s" resolves once and stops
    pub refresh_interval: String,
    /// Re-encode eligible response bodies as this encoding: "chunked", "gzip" or "deflate"
    pub compress: Option<String>,
    /// Peer addresses whose forwarded-metadata headers are trusted as input
    pub trusted: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            rules: Vec::new(),
            hosts: HashMap::new(),
            aliases: HashMap::new(),
            forward: None,
            auth: HashMap::new(),
            redirects: HashMap::new(),
            error_pages: HashMap::new(),
            strategy: default_strategy(),
            reuse: default_reuse(),
            sts_seconds: 0,
            deny_status: default_deny_status(),
            max_pending: default_max_pending(),
            connect_timeout: default_connect_timeout(),
            recv_timeout: default_recv_timeout(),
            refresh_interval: default_refresh_interval(),
            compress: None,
            trusted: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Create a new relay configuration builder
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }
}

/// Builder for RelayConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    /// Set the listen address
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.config.listen = addr.into();
        self
    }

    /// Append a regex rule
    pub fn rule(mut self, pattern: impl Into<String>, target: impl Into<String>) -> Self {
        self.config.rules.push(RuleConfig {
            pattern: pattern.into(),
            target: target.into(),
        });
        self
    }

    /// Map a host key to a single origin
    pub fn host(mut self, key: impl Into<String>, origin: impl Into<String>) -> Self {
        self.config
            .hosts
            .insert(key.into(), OriginsValue::One(origin.into()));
        self
    }

    /// Map a host key to a balanced origin tuple
    pub fn host_set<I, S>(mut self, key: impl Into<String>, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.hosts.insert(
            key.into(),
            OriginsValue::Many(origins.into_iter().map(Into::into).collect()),
        );
        self
    }

    /// Map an alias to a host key
    pub fn alias(mut self, alias: impl Into<String>, key: impl Into<String>) -> Self {
        self.config.aliases.insert(alias.into(), key.into());
        self
    }

    /// Set the fallback origin
    pub fn forward(mut self, origin: impl Into<String>) -> Self {
        self.config.forward = Some(origin.into());
        self
    }

    /// Require Basic credentials for a host key
    pub fn auth(mut self, key: impl Into<String>, credentials: impl Into<String>) -> Self {
        self.config.auth.insert(key.into(), credentials.into());
        self
    }

    /// Redirect requests for a host key
    pub fn redirect(mut self, key: impl Into<String>, target: impl Into<String>) -> Self {
        self.config.redirects.insert(key.into(), target.into());
        self
    }

    /// Point a host key at an error page
    pub fn error_page(mut self, key: impl Into<String>, target: impl Into<String>) -> Self {
        self.config.error_pages.insert(key.into(), target.into());
        self
    }

    /// Set the balancing strategy name
    pub fn strategy(mut self, strategy: impl Into<String>) -> Self {
        self.config.strategy = strategy.into();
        self
    }

    /// Enable or disable backend connection reuse
    pub fn reuse(mut self, reuse: bool) -> Self {
        self.config.reuse = reuse;
        self
    }

    /// Set the outbound buffer threshold that pauses reads
    pub fn max_pending(mut self, bytes: usize) -> Self {
        self.config.max_pending = bytes;
        self
    }

    /// Build the final RelayConfig
    pub fn build(self) -> RelayConfig {
        self.config
    }
}
