use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use regex::Regex;
use thiserror::Error;

use crate::{
    config::models::RelayConfig,
    core::{
        balancer::{Balancer, BalancerError, Lease, StrategyKind},
        origin::{Origin, OriginError, OriginSet},
    },
};

/// Errors raised while building a routing table
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouterError {
    /// Error when a rule's regex pattern does not compile
    #[error("invalid routing rule '{pattern}': {reason}")]
    InvalidRule { pattern: String, reason: String },

    #[error(transparent)]
    Origin(#[from] OriginError),

    #[error(transparent)]
    Strategy(#[from] BalancerError),
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Lowercase a host header value and strip any port suffix
pub fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim();
    let host = if trimmed.starts_with('[') {
        match trimmed.find(']') {
            Some(end) => &trimmed[..=end],
            None => trimmed,
        }
    } else {
        match trimmed.rsplit_once(':') {
            Some((head, tail)) if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) => {
                head
            }
            _ => trimmed,
        }
    };
    host.to_ascii_lowercase()
}

/// Basic credentials gate for one host key
#[derive(Debug, Clone)]
pub struct AuthRule {
    realm: String,
    token: String,
}

impl AuthRule {
    fn new(realm: impl Into<String>, credentials: &str) -> Self {
        Self {
            realm: realm.into(),
            token: BASE64.encode(credentials),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Whether an Authorization header value satisfies the gate
    pub fn accepts(&self, header: Option<&str>) -> bool {
        header
            .and_then(|value| value.strip_prefix("Basic "))
            .map(str::trim)
            == Some(self.token.as_str())
    }

    /// Challenge value for the WWW-Authenticate header
    pub fn challenge(&self) -> String {
        format!("Basic realm=\"{}\"", self.realm)
    }
}

/// Effective dispatch target of a host entry
#[derive(Debug, Clone)]
pub enum HostTarget {
    Single(Origin),
    Set(Arc<OriginSet>),
}

/// One host entry: the configured source URLs plus the currently
/// effective target. The refresher reads sources and replaces targets;
/// request handling only ever reads targets.
#[derive(Debug, Clone)]
pub struct HostEntry {
    sources: Vec<Origin>,
    set_configured: bool,
    target: HostTarget,
}

impl HostEntry {
    /// Origin URLs as configured, before any re-resolution
    pub fn sources(&self) -> &[Origin] {
        &self.sources
    }

    /// Whether the config spelled this entry as a balanced tuple
    pub fn set_configured(&self) -> bool {
        self.set_configured
    }

    pub fn target(&self) -> &HostTarget {
        &self.target
    }
}

#[derive(Debug, Clone)]
struct RegexRule {
    regex: Regex,
    template: String,
}

/// Where a resolved request should go, before balancing
#[derive(Debug)]
pub enum TableMatch<'a> {
    /// Client-visible redirect to this location
    Redirect(&'a str),
    /// Dispatch to a single origin; a regex match carries the rewritten
    /// request target
    Single {
        origin: Origin,
        path_override: Option<String>,
    },
    /// Dispatch across an origin set
    Set(&'a Arc<OriginSet>),
    /// Nothing matched
    Miss,
}

/// Outcome of a table lookup
#[derive(Debug)]
pub struct Resolution<'a> {
    pub target: TableMatch<'a>,
    pub auth: Option<&'a AuthRule>,
    pub error_page: Option<&'a str>,
}

/// Immutable routing snapshot.
///
/// Tables are built whole from configuration and replaced whole by the
/// refresher; request handling never observes a half-updated table.
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RegexRule>,
    hosts: HashMap<String, HostEntry>,
    aliases: HashMap<String, String>,
    forward: Option<Origin>,
    auth: HashMap<String, AuthRule>,
    redirects: HashMap<String, String>,
    error_pages: HashMap<String, String>,
}

impl RouteTable {
    /// Build a table from configuration
    pub fn build(config: &RelayConfig) -> RouterResult<Self> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            let regex = Regex::new(&rule.pattern).map_err(|e| RouterError::InvalidRule {
                pattern: rule.pattern.clone(),
                reason: e.to_string(),
            })?;
            rules.push(RegexRule {
                regex,
                template: rule.target.clone(),
            });
        }

        let mut hosts = HashMap::with_capacity(config.hosts.len());
        for (key, value) in &config.hosts {
            let sources = value
                .urls()
                .iter()
                .map(|url| Origin::parse(url))
                .collect::<Result<Vec<_>, _>>()?;
            let key = normalize_host(key);
            let target = Self::effective_target(&key, &sources, value.is_set());
            hosts.insert(
                key,
                HostEntry {
                    sources,
                    set_configured: value.is_set(),
                    target,
                },
            );
        }

        let aliases = config
            .aliases
            .iter()
            .map(|(alias, key)| (normalize_host(alias), normalize_host(key)))
            .collect();

        let forward = config
            .forward
            .as_deref()
            .map(Origin::parse)
            .transpose()?;

        let auth = config
            .auth
            .iter()
            .map(|(key, credentials)| {
                let key = normalize_host(key);
                let rule = AuthRule::new(key.clone(), credentials);
                (key, rule)
            })
            .collect();

        let redirects = config
            .redirects
            .iter()
            .map(|(key, target)| (normalize_host(key), target.clone()))
            .collect();
        let error_pages = config
            .error_pages
            .iter()
            .map(|(key, target)| (normalize_host(key), target.clone()))
            .collect();

        Ok(Self {
            rules,
            hosts,
            aliases,
            forward,
            auth,
            redirects,
            error_pages,
        })
    }

    fn effective_target(key: &str, sources: &[Origin], set_configured: bool) -> HostTarget {
        if !set_configured && sources.len() == 1 {
            HostTarget::Single(sources[0].clone())
        } else {
            HostTarget::Set(Arc::new(OriginSet::new(key, sources.to_vec())))
        }
    }

    /// Host entries by normalized key
    pub fn hosts(&self) -> &HashMap<String, HostEntry> {
        &self.hosts
    }

    /// Copy of this table with the given entries' effective targets
    /// replaced. Sources and every other table section are untouched.
    pub fn with_targets(&self, updates: HashMap<String, HostTarget>) -> Self {
        let mut next = self.clone();
        for (key, target) in updates {
            if let Some(entry) = next.hosts.get_mut(&key) {
                entry.target = target;
            }
        }
        next
    }

    /// Follow aliases toward a host key, two hops at most
    fn canonical_key<'a>(&'a self, key: &'a str) -> &'a str {
        let mut current = key;
        for _ in 0..2 {
            if self.hosts.contains_key(current) {
                return current;
            }
            match self.aliases.get(current) {
                Some(next) => current = next.as_str(),
                None => return current,
            }
        }
        current
    }

    /// Resolve a request to its dispatch target.
    ///
    /// # Arguments
    /// * `url` - Full reconstructed request URL (scheme://host/path?query)
    /// * `host` - Raw host header value
    ///
    /// Resolution order is fixed: redirects, then regex rules, then
    /// host/alias lookup, then the forward fallback.
    pub fn resolve<'a>(&'a self, url: &str, host: &str) -> Resolution<'a> {
        let key = normalize_host(host);

        if let Some(target) = self.redirects.get(&key) {
            // A request already at the redirect target falls through to
            // routing instead of bouncing forever.
            if url != target {
                return Resolution {
                    target: TableMatch::Redirect(target),
                    auth: None,
                    error_page: None,
                };
            }
        }

        let canonical = self.canonical_key(&key).to_string();
        let auth = self.auth.get(&key).or_else(|| self.auth.get(&canonical));
        let error_page = self
            .error_pages
            .get(&key)
            .or_else(|| self.error_pages.get(&canonical))
            .map(String::as_str);

        for rule in &self.rules {
            let Some(caps) = rule.regex.captures(url) else {
                continue;
            };
            let mut expanded = String::new();
            caps.expand(&rule.template, &mut expanded);
            match Origin::parse(&expanded) {
                Ok(origin) => {
                    let parsed = url::Url::parse(&expanded).ok();
                    let path_override = parsed.map(|u| match u.query() {
                        Some(q) => format!("{}?{}", u.path(), q),
                        None => u.path().to_string(),
                    });
                    return Resolution {
                        target: TableMatch::Single {
                            origin,
                            path_override,
                        },
                        auth,
                        error_page,
                    };
                }
                Err(err) => {
                    tracing::debug!(pattern = %rule.regex, %expanded, %err, "rule target did not expand to a dialable origin, trying next rule");
                }
            }
        }

        if let Some(entry) = self.hosts.get(&canonical) {
            let target = match &entry.target {
                HostTarget::Single(origin) => TableMatch::Single {
                    origin: origin.clone(),
                    path_override: None,
                },
                HostTarget::Set(set) => TableMatch::Set(set),
            };
            return Resolution {
                target,
                auth,
                error_page,
            };
        }

        if let Some(forward) = &self.forward {
            return Resolution {
                target: TableMatch::Single {
                    origin: forward.clone(),
                    path_override: None,
                },
                auth,
                error_page,
            };
        }

        Resolution {
            target: TableMatch::Miss,
            auth,
            error_page,
        }
    }
}

/// Everything the orchestrator needs to dispatch one proxied request
#[derive(Debug)]
pub struct RelayTicket {
    pub lease: Lease,
    pub path_override: Option<String>,
    pub error_page: Option<String>,
}

/// Decision for one inbound request
#[derive(Debug)]
pub enum RouteOutcome {
    /// Answer with a redirect to this location
    Redirect(String),
    /// Answer 401 with this WWW-Authenticate challenge
    Challenge(String),
    /// Relay to the leased origin
    Relay(RelayTicket),
    /// Answer 404
    Miss,
}

/// Routing facade: the swappable table plus the balancer.
pub struct Router {
    table: ArcSwap<RouteTable>,
    balancer: Balancer,
}

impl Router {
    pub fn new(table: RouteTable, strategy: StrategyKind) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            balancer: Balancer::new(strategy),
        }
    }

    /// Build a router directly from configuration
    pub fn from_config(config: &RelayConfig) -> RouterResult<Self> {
        let table = RouteTable::build(config)?;
        let strategy = config.strategy.parse::<StrategyKind>()?;
        Ok(Self::new(table, strategy))
    }

    /// Current table snapshot
    pub fn table(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Replace the table; in-flight requests keep the snapshot they loaded
    pub fn install(&self, table: RouteTable) {
        self.table.store(Arc::new(table));
    }

    /// Route one request, acquiring an origin lease when it proxies.
    ///
    /// # Arguments
    /// * `url` - Full reconstructed request URL
    /// * `host` - Raw host header value
    /// * `authorization` - Authorization header value, if any
    pub fn route(&self, url: &str, host: &str, authorization: Option<&str>) -> RouteOutcome {
        let table = self.table.load();
        let resolution = table.resolve(url, host);

        if !matches!(resolution.target, TableMatch::Redirect(_) | TableMatch::Miss) {
            if let Some(rule) = resolution.auth {
                if !rule.accepts(authorization) {
                    return RouteOutcome::Challenge(rule.challenge());
                }
            }
        }

        match resolution.target {
            TableMatch::Redirect(target) => RouteOutcome::Redirect(target.to_string()),
            TableMatch::Single {
                origin,
                path_override,
            } => RouteOutcome::Relay(RelayTicket {
                lease: Lease::direct(origin),
                path_override,
                error_page: resolution.error_page.map(str::to_string),
            }),
            TableMatch::Set(set) => match self.balancer.acquire(set) {
                Some(lease) => RouteOutcome::Relay(RelayTicket {
                    lease,
                    path_override: None,
                    error_page: resolution.error_page.map(str::to_string),
                }),
                None => RouteOutcome::Miss,
            },
            TableMatch::Miss => RouteOutcome::Miss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_config() -> RelayConfig {
        RelayConfig::builder()
            .rule("^http://x.test/api/(.*)$", "http://rules:9000/v2/$1")
            .host("x.test", "http://hosts:9001")
            .host_set("a.test", ["http://b1:80", "http://b2:80"])
            .alias("www.a.test", "a.test")
            .alias("legacy.a.test", "www.a.test")
            .forward("http://fallback:9002")
            .build()
    }

    fn single_origin(resolution: &Resolution<'_>) -> Origin {
        match &resolution.target {
            TableMatch::Single { origin, .. } => origin.clone(),
            other => panic!("expected single origin, got {other:?}"),
        }
    }

    #[test]
    fn test_normalize_host_strips_port_and_case() {
        assert_eq!(normalize_host("A.Test"), "a.test");
        assert_eq!(normalize_host("a.test:8080"), "a.test");
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
        assert_eq!(normalize_host("[::1]"), "[::1]");
        assert_eq!(normalize_host(" a.test "), "a.test");
    }

    #[test]
    fn test_resolution_prefers_rules_then_hosts_then_forward() {
        let table = RouteTable::build(&full_config()).unwrap();
        let resolved = table.resolve("http://x.test/api/users", "x.test");
        assert_eq!(single_origin(&resolved).host(), "rules");

        let mut no_rules = full_config();
        no_rules.rules.clear();
        let table = RouteTable::build(&no_rules).unwrap();
        let resolved = table.resolve("http://x.test/api/users", "x.test");
        assert_eq!(single_origin(&resolved).host(), "hosts");

        let mut bare = no_rules;
        bare.hosts.clear();
        bare.aliases.clear();
        let table = RouteTable::build(&bare).unwrap();
        let resolved = table.resolve("http://x.test/api/users", "x.test");
        assert_eq!(single_origin(&resolved).host(), "fallback");
    }

    #[test]
    fn test_rule_captures_substitute_into_target() {
        let table = RouteTable::build(&full_config()).unwrap();
        let resolved = table.resolve("http://x.test/api/users?id=1", "x.test");
        match resolved.target {
            TableMatch::Single {
                origin,
                path_override,
            } => {
                assert_eq!(origin.as_str(), "http://rules:9000");
                assert_eq!(path_override.as_deref(), Some("/v2/users?id=1"));
            }
            other => panic!("expected single origin, got {other:?}"),
        }
    }

    #[test]
    fn test_alias_chain_resolves_within_two_hops() {
        let table = RouteTable::build(&full_config()).unwrap();
        let resolved = table.resolve("http://legacy.a.test/", "legacy.a.test");
        assert!(matches!(resolved.target, TableMatch::Set(set) if set.key() == "a.test"));
    }

    #[test]
    fn test_alias_chain_beyond_two_hops_falls_through() {
        let mut config = full_config();
        config
            .aliases
            .insert("old.a.test".to_string(), "legacy.a.test".to_string());
        let table = RouteTable::build(&config).unwrap();
        let resolved = table.resolve("http://old.a.test/", "old.a.test");
        // Three hops never reach the host entry; the forward fallback wins.
        assert_eq!(single_origin(&resolved).host(), "fallback");
    }

    #[test]
    fn test_redirect_precedes_routing() {
        let mut config = full_config();
        config
            .redirects
            .insert("x.test".to_string(), "http://moved.test/".to_string());
        let table = RouteTable::build(&config).unwrap();
        let resolved = table.resolve("http://x.test/api/users", "x.test");
        assert!(matches!(
            resolved.target,
            TableMatch::Redirect("http://moved.test/")
        ));
    }

    #[test]
    fn test_redirect_skipped_when_request_is_already_at_target() {
        let mut config = full_config();
        config
            .redirects
            .insert("x.test".to_string(), "http://x.test/api/users".to_string());
        let table = RouteTable::build(&config).unwrap();
        let resolved = table.resolve("http://x.test/api/users", "x.test");
        assert_eq!(single_origin(&resolved).host(), "rules");
    }

    #[test]
    fn test_miss_without_fallback() {
        let config = RelayConfig::builder().host("a.test", "http://b1:80").build();
        let table = RouteTable::build(&config).unwrap();
        let resolved = table.resolve("http://nowhere.test/", "nowhere.test");
        assert!(matches!(resolved.target, TableMatch::Miss));
    }

    #[test]
    fn test_router_rotates_across_set_members() {
        let router = Router::from_config(&full_config()).unwrap();
        let mut picked = Vec::new();
        for _ in 0..3 {
            match router.route("http://a.test/x", "a.test", None) {
                RouteOutcome::Relay(ticket) => picked.push(ticket.lease.origin().host().to_string()),
                other => panic!("expected relay, got {other:?}"),
            }
        }
        assert_eq!(picked, ["b1", "b2", "b1"]);
    }

    #[test]
    fn test_auth_challenges_then_accepts() {
        let mut config = full_config();
        config
            .auth
            .insert("a.test".to_string(), "user:pass".to_string());
        let router = Router::from_config(&config).unwrap();

        match router.route("http://a.test/x", "a.test", None) {
            RouteOutcome::Challenge(challenge) => {
                assert_eq!(challenge, "Basic realm=\"a.test\"");
            }
            other => panic!("expected challenge, got {other:?}"),
        }

        match router.route("http://a.test/x", "a.test", Some("Basic dXNlcjpwYXNz")) {
            RouteOutcome::Relay(_) => {}
            other => panic!("expected relay, got {other:?}"),
        }

        match router.route("http://a.test/x", "a.test", Some("Basic d3Jvbmc6d3Jvbmc=")) {
            RouteOutcome::Challenge(_) => {}
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn test_auth_applies_through_alias() {
        let mut config = full_config();
        config
            .auth
            .insert("a.test".to_string(), "user:pass".to_string());
        let router = Router::from_config(&config).unwrap();
        assert!(matches!(
            router.route("http://www.a.test/x", "www.a.test", None),
            RouteOutcome::Challenge(_)
        ));
    }

    #[test]
    fn test_error_page_rides_on_ticket() {
        let mut config = full_config();
        config
            .error_pages
            .insert("a.test".to_string(), "http://errors.test/oops".to_string());
        let router = Router::from_config(&config).unwrap();
        match router.route("http://a.test/x", "a.test", None) {
            RouteOutcome::Relay(ticket) => {
                assert_eq!(ticket.error_page.as_deref(), Some("http://errors.test/oops"));
            }
            other => panic!("expected relay, got {other:?}"),
        }
    }

    #[test]
    fn test_with_targets_replaces_only_named_entry() {
        let table = RouteTable::build(&full_config()).unwrap();
        let refreshed = Arc::new(OriginSet::new(
            "a.test",
            vec![
                Origin::parse("http://10.0.0.1:80").unwrap(),
                Origin::parse("http://10.0.0.2:80").unwrap(),
            ],
        ));
        let next = table.with_targets(HashMap::from([(
            "a.test".to_string(),
            HostTarget::Set(refreshed),
        )]));

        match next.hosts()["a.test"].target() {
            HostTarget::Set(set) => assert_eq!(set.members()[0].origin.host(), "10.0.0.1"),
            other => panic!("expected set, got {other:?}"),
        }
        // Sources keep the symbolic form for the next refresh pass.
        assert_eq!(next.hosts()["a.test"].sources()[0].host(), "b1");
        match next.hosts()["x.test"].target() {
            HostTarget::Single(origin) => assert_eq!(origin.host(), "hosts"),
            other => panic!("expected single, got {other:?}"),
        }
    }
}
