use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        origin::{Origin, OriginMember, OriginSet},
        router::{HostEntry, HostTarget, Router},
    },
    ports::resolver::Resolver,
};

/// Periodic re-resolution of symbolic origin hosts.
///
/// Each pass walks the host entries, resolves every symbolic source URL,
/// and flattens the results in source order. An entry whose constituents
/// all resolved gets its effective target swapped atomically; any failed
/// resolution leaves that entry exactly as it was. Address-literal
/// origins pass through untouched.
pub struct HostRefresher {
    router: Arc<Router>,
    resolver: Arc<dyn Resolver>,
    interval: Duration,
}

impl HostRefresher {
    pub fn new(router: Arc<Router>, resolver: Arc<dyn Resolver>, interval: Duration) -> Self {
        Self {
            router,
            resolver,
            interval,
        }
    }

    /// Run refresh passes until cancelled.
    ///
    /// A zero interval means exactly one pass: resolve everything once at
    /// startup and never reschedule.
    pub async fn run(&self, token: CancellationToken) {
        loop {
            self.refresh_once().await;
            if self.interval.is_zero() {
                tracing::debug!("refresh interval is zero, stopping after one pass");
                return;
            }
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("host refresher stopping");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// One full pass over the current table
    pub async fn refresh_once(&self) {
        let table = self.router.table();
        let mut updates: HashMap<String, HostTarget> = HashMap::new();

        for (key, entry) in table.hosts() {
            if let Some(target) = self.refresh_entry(key, entry).await {
                updates.insert(key.clone(), target);
            }
        }

        if !updates.is_empty() {
            let count = updates.len();
            self.router.install(table.with_targets(updates));
            tracing::info!(entries = count, "installed re-resolved host targets");
        }
    }

    /// Re-resolve one entry, returning its next target when it changed
    async fn refresh_entry(&self, key: &str, entry: &HostEntry) -> Option<HostTarget> {
        let mut flat: Vec<Origin> = Vec::new();
        for source in entry.sources() {
            if !source.is_symbolic() {
                flat.push(source.clone());
                continue;
            }
            match self.resolver.resolve(source.host()).await {
                Ok(addrs) => {
                    flat.extend(
                        addrs
                            .iter()
                            .map(|addr| source.with_host(&addr.to_string())),
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        host = key,
                        source = source.as_str(),
                        %err,
                        "resolution failed, keeping previous targets"
                    );
                    return None;
                }
            }
        }

        if flat.is_empty() {
            tracing::warn!(host = key, "resolution produced no addresses, keeping previous targets");
            return None;
        }

        let current: Vec<&str> = match entry.target() {
            HostTarget::Single(origin) => vec![origin.as_str()],
            HostTarget::Set(set) => set
                .members()
                .iter()
                .map(|member| member.origin.as_str())
                .collect(),
        };
        if current
            .iter()
            .copied()
            .eq(flat.iter().map(|origin| origin.as_str()))
        {
            return None;
        }

        if entry.set_configured() || flat.len() > 1 {
            // Busy accounting carries over for members whose address
            // survived the refresh; new members start idle.
            let existing: HashMap<&str, &OriginMember> = match entry.target() {
                HostTarget::Set(set) => set
                    .members()
                    .iter()
                    .map(|member| (member.origin.as_str(), member))
                    .collect(),
                HostTarget::Single(_) => HashMap::new(),
            };
            let members = flat
                .into_iter()
                .map(|origin| match existing.get(origin.as_str()) {
                    Some(member) => OriginMember {
                        origin,
                        slot: Arc::clone(&member.slot),
                    },
                    None => OriginMember::new(origin),
                })
                .collect();
            Some(HostTarget::Set(Arc::new(OriginSet::with_members(
                key, members,
            ))))
        } else {
            flat.into_iter().next().map(HostTarget::Single)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::models::RelayConfig,
        core::balancer::StrategyKind,
        core::router::RouteTable,
        ports::resolver::{ResolverError, ResolverResult},
    };

    struct FixedResolver {
        entries: std::sync::Mutex<HashMap<String, Vec<IpAddr>>>,
    }

    impl FixedResolver {
        fn new(pairs: &[(&str, &[&str])]) -> Arc<Self> {
            let resolver = Arc::new(Self {
                entries: std::sync::Mutex::new(HashMap::new()),
            });
            resolver.set(pairs);
            resolver
        }

        fn set(&self, pairs: &[(&str, &[&str])]) {
            let mut entries = self.entries.lock().unwrap();
            entries.clear();
            for (host, addrs) in pairs {
                entries.insert(
                    host.to_string(),
                    addrs.iter().map(|a| a.parse().unwrap()).collect(),
                );
            }
        }
    }

    #[async_trait]
    impl Resolver for FixedResolver {
        async fn resolve(&self, host: &str) -> ResolverResult<Vec<IpAddr>> {
            self.entries
                .lock()
                .unwrap()
                .get(host)
                .cloned()
                .ok_or_else(|| ResolverError::Failed {
                    host: host.to_string(),
                    reason: "unknown host".to_string(),
                })
        }
    }

    fn router_for(config: &RelayConfig) -> Arc<Router> {
        Arc::new(Router::new(
            RouteTable::build(config).unwrap(),
            StrategyKind::Robin,
        ))
    }

    fn member_hosts(router: &Router, key: &str) -> Vec<String> {
        match router.table().hosts()[key].target() {
            HostTarget::Single(origin) => vec![origin.host().to_string()],
            HostTarget::Set(set) => set
                .members()
                .iter()
                .map(|m| m.origin.host().to_string())
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_refresh_flattens_in_source_order() {
        let config = RelayConfig::builder()
            .host_set("app.test", ["http://b1.test:80", "http://b2.test:80"])
            .build();
        let router = router_for(&config);
        let resolver = FixedResolver::new(&[
            ("b1.test", &["10.0.0.1", "10.0.0.2"]),
            ("b2.test", &["10.0.0.3"]),
        ]);

        HostRefresher::new(router.clone(), resolver, Duration::ZERO)
            .refresh_once()
            .await;

        assert_eq!(
            member_hosts(&router, "app.test"),
            ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
        // The configured symbolic sources survive for the next pass.
        assert_eq!(
            router.table().hosts()["app.test"].sources()[0].host(),
            "b1.test"
        );
    }

    #[tokio::test]
    async fn test_failed_resolution_leaves_entry_unchanged() {
        let config = RelayConfig::builder()
            .host_set("app.test", ["http://b1.test:80", "http://b2.test:80"])
            .build();
        let router = router_for(&config);
        // b2 is missing, so the whole entry must stay symbolic.
        let resolver = FixedResolver::new(&[("b1.test", &["10.0.0.1"])]);

        HostRefresher::new(router.clone(), resolver, Duration::ZERO)
            .refresh_once()
            .await;

        assert_eq!(member_hosts(&router, "app.test"), ["b1.test", "b2.test"]);
    }

    #[tokio::test]
    async fn test_literal_origins_skip_resolution() {
        let config = RelayConfig::builder()
            .host("ip.test", "http://192.168.1.5:8080")
            .build();
        let router = router_for(&config);
        // Any resolver call would error; literals never reach it.
        let resolver = FixedResolver::new(&[]);

        HostRefresher::new(router.clone(), resolver, Duration::ZERO)
            .refresh_once()
            .await;

        assert_eq!(member_hosts(&router, "ip.test"), ["192.168.1.5"]);
    }

    #[tokio::test]
    async fn test_single_url_fanning_out_becomes_a_set() {
        let config = RelayConfig::builder()
            .host("app.test", "http://b1.test:80")
            .build();
        let router = router_for(&config);
        let resolver = FixedResolver::new(&[("b1.test", &["10.0.0.1", "10.0.0.2"])]);

        HostRefresher::new(router.clone(), resolver, Duration::ZERO)
            .refresh_once()
            .await;

        match router.table().hosts()["app.test"].target() {
            HostTarget::Set(set) => assert_eq!(set.len(), 2),
            other => panic!("expected set, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_busy_slots_survive_address_overlap() {
        let config = RelayConfig::builder()
            .host_set("app.test", ["http://b1.test:80"])
            .build();
        let router = router_for(&config);
        let resolver = FixedResolver::new(&[("b1.test", &["10.0.0.1"])]);
        let refresher = HostRefresher::new(router.clone(), resolver.clone(), Duration::ZERO);

        refresher.refresh_once().await;
        match router.table().hosts()["app.test"].target() {
            HostTarget::Set(set) => set.members()[0].slot.acquire(),
            other => panic!("expected set, got {other:?}"),
        }

        resolver.set(&[("b1.test", &["10.0.0.1", "10.0.0.9"])]);
        refresher.refresh_once().await;

        match router.table().hosts()["app.test"].target() {
            HostTarget::Set(set) => {
                assert_eq!(set.members()[0].slot.in_flight(), 1);
                assert_eq!(set.members()[1].slot.in_flight(), 0);
            }
            other => panic!("expected set, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_interval_runs_exactly_one_pass() {
        let config = RelayConfig::builder()
            .host("app.test", "http://b1.test:80")
            .build();
        let router = router_for(&config);
        let resolver = FixedResolver::new(&[("b1.test", &["10.0.0.1"])]);

        // run() must terminate on its own with a zero interval.
        HostRefresher::new(router.clone(), resolver, Duration::ZERO)
            .run(CancellationToken::new())
            .await;

        assert_eq!(member_hosts(&router, "app.test"), ["10.0.0.1"]);
    }
}
