use std::{cmp::Reverse, fmt, str::FromStr, sync::Arc};

use thiserror::Error;

use crate::core::origin::{BusySlot, Origin, OriginMember, OriginSet};

/// Errors related to balancer configuration
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BalancerError {
    /// Error when an unknown strategy name is configured
    #[error("unknown balancing strategy: {0}")]
    UnknownStrategy(String),
}

/// Result type for balancer operations
pub type BalancerResult<T> = Result<T, BalancerError>;

/// Selection strategy identifier, as spelled in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    /// Rotate through members in order
    #[default]
    Robin,
    /// Prefer the member with the fewest requests in flight
    Smart,
}

impl FromStr for StrategyKind {
    type Err = BalancerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "robin" => Ok(StrategyKind::Robin),
            "smart" => Ok(StrategyKind::Smart),
            other => Err(BalancerError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Robin => write!(f, "robin"),
            StrategyKind::Smart => write!(f, "smart"),
        }
    }
}

/// Trait for origin selection strategies
pub trait BalanceStrategy: Send + Sync {
    /// Pick a member from the set, or `None` when the set is empty
    fn select<'a>(&self, set: &'a OriginSet) -> Option<&'a OriginMember>;

    /// Whether selections are tracked against the member's busy slot
    fn counts_load(&self) -> bool;

    /// Strategy name for logs
    fn name(&self) -> &'static str;
}

/// Rotating selection. Each acquisition advances the set's rotation
/// index; busy accounting is untouched.
pub struct RoundRobinStrategy;

impl BalanceStrategy for RoundRobinStrategy {
    fn select<'a>(&self, set: &'a OriginSet) -> Option<&'a OriginMember> {
        if set.is_empty() {
            return None;
        }
        let index = set.next_rotation() % set.len();
        set.members().get(index)
    }

    fn counts_load(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "robin"
    }
}

/// Least-pending selection. Orders members by in-flight count and breaks
/// ties toward the member idle most recently, so a freshly drained origin
/// is preferred over one idle for longer.
pub struct LeastPendingStrategy;

impl BalanceStrategy for LeastPendingStrategy {
    fn select<'a>(&self, set: &'a OriginSet) -> Option<&'a OriginMember> {
        set.members()
            .iter()
            .min_by_key(|member| {
                (
                    member.slot.in_flight(),
                    Reverse(member.slot.last_release()),
                )
            })
    }

    fn counts_load(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "smart"
    }
}

/// Create a boxed strategy from its configured kind
pub fn create_strategy(kind: StrategyKind) -> Box<dyn BalanceStrategy> {
    match kind {
        StrategyKind::Robin => Box::new(RoundRobinStrategy),
        StrategyKind::Smart => Box::new(LeastPendingStrategy),
    }
}

/// A checked-out origin.
///
/// When the strategy tracks load, the member's busy count is incremented
/// at acquisition and decremented exactly once afterwards, on whichever
/// comes first of explicit completion or drop. The slot handle is cleared
/// on release so the second path finds nothing to decrement.
#[derive(Debug)]
pub struct Lease {
    origin: Origin,
    slot: Option<Arc<BusySlot>>,
}

impl Lease {
    fn counted(origin: Origin, slot: Arc<BusySlot>) -> Self {
        slot.acquire();
        Self {
            origin,
            slot: Some(slot),
        }
    }

    fn uncounted(origin: Origin) -> Self {
        Self { origin, slot: None }
    }

    /// Lease on a fixed origin outside any set; released state is empty
    pub fn direct(origin: Origin) -> Self {
        Self::uncounted(origin)
    }

    /// The origin this lease points at
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Mark the leased request finished
    pub fn complete(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.release(now_stamp());
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Balancer facade pairing a strategy with lease bookkeeping
pub struct Balancer {
    strategy: Box<dyn BalanceStrategy>,
}

impl Balancer {
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            strategy: create_strategy(kind),
        }
    }

    /// Acquire a lease on one member of the set
    ///
    /// # Returns
    /// `None` when the set has no members.
    pub fn acquire(&self, set: &OriginSet) -> Option<Lease> {
        let member = self.strategy.select(set)?;
        let lease = if self.strategy.counts_load() {
            Lease::counted(member.origin.clone(), Arc::clone(&member.slot))
        } else {
            Lease::uncounted(member.origin.clone())
        };
        tracing::debug!(
            strategy = self.strategy.name(),
            origin = %lease.origin(),
            "origin acquired"
        );
        Some(lease)
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }
}

/// Millisecond wall-clock stamp for idle ordering
fn now_stamp() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(keys: &[&str]) -> OriginSet {
        OriginSet::new(
            "app.test",
            keys.iter()
                .map(|k| Origin::parse(&format!("http://{k}:80")).unwrap())
                .collect(),
        )
    }

    #[test]
    fn test_robin_visits_each_member_equally() {
        let balancer = Balancer::new(StrategyKind::Robin);
        let set = set_of(&["b1", "b2", "b3"]);

        let mut counts = std::collections::HashMap::new();
        for _ in 0..9 {
            let lease = balancer.acquire(&set).expect("non-empty set");
            *counts.entry(lease.origin().as_str().to_string()).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n == 3));
    }

    #[test]
    fn test_robin_does_not_touch_busy_counters() {
        let balancer = Balancer::new(StrategyKind::Robin);
        let set = set_of(&["b1", "b2"]);

        let lease = balancer.acquire(&set).unwrap();
        assert!(set.members().iter().all(|m| m.slot.in_flight() == 0));
        drop(lease);
        assert!(set.members().iter().all(|m| m.slot.in_flight() == 0));
    }

    #[test]
    fn test_smart_picks_least_loaded_member() {
        let balancer = Balancer::new(StrategyKind::Smart);
        let set = set_of(&["b1", "b2", "b3"]);
        set.members()[0].slot.acquire();
        set.members()[0].slot.acquire();
        set.members()[2].slot.acquire();

        let lease = balancer.acquire(&set).expect("non-empty set");
        assert_eq!(lease.origin().host(), "b2");
        assert_eq!(set.members()[1].slot.in_flight(), 1);
    }

    #[test]
    fn test_smart_tie_breaks_toward_most_recently_idle() {
        let balancer = Balancer::new(StrategyKind::Smart);
        let set = set_of(&["b1", "b2", "b3"]);
        set.members()[0].slot.acquire();
        set.members()[0].slot.release(100);
        set.members()[2].slot.acquire();
        set.members()[2].slot.release(900);

        let lease = balancer.acquire(&set).expect("non-empty set");
        assert_eq!(lease.origin().host(), "b3");
    }

    #[test]
    fn test_lease_releases_exactly_once() {
        let balancer = Balancer::new(StrategyKind::Smart);
        let set = set_of(&["b1"]);

        let mut lease = balancer.acquire(&set).unwrap();
        assert_eq!(set.members()[0].slot.in_flight(), 1);

        lease.complete();
        assert_eq!(set.members()[0].slot.in_flight(), 0);
        let stamped = set.members()[0].slot.last_release();
        assert!(stamped > 0);

        // Drop after completion must not decrement again.
        drop(lease);
        assert_eq!(set.members()[0].slot.in_flight(), 0);
        assert_eq!(set.members()[0].slot.last_release(), stamped);
    }

    #[test]
    fn test_lease_drop_releases_when_never_completed() {
        let balancer = Balancer::new(StrategyKind::Smart);
        let set = set_of(&["b1"]);

        let lease = balancer.acquire(&set).unwrap();
        assert_eq!(set.members()[0].slot.in_flight(), 1);
        drop(lease);
        assert_eq!(set.members()[0].slot.in_flight(), 0);
    }

    #[test]
    fn test_acquire_on_empty_set_returns_none() {
        let balancer = Balancer::new(StrategyKind::Robin);
        let set = OriginSet::new("empty.test", Vec::new());
        assert!(balancer.acquire(&set).is_none());
    }

    #[test]
    fn test_strategy_kind_parses_config_names() {
        assert_eq!("robin".parse::<StrategyKind>().unwrap(), StrategyKind::Robin);
        assert_eq!("smart".parse::<StrategyKind>().unwrap(), StrategyKind::Smart);
        assert!("random".parse::<StrategyKind>().is_err());
    }
}
