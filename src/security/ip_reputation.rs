use chrono::Duration;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::ReputationConfig;
use crate::context::RequestContext;
use crate::error::GuardResult;
use crate::security::audit::{SecurityAuditor, SecurityEvent, SecurityEventType, SecuritySeverity};
use crate::store::{EventFilter, SecurityStore, bounded};

/// Deny decisions for client addresses: a static list of addresses and CIDR
/// ranges, plus a dynamic score from recent high-severity events.
#[derive(Clone)]
pub struct IpReputation {
    store: Arc<dyn SecurityStore>,
    clock: Arc<dyn Clock>,
    auditor: Arc<SecurityAuditor>,
    blacklist: Vec<IpNetwork>,
    threshold: u64,
    window: Duration,
    store_timeout: StdDuration,
}

impl IpReputation {
    pub fn new(
        store: Arc<dyn SecurityStore>,
        clock: Arc<dyn Clock>,
        auditor: Arc<SecurityAuditor>,
        config: &ReputationConfig,
        store_timeout: StdDuration,
    ) -> GuardResult<Self> {
        Ok(Self {
            store,
            clock,
            auditor,
            blacklist: config.parsed_blacklist()?,
            threshold: config.threshold,
            window: Duration::seconds(config.window_seconds),
            store_timeout,
        })
    }

    pub fn is_statically_listed(&self, ip: &str) -> bool {
        ip.parse::<IpAddr>()
            .map(|addr| self.blacklist.iter().any(|net| net.contains(addr)))
            .unwrap_or(false)
    }

    /// Whether `ip` (default: the request's client IP) should be refused.
    ///
    /// The dynamic score fails open: if the event store cannot be read only
    /// the static list applies.
    pub async fn is_blacklisted(&self, ctx: &RequestContext, ip: Option<&str>) -> bool {
        let ip = ip.unwrap_or(&ctx.ip_address);

        if self.is_statically_listed(ip) {
            self.flag(ctx, ip, format!("request from blacklisted address {}", ip))
                .await;
            return true;
        }

        let since = self.clock.now() - self.window;
        let filter = EventFilter::default()
            .since(since)
            .ip_address(ip)
            .min_severity(SecuritySeverity::High);

        let recent = match bounded(self.store_timeout, "count_events", self.store.count_events(&filter)).await {
            Ok(count) => count,
            Err(e) => {
                warn!(ip_address = %ip, error = %e, "IP reputation lookup failed, failing open");
                return false;
            }
        };

        if recent > self.threshold {
            self.flag(
                ctx,
                ip,
                format!(
                    "address {} exceeded reputation threshold: {} high-severity events in {} minutes",
                    ip,
                    recent,
                    self.window.num_minutes()
                ),
            )
            .await;
            return true;
        }

        debug!(ip_address = %ip, recent, threshold = self.threshold, "IP reputation ok");
        false
    }

    async fn flag(&self, ctx: &RequestContext, ip: &str, details: String) {
        let mut event = SecurityEvent::new(SecurityEventType::SuspiciousActivity, SecuritySeverity::Critical, details)
            .at(self.clock.now())
            .with_request_context(ctx);
        event.ip_address = ip.to_string();
        self.auditor.log_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AuditConfig;
    use crate::error::GuardError;
    use crate::store::{MemorySecurityStore, MockSecurityStore};

    fn reputation_with(
        store: Arc<dyn SecurityStore>,
        clock: Arc<ManualClock>,
        blacklist: &[&str],
    ) -> IpReputation {
        let timeout = StdDuration::from_millis(200);
        let auditor = Arc::new(SecurityAuditor::new(
            store.clone(),
            clock.clone(),
            timeout,
            AuditConfig::default(),
        ));
        let config = ReputationConfig {
            blacklist: blacklist.iter().map(|s| s.to_string()).collect(),
            ..ReputationConfig::default()
        };
        IpReputation::new(store, clock, auditor, &config, timeout).unwrap()
    }

    async fn seed_events(store: &MemorySecurityStore, clock: &ManualClock, ip: &str, count: usize) {
        for _ in 0..count {
            let mut event = SecurityEvent::new(
                SecurityEventType::XssAttempt,
                SecuritySeverity::High,
                "fixture".to_string(),
            )
            .at(clock.now());
            event.ip_address = ip.to_string();
            store.insert_event(&event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_static_list_with_cidr() {
        let store = Arc::new(MemorySecurityStore::new());
        let reputation = reputation_with(
            store.clone(),
            Arc::new(ManualClock::default()),
            &["45.33.32.156", "185.220.100.0/22"],
        );
        let ctx = RequestContext::new("45.33.32.156");

        assert!(reputation.is_blacklisted(&ctx, None).await);
        assert!(reputation.is_blacklisted(&ctx, Some("185.220.101.4")).await);
        assert!(!reputation.is_blacklisted(&ctx, Some("185.220.104.1")).await);

        let flagged = store
            .query_events(&EventFilter::default().event_type(SecurityEventType::SuspiciousActivity))
            .await
            .unwrap();
        assert_eq!(flagged.len(), 2);
        assert!(flagged.iter().all(|e| e.severity == SecuritySeverity::Critical));
        assert!(flagged.iter().any(|e| e.ip_address == "185.220.101.4"));
    }

    #[tokio::test]
    async fn test_dynamic_threshold() {
        let store = Arc::new(MemorySecurityStore::new());
        let clock = Arc::new(ManualClock::default());
        let reputation = reputation_with(store.clone(), clock.clone(), &[]);
        let ctx = RequestContext::new("8.8.8.8");

        seed_events(&store, &clock, "9.9.9.9", 10).await;
        assert!(!reputation.is_blacklisted(&ctx, Some("9.9.9.9")).await);

        seed_events(&store, &clock, "1.1.1.1", 11).await;
        assert!(reputation.is_blacklisted(&ctx, Some("1.1.1.1")).await);
    }

    #[tokio::test]
    async fn test_old_events_do_not_count() {
        let store = Arc::new(MemorySecurityStore::new());
        let clock = Arc::new(ManualClock::default());
        let reputation = reputation_with(store.clone(), clock.clone(), &[]);

        seed_events(&store, &clock, "1.0.0.1", 11).await;
        clock.advance(Duration::minutes(61));

        assert!(!reputation.is_blacklisted(&RequestContext::new("1.0.0.1"), None).await);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_but_keeps_static_list() {
        let mut store = MockSecurityStore::new();
        store
            .expect_count_events()
            .returning(|_| Err(GuardError::storage("timeout")));
        store.expect_insert_event().returning(|_| Ok(()));

        let reputation = reputation_with(Arc::new(store), Arc::new(ManualClock::default()), &["6.6.6.0/24"]);
        let ctx = RequestContext::new("7.7.7.7");

        assert!(!reputation.is_blacklisted(&ctx, None).await);
        assert!(reputation.is_blacklisted(&ctx, Some("6.6.6.6")).await);
    }
}
