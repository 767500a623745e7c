// Rate Limiting Module
// Sliding-window attempt counting with temporary lockout, keyed per
// (subject, action) in the shared store

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::context::RequestContext;
use crate::error::{GuardResult, too_many_attempts_message};
use crate::security::audit::{SecurityAuditor, SecurityEventType, SecuritySeverity};
use crate::store::{AttemptKey, SecurityStore, bounded};

/// Attempt budget for one action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Attempts tolerated inside the window before the subject is blocked
    pub max_attempts: u32,
    /// Window length, also used as the block duration
    pub window_seconds: i64,
}

impl RateLimitPolicy {
    pub fn new(max_attempts: u32, window_seconds: i64) -> Self {
        Self {
            max_attempts,
            window_seconds,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_seconds)
    }
}

/// Stored failure counter for a (subject, action) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCounter {
    pub ip_address: String,
    pub identifier: String,
    pub action: String,
    pub attempts_count: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
}

impl AttemptCounter {
    pub fn key(&self) -> AttemptKey {
        AttemptKey::new(self.identifier.clone(), self.action.clone())
    }

    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Seconds until the subject may retry; zero when allowed
    pub retry_after_secs: i64,
    pub blocked_until: Option<DateTime<Utc>>,
    /// Failed attempts currently counted in the window
    pub attempts: u32,
}

impl RateLimitDecision {
    pub fn allow(attempts: u32) -> Self {
        Self {
            allowed: true,
            retry_after_secs: 0,
            blocked_until: None,
            attempts,
        }
    }

    pub fn deny(until: DateTime<Utc>, now: DateTime<Utc>, attempts: u32) -> Self {
        Self {
            allowed: false,
            retry_after_secs: (until - now).num_seconds().max(1),
            blocked_until: Some(until),
            attempts,
        }
    }

    /// Generic message suitable for the end user, only set when denied
    pub fn message(&self) -> Option<String> {
        (!self.allowed).then(|| too_many_attempts_message(self.retry_after_secs))
    }
}

/// Abuse guard for named actions.
///
/// Callers `check` before performing an action and `record` its outcome
/// afterwards. Failures accumulate per subject (the supplied identifier, or
/// the client IP) until the action's budget is spent, after which the subject
/// is blocked for one window. Storage problems never lock users out: `check`
/// fails open.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SecurityStore>,
    clock: Arc<dyn Clock>,
    auditor: Arc<SecurityAuditor>,
    policies: HashMap<String, RateLimitPolicy>,
    store_timeout: StdDuration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn SecurityStore>,
        clock: Arc<dyn Clock>,
        auditor: Arc<SecurityAuditor>,
        policies: HashMap<String, RateLimitPolicy>,
        store_timeout: StdDuration,
    ) -> Self {
        Self {
            store,
            clock,
            auditor,
            policies,
            store_timeout,
        }
    }

    pub fn policy(&self, action: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(action)
    }

    /// Decide whether `action` may proceed for this subject
    pub async fn check(
        &self,
        ctx: &RequestContext,
        action: &str,
        identifier: Option<&str>,
    ) -> RateLimitDecision {
        let Some(policy) = self.policies.get(action).copied() else {
            debug!(action, "No rate limit policy configured, allowing");
            return RateLimitDecision::allow(0);
        };

        let key = attempt_key(ctx, action, identifier);
        match self.evaluate(ctx, &key, policy).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    action,
                    identifier = %key.identifier,
                    ip_address = %ctx.ip_address,
                    error = %e,
                    "Rate limit check failed, failing open"
                );
                self.auditor
                    .record(
                        ctx,
                        SecurityEventType::SuspiciousActivity,
                        format!("rate limiting degraded, failing open for action '{}'", action),
                        SecuritySeverity::Medium,
                        None,
                    )
                    .await;
                RateLimitDecision::allow(0)
            }
        }
    }

    async fn evaluate(
        &self,
        ctx: &RequestContext,
        key: &AttemptKey,
        policy: RateLimitPolicy,
    ) -> GuardResult<RateLimitDecision> {
        let now = self.clock.now();
        let window_start = now - policy.window();

        let purged = bounded(
            self.store_timeout,
            "purge_stale_counters",
            self.store.purge_stale_counters(&key.action, window_start, now),
        )
        .await?;
        if purged > 0 {
            debug!(action = %key.action, purged, "Purged stale attempt counters");
        }

        let Some(counter) = bounded(self.store_timeout, "get_counter", self.store.get_counter(key)).await?
        else {
            return Ok(RateLimitDecision::allow(0));
        };

        if let Some(until) = counter.blocked_until {
            if until > now {
                let decision = RateLimitDecision::deny(until, now, counter.attempts_count);
                self.auditor
                    .record(
                        ctx,
                        SecurityEventType::RateLimit,
                        format!(
                            "blocked request for action '{}', {} seconds remaining",
                            key.action, decision.retry_after_secs
                        ),
                        SecuritySeverity::Medium,
                        None,
                    )
                    .await;
                return Ok(decision);
            }

            // Block served: start from a clean slate
            bounded(self.store_timeout, "delete_counter", self.store.delete_counter(key)).await?;
            debug!(action = %key.action, identifier = %key.identifier, "Lockout expired, counter cleared");
            return Ok(RateLimitDecision::allow(0));
        }

        if counter.attempts_count >= policy.max_attempts {
            let until = now + policy.window();
            bounded(self.store_timeout, "set_block", self.store.set_block(key, until)).await?;
            self.auditor
                .record(
                    ctx,
                    SecurityEventType::RateLimit,
                    format!(
                        "rate limit exceeded for action '{}' after {} attempts, blocked until {}",
                        key.action,
                        counter.attempts_count,
                        until.to_rfc3339()
                    ),
                    SecuritySeverity::High,
                    None,
                )
                .await;
            return Ok(RateLimitDecision::deny(until, now, counter.attempts_count));
        }

        Ok(RateLimitDecision::allow(counter.attempts_count))
    }

    /// Report the outcome of an attempt. Success resets the subject's counter,
    /// failure adds one to it.
    pub async fn record(
        &self,
        ctx: &RequestContext,
        action: &str,
        identifier: Option<&str>,
        success: bool,
    ) -> GuardResult<()> {
        let Some(policy) = self.policies.get(action).copied() else {
            return Ok(());
        };

        let key = attempt_key(ctx, action, identifier);

        if success {
            bounded(self.store_timeout, "delete_counter", self.store.delete_counter(&key)).await?;
            debug!(action, identifier = %key.identifier, "Attempt succeeded, counter reset");
            return Ok(());
        }

        let now = self.clock.now();
        bounded(
            self.store_timeout,
            "purge_stale_counters",
            self.store.purge_stale_counters(action, now - policy.window(), now),
        )
        .await?;

        let counter = bounded(
            self.store_timeout,
            "upsert_increment",
            self.store.upsert_increment(&key, &ctx.ip_address, now),
        )
        .await?;

        debug!(
            action,
            identifier = %key.identifier,
            attempts = counter.attempts_count,
            max_attempts = policy.max_attempts,
            "Failed attempt recorded"
        );
        Ok(())
    }
}

/// Longest subject stored in a counter key
pub const MAX_SUBJECT_CHARS: usize = 255;

/// Counters are keyed by the caller-supplied identifier when there is one,
/// otherwise by the client IP. Oversized identifiers are cut to
/// [`MAX_SUBJECT_CHARS`] so they still land in a countable key.
fn attempt_key(ctx: &RequestContext, action: &str, identifier: Option<&str>) -> AttemptKey {
    let subject = identifier
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .unwrap_or(&ctx.ip_address);
    let subject = match subject.char_indices().nth(MAX_SUBJECT_CHARS) {
        Some((end, _)) => &subject[..end],
        None => subject,
    };
    AttemptKey::new(subject, action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AuditConfig, default_rate_limits};
    use crate::error::GuardError;
    use crate::store::{EventFilter, MemorySecurityStore, MockSecurityStore};

    fn limiter_with(store: Arc<dyn SecurityStore>, clock: Arc<ManualClock>) -> RateLimiter {
        let timeout = StdDuration::from_millis(200);
        let auditor = Arc::new(SecurityAuditor::new(
            store.clone(),
            clock.clone(),
            timeout,
            AuditConfig::default(),
        ));
        RateLimiter::new(store, clock, auditor, default_rate_limits(), timeout)
    }

    #[tokio::test]
    async fn test_fifth_failure_blocks_login() {
        let store = Arc::new(MemorySecurityStore::new());
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter_with(store.clone(), clock.clone());
        let ctx = RequestContext::new("198.51.100.7");

        for _ in 0..4 {
            assert!(limiter.check(&ctx, "login", Some("a@example.com")).await.allowed);
            limiter.record(&ctx, "login", Some("a@example.com"), false).await.unwrap();
        }
        assert!(limiter.check(&ctx, "login", Some("a@example.com")).await.allowed);
        limiter.record(&ctx, "login", Some("a@example.com"), false).await.unwrap();

        let decision = limiter.check(&ctx, "login", Some("a@example.com")).await;
        assert!(!decision.allowed);
        assert_eq!(decision.blocked_until, Some(clock.now() + Duration::seconds(900)));
        assert_eq!(decision.retry_after_secs, 900);
        assert_eq!(
            decision.message().as_deref(),
            Some("Too many attempts, try again in 15 minutes")
        );

        // A different subject is unaffected
        assert!(limiter.check(&ctx, "login", Some("b@example.com")).await.allowed);

        let events = store
            .query_events(&EventFilter::default().event_type(SecurityEventType::RateLimit))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, SecuritySeverity::High);
    }

    #[tokio::test]
    async fn test_block_lapses_after_window() {
        let store = Arc::new(MemorySecurityStore::new());
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter_with(store.clone(), clock.clone());
        let ctx = RequestContext::new("198.51.100.8");

        for _ in 0..3 {
            limiter.record(&ctx, "contact_form", None, false).await.unwrap();
        }
        assert!(!limiter.check(&ctx, "contact_form", None).await.allowed);

        clock.advance(Duration::seconds(120));
        let decision = limiter.check(&ctx, "contact_form", None).await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, 180);

        clock.advance(Duration::seconds(181));
        let decision = limiter.check(&ctx, "contact_form", None).await;
        assert!(decision.allowed);
        assert_eq!(decision.attempts, 0);
        assert!(
            store
                .get_counter(&AttemptKey::new("198.51.100.8", "contact_form"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let store = Arc::new(MemorySecurityStore::new());
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter_with(store.clone(), clock);
        let ctx = RequestContext::new("198.51.100.9");

        for _ in 0..4 {
            limiter.record(&ctx, "login", Some("c@example.com"), false).await.unwrap();
        }
        assert_eq!(limiter.check(&ctx, "login", Some("c@example.com")).await.attempts, 4);

        limiter.record(&ctx, "login", Some("c@example.com"), true).await.unwrap();
        let decision = limiter.check(&ctx, "login", Some("c@example.com")).await;
        assert!(decision.allowed);
        assert_eq!(decision.attempts, 0);
    }

    #[tokio::test]
    async fn test_stale_failures_fall_out_of_window() {
        let store = Arc::new(MemorySecurityStore::new());
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter_with(store, clock.clone());
        let ctx = RequestContext::new("198.51.100.10");

        for _ in 0..4 {
            limiter.record(&ctx, "login", None, false).await.unwrap();
        }
        clock.advance(Duration::seconds(901));
        limiter.record(&ctx, "login", None, false).await.unwrap();

        let decision = limiter.check(&ctx, "login", None).await;
        assert!(decision.allowed);
        assert_eq!(decision.attempts, 1);
    }

    #[tokio::test]
    async fn test_unconfigured_action_is_always_allowed() {
        let store = Arc::new(MemorySecurityStore::new());
        let limiter = limiter_with(store.clone(), Arc::new(ManualClock::default()));
        let ctx = RequestContext::new("198.51.100.11");

        for _ in 0..50 {
            limiter.record(&ctx, "newsletter", None, false).await.unwrap();
        }
        assert!(limiter.check(&ctx, "newsletter", None).await.allowed);
        assert!(
            store
                .get_counter(&AttemptKey::new("198.51.100.11", "newsletter"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let mut store = MockSecurityStore::new();
        store
            .expect_purge_stale_counters()
            .returning(|_, _, _| Err(GuardError::storage("connection refused")));
        store.expect_insert_event().times(1).returning(|event| {
            assert_eq!(event.event_type, SecurityEventType::SuspiciousActivity);
            assert!(event.details.contains("failing open"));
            Ok(())
        });

        let limiter = limiter_with(Arc::new(store), Arc::new(ManualClock::default()));
        let decision = limiter
            .check(&RequestContext::new("198.51.100.12"), "login", Some("d@example.com"))
            .await;
        assert!(decision.allowed);
        assert_eq!(decision.message(), None);
    }

    #[tokio::test]
    async fn test_oversized_identifier_is_still_limited() {
        let store = Arc::new(MemorySecurityStore::new());
        let limiter = limiter_with(store.clone(), Arc::new(ManualClock::default()));
        let ctx = RequestContext::new("198.51.100.14");
        let long_email = format!("{}@example.com", "ä".repeat(400));

        for _ in 0..3 {
            limiter.record(&ctx, "contact_form", Some(&long_email), false).await.unwrap();
        }
        assert!(!limiter.check(&ctx, "contact_form", Some(&long_email)).await.allowed);

        let key = attempt_key(&ctx, "contact_form", Some(&long_email));
        assert_eq!(key.identifier.chars().count(), MAX_SUBJECT_CHARS);
        assert_eq!(store.get_counter(&key).await.unwrap().unwrap().attempts_count, 3);
    }

    #[tokio::test]
    async fn test_identifier_counter_is_shared_across_ips() {
        let store = Arc::new(MemorySecurityStore::new());
        let limiter = limiter_with(store, Arc::new(ManualClock::default()));

        for octet in 1..=5 {
            let ctx = RequestContext::new(format!("203.0.113.{}", octet));
            limiter.record(&ctx, "login", Some("victim@example.com"), false).await.unwrap();
        }

        // The lockout follows the identifier, whichever address asks
        let elsewhere = RequestContext::new("198.51.100.99");
        assert!(!limiter.check(&elsewhere, "login", Some("victim@example.com")).await.allowed);
        assert!(limiter.check(&elsewhere, "login", None).await.allowed);
    }

    #[test]
    fn test_blank_identifier_falls_back_to_ip() {
        let ctx = RequestContext::new("198.51.100.13");
        assert_eq!(attempt_key(&ctx, "login", Some("  ")).identifier, "198.51.100.13");
        assert_eq!(attempt_key(&ctx, "login", None).identifier, "198.51.100.13");
        assert_eq!(attempt_key(&ctx, "login", Some("e@example.com")).identifier, "e@example.com");
    }
}
