//! Persistence collaborator for the guard.
//!
//! Everything that must be shared between request workers (attempt counters,
//! CSRF tokens, security events) lives behind [`SecurityStore`]. Components
//! keep no authoritative copy of this state in process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

use crate::error::{GuardError, GuardResult};
use crate::security::audit::{IpActivity, SecurityEvent, SecurityEventType, SecuritySeverity};
use crate::security::csrf::CsrfToken;
use crate::security::rate_limiting::AttemptCounter;

pub mod memory;
pub mod postgres;

pub use memory::MemorySecurityStore;
pub use postgres::PgSecurityStore;

/// Unique key of an attempt counter row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttemptKey {
    /// Caller-supplied identifier (e.g. an email), or the client IP when none
    pub identifier: String,
    pub action: String,
}

impl AttemptKey {
    pub fn new(identifier: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            action: action.into(),
        }
    }
}

/// Selection over the security event log. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub since: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub event_type: Option<SecurityEventType>,
    /// Inclusive lower bound on severity
    pub min_severity: Option<SecuritySeverity>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn event_type(mut self, event_type: SecurityEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn min_severity(mut self, severity: SecuritySeverity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &SecurityEvent) -> bool {
        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }
        if let Some(ip) = &self.ip_address
            && &event.ip_address != ip
        {
            return false;
        }
        if let Some(event_type) = self.event_type
            && event.event_type != event_type
        {
            return false;
        }
        if let Some(min) = self.min_severity
            && event.severity < min
        {
            return false;
        }
        true
    }
}

/// Storage operations the guard relies on.
///
/// Implementations must provide:
/// - an atomic upsert-increment for attempt counters (no lost updates under
///   concurrent failed attempts for the same key),
/// - an atomic compare-and-delete for CSRF tokens, so a token can be consumed
///   by at most one request,
/// - append-only event inserts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecurityStore: Send + Sync {
    /// Create the counter with a count of 1, or atomically add one to it.
    /// Returns the counter as stored after the update.
    async fn upsert_increment(
        &self,
        key: &AttemptKey,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> GuardResult<AttemptCounter>;

    async fn get_counter(&self, key: &AttemptKey) -> GuardResult<Option<AttemptCounter>>;

    async fn delete_counter(&self, key: &AttemptKey) -> GuardResult<()>;

    async fn set_block(&self, key: &AttemptKey, until: DateTime<Utc>) -> GuardResult<()>;

    /// Delete counters of `action` that started before `window_start` and are
    /// not blocked at `now`.
    async fn purge_stale_counters(
        &self,
        action: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> GuardResult<u64>;

    /// Delete counters of any action last touched before `cutoff` that are not
    /// blocked at `now`.
    async fn purge_counters_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> GuardResult<u64>;

    async fn insert_event(&self, event: &SecurityEvent) -> GuardResult<()>;

    async fn query_events(&self, filter: &EventFilter) -> GuardResult<Vec<SecurityEvent>>;

    async fn count_events(&self, filter: &EventFilter) -> GuardResult<u64>;

    async fn count_events_by_type(
        &self,
        since: DateTime<Utc>,
    ) -> GuardResult<Vec<(SecurityEventType, u64)>>;

    /// IPs with the most events since `since`, busiest first
    async fn top_ips(&self, since: DateTime<Utc>, limit: usize) -> GuardResult<Vec<IpActivity>>;

    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> GuardResult<u64>;

    /// Store a token, replacing any previous one for the same session and form
    async fn set_csrf_token(
        &self,
        session_id: &str,
        form_name: &str,
        token: &CsrfToken,
    ) -> GuardResult<()>;

    async fn get_csrf_token(
        &self,
        session_id: &str,
        form_name: &str,
    ) -> GuardResult<Option<CsrfToken>>;

    /// Delete the stored token only if it still equals `token`.
    /// Returns whether this call removed it.
    async fn consume_csrf_token(
        &self,
        session_id: &str,
        form_name: &str,
        token: &str,
    ) -> GuardResult<bool>;

    async fn purge_expired_csrf_tokens(&self, now: DateTime<Utc>) -> GuardResult<u64>;
}

/// Run a store call with an upper bound on its duration
pub(crate) async fn bounded<T, F>(
    timeout: Duration,
    operation: &'static str,
    future: F,
) -> GuardResult<T>
where
    F: Future<Output = GuardResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(GuardError::Timeout {
            operation,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn event(ip: &str, severity: SecuritySeverity, age_minutes: i64) -> SecurityEvent {
        let mut event = SecurityEvent::new(SecurityEventType::RateLimit, severity, "test".to_string());
        event.ip_address = ip.to_string();
        event.created_at = Utc::now() - ChronoDuration::minutes(age_minutes);
        event
    }

    #[test]
    fn test_event_filter_matching() {
        let since = Utc::now() - ChronoDuration::hours(1);
        let filter = EventFilter::default()
            .since(since)
            .ip_address("203.0.113.9")
            .min_severity(SecuritySeverity::High);

        assert!(filter.matches(&event("203.0.113.9", SecuritySeverity::High, 5)));
        assert!(filter.matches(&event("203.0.113.9", SecuritySeverity::Critical, 5)));
        assert!(!filter.matches(&event("203.0.113.9", SecuritySeverity::Medium, 5)));
        assert!(!filter.matches(&event("203.0.113.10", SecuritySeverity::High, 5)));
        assert!(!filter.matches(&event("203.0.113.9", SecuritySeverity::High, 120)));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: GuardResult<()> = bounded(Duration::from_millis(10), "slow_op", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(GuardError::Timeout {
                operation: "slow_op",
                timeout_ms: 10
            })
        ));
    }
}
