use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::AuditConfig;
use crate::context::RequestContext;
use crate::error::{GuardError, GuardResult};
use crate::store::{EventFilter, SecurityStore, bounded};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    LoginAttempt,
    CsrfViolation,
    RateLimit,
    XssAttempt,
    SqlInjection,
    FileAccess,
    SuspiciousActivity,
}

impl SecurityEventType {
    pub const ALL: [SecurityEventType; 7] = [
        SecurityEventType::LoginAttempt,
        SecurityEventType::CsrfViolation,
        SecurityEventType::RateLimit,
        SecurityEventType::XssAttempt,
        SecurityEventType::SqlInjection,
        SecurityEventType::FileAccess,
        SecurityEventType::SuspiciousActivity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::LoginAttempt => "login_attempt",
            SecurityEventType::CsrfViolation => "csrf_violation",
            SecurityEventType::RateLimit => "rate_limit",
            SecurityEventType::XssAttempt => "xss_attempt",
            SecurityEventType::SqlInjection => "sql_injection",
            SecurityEventType::FileAccess => "file_access",
            SecurityEventType::SuspiciousActivity => "suspicious_activity",
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityEventType {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SecurityEventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| GuardError::storage(format!("unknown security event type '{}'", s)))
    }
}

/// Ordered from least to most severe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SecuritySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl SecuritySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecuritySeverity::Low => "low",
            SecuritySeverity::Medium => "medium",
            SecuritySeverity::High => "high",
            SecuritySeverity::Critical => "critical",
        }
    }

    /// Numeric rank used for range filters in storage
    pub fn rank(&self) -> i16 {
        match self {
            SecuritySeverity::Low => 0,
            SecuritySeverity::Medium => 1,
            SecuritySeverity::High => 2,
            SecuritySeverity::Critical => 3,
        }
    }
}

impl fmt::Display for SecuritySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecuritySeverity {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(SecuritySeverity::Low),
            "medium" => Ok(SecuritySeverity::Medium),
            "high" => Ok(SecuritySeverity::High),
            "critical" => Ok(SecuritySeverity::Critical),
            other => Err(GuardError::storage(format!("unknown severity '{}'", other))),
        }
    }
}

/// Immutable audit record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub actor_id: Option<String>,
    pub details: String,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, severity: SecuritySeverity, details: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            event_type,
            severity,
            ip_address: "unknown".to_string(),
            user_agent: None,
            actor_id: None,
            details,
        }
    }

    pub fn with_request_context(mut self, ctx: &RequestContext) -> Self {
        self.ip_address = ctx.ip_address.clone();
        self.user_agent = ctx.user_agent.clone();
        self.actor_id = ctx.actor_id.clone();
        self
    }

    pub fn with_actor(mut self, actor_id: Option<String>) -> Self {
        if actor_id.is_some() {
            self.actor_id = actor_id;
        }
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpActivity {
    pub ip_address: String,
    pub event_count: u64,
}

/// Aggregate view over a trailing window of the audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityReport {
    pub window_days: i64,
    pub generated_at: DateTime<Utc>,
    pub events_by_type: BTreeMap<SecurityEventType, u64>,
    pub top_ips: Vec<IpActivity>,
    /// Newest first
    pub critical_events: Vec<SecurityEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupSummary {
    pub events_deleted: u64,
    pub counters_deleted: u64,
    pub expired_csrf_tokens: u64,
}

/// Append-only security audit log backed by the shared store.
///
/// Every event is mirrored to `tracing`; critical events also raise an alert
/// on the `security_alert` target before the store write is attempted.
#[derive(Clone)]
pub struct SecurityAuditor {
    store: Arc<dyn SecurityStore>,
    clock: Arc<dyn Clock>,
    store_timeout: StdDuration,
    config: AuditConfig,
}

impl SecurityAuditor {
    pub fn new(
        store: Arc<dyn SecurityStore>,
        clock: Arc<dyn Clock>,
        store_timeout: StdDuration,
        config: AuditConfig,
    ) -> Self {
        Self {
            store,
            clock,
            store_timeout,
            config,
        }
    }

    /// Log a security event. Never fails: a store error is written to the
    /// process log instead.
    pub async fn log_event(&self, event: SecurityEvent) {
        match event.severity {
            SecuritySeverity::Low => {
                info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    ip_address = %event.ip_address,
                    actor_id = ?event.actor_id,
                    details = %event.details,
                    "Security event logged"
                );
            }
            SecuritySeverity::Medium => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    ip_address = %event.ip_address,
                    actor_id = ?event.actor_id,
                    details = %event.details,
                    "Security warning logged"
                );
            }
            SecuritySeverity::High | SecuritySeverity::Critical => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    severity = %event.severity,
                    ip_address = %event.ip_address,
                    user_agent = ?event.user_agent,
                    actor_id = ?event.actor_id,
                    details = %event.details,
                    "Critical security event logged"
                );
            }
        }

        if event.severity == SecuritySeverity::Critical {
            self.send_alert(&event);
        }

        if let Err(e) = bounded(self.store_timeout, "insert_event", self.store.insert_event(&event)).await {
            error!(
                event_id = %event.id,
                event_type = %event.event_type,
                severity = %event.severity,
                ip_address = %event.ip_address,
                details = %event.details,
                error = %e,
                "Failed to persist security event"
            );
        }
    }

    /// Record an event for the current request. `actor_id` overrides the
    /// actor carried by the context.
    pub async fn record(
        &self,
        ctx: &RequestContext,
        event_type: SecurityEventType,
        details: impl Into<String>,
        severity: SecuritySeverity,
        actor_id: Option<&str>,
    ) {
        let event = SecurityEvent::new(event_type, severity, details.into())
            .at(self.clock.now())
            .with_request_context(ctx)
            .with_actor(actor_id.map(str::to_string));

        self.log_event(event).await;
    }

    /// Aggregate the trailing `days` of the log
    pub async fn report(&self, days: i64) -> GuardResult<SecurityReport> {
        if days < 1 {
            return Err(GuardError::config("report window must be at least one day"));
        }

        let now = self.clock.now();
        let since = now - Duration::days(days);

        let events_by_type = self
            .store
            .count_events_by_type(since)
            .await?
            .into_iter()
            .collect::<BTreeMap<_, _>>();

        let top_ips = self.store.top_ips(since, self.config.report_top_ips).await?;

        let critical_events = self
            .store
            .query_events(
                &EventFilter::default()
                    .since(since)
                    .min_severity(SecuritySeverity::Critical)
                    .limit(self.config.report_critical_events),
            )
            .await?;

        Ok(SecurityReport {
            window_days: days,
            generated_at: now,
            events_by_type,
            top_ips,
            critical_events,
        })
    }

    /// Purge events and unblocked attempt counters older than the retention
    /// window. Active blocks are kept whatever their age.
    pub async fn cleanup(&self, retention_days: i64) -> GuardResult<CleanupSummary> {
        if retention_days < 1 {
            return Err(GuardError::config("retention must be at least one day"));
        }

        let now = self.clock.now();
        let cutoff = now - Duration::days(retention_days);

        let events_deleted = self.store.purge_events_before(cutoff).await?;
        let counters_deleted = self.store.purge_counters_before(cutoff, now).await?;

        info!(
            retention_days,
            events_deleted, counters_deleted, "Security log cleanup finished"
        );

        Ok(CleanupSummary {
            events_deleted,
            counters_deleted,
            expired_csrf_tokens: 0,
        })
    }

    /// Surface a critical event to on-call tooling immediately
    fn send_alert(&self, event: &SecurityEvent) {
        error!(
            target: "security_alert",
            event_id = %event.id,
            event_type = %event.event_type,
            ip_address = %event.ip_address,
            "CRITICAL SECURITY ALERT: {}",
            event.details
        );
    }
}

/// Record an event through an auditor using the request context
#[macro_export]
macro_rules! log_security_event {
    ($auditor:expr, $ctx:expr, $event_type:expr, $severity:expr, $details:expr) => {
        $auditor
            .record($ctx, $event_type, $details, $severity, None)
            .await
    };
}
