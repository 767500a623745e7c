use axum::http::HeaderMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::context::{CookieSessionIdentity, IdentityProvider, RequestContext};
use crate::error::{GuardRejection, GuardResult};
use crate::security::audit::{
    CleanupSummary, SecurityAuditor, SecurityEventType, SecurityReport, SecuritySeverity,
};
use crate::security::csrf::{CsrfProtection, CsrfToken};
use crate::security::ip_reputation::IpReputation;
use crate::security::rate_limiting::{RateLimitDecision, RateLimiter};
use crate::security::threat_detection::ThreatDetector;
use crate::security::validation::{InputSanitizer, RejectReason, SanitizeKind};
use crate::store::SecurityStore;

/// One submitted field and the strategy used to clean it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInput {
    pub name: String,
    pub value: String,
    pub kind: SanitizeKind,
}

/// A state-changing request to run through [`SecurityGuard::protect`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardedRequest {
    pub action: String,
    /// Rate limit subject; the client IP is used when absent
    pub identifier: Option<String>,
    /// Form whose CSRF token must be presented; no CSRF check when absent
    pub form_name: Option<String>,
    pub csrf_token: Option<String>,
    pub fields: Vec<FieldInput>,
}

impl GuardedRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn csrf(mut self, form_name: impl Into<String>, token: Option<String>) -> Self {
        self.form_name = Some(form_name.into());
        self.csrf_token = token;
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, kind: SanitizeKind) -> Self {
        self.fields.push(FieldInput {
            name: name.into(),
            value: value.into(),
            kind,
        });
        self
    }
}

/// Facade over the guard components, wired to one store and one clock.
///
/// Construct it once at startup and share it (`Arc<SecurityGuard>`) between
/// request handlers; every per-request input comes in through a
/// [`RequestContext`].
pub struct SecurityGuard {
    config: GuardConfig,
    store: Arc<dyn SecurityStore>,
    auditor: Arc<SecurityAuditor>,
    csrf: CsrfProtection,
    rate_limiter: RateLimiter,
    sanitizer: InputSanitizer,
    reputation: IpReputation,
    identity: Arc<dyn IdentityProvider>,
}

impl SecurityGuard {
    pub fn new(config: GuardConfig, store: Arc<dyn SecurityStore>, clock: Arc<dyn Clock>) -> GuardResult<Self> {
        config.validate()?;

        let store_timeout = Duration::from_millis(config.store.timeout_ms);
        let auditor = Arc::new(SecurityAuditor::new(
            store.clone(),
            clock.clone(),
            store_timeout,
            config.audit.clone(),
        ));
        let csrf = CsrfProtection::new(
            store.clone(),
            clock.clone(),
            auditor.clone(),
            &config.csrf,
            store_timeout,
        );
        let rate_limiter = RateLimiter::new(
            store.clone(),
            clock.clone(),
            auditor.clone(),
            config.rate_limits.clone(),
            store_timeout,
        );
        let sanitizer = InputSanitizer::new(ThreatDetector::default(), auditor.clone());
        let reputation = IpReputation::new(
            store.clone(),
            clock,
            auditor.clone(),
            &config.reputation,
            store_timeout,
        )?;
        let identity = Arc::new(CookieSessionIdentity::new(config.session.cookie_name.clone()));

        info!(
            rate_limited_actions = config.rate_limits.len(),
            blacklist_entries = config.reputation.blacklist.len(),
            trust_proxy_headers = config.client_ip.trust_proxy_headers,
            "Security guard initialized"
        );

        Ok(Self {
            config,
            store,
            auditor,
            csrf,
            rate_limiter,
            sanitizer,
            reputation,
            identity,
        })
    }

    /// Replace the cookie-based session lookup
    pub fn with_identity_provider(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    /// Replace the built-in threat rules
    pub fn with_threat_detector(mut self, detector: ThreatDetector) -> Self {
        self.sanitizer = InputSanitizer::new(detector, self.auditor.clone());
        self
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SecurityStore> {
        &self.store
    }

    pub fn auditor(&self) -> &Arc<SecurityAuditor> {
        &self.auditor
    }

    pub fn csrf(&self) -> &CsrfProtection {
        &self.csrf
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn sanitizer(&self) -> &InputSanitizer {
        &self.sanitizer
    }

    /// Build the per-request context from headers and the socket address
    pub fn context_from_headers(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> RequestContext {
        RequestContext::from_headers(
            headers,
            peer,
            self.config.client_ip.trust_proxy_headers,
            self.identity.as_ref(),
        )
    }

    pub async fn issue_csrf_token(&self, ctx: &RequestContext, form_name: &str) -> GuardResult<CsrfToken> {
        self.csrf.issue(ctx, form_name).await
    }

    /// Hidden form input carrying a fresh token for `form_name`
    pub async fn csrf_field(&self, ctx: &RequestContext, form_name: &str) -> GuardResult<String> {
        self.csrf.csrf_field(ctx, form_name).await
    }

    pub async fn validate_csrf(&self, ctx: &RequestContext, token: &str, form_name: &str) -> bool {
        self.csrf.validate(ctx, token, form_name).await.is_ok()
    }

    pub async fn check_rate_limit(
        &self,
        ctx: &RequestContext,
        action: &str,
        identifier: Option<&str>,
    ) -> RateLimitDecision {
        self.rate_limiter.check(ctx, action, identifier).await
    }

    /// Report an attempt's outcome. Storage errors are logged, never raised.
    pub async fn record_attempt(&self, ctx: &RequestContext, action: &str, identifier: Option<&str>, success: bool) {
        if let Err(e) = self.rate_limiter.record(ctx, action, identifier, success).await {
            warn!(action, success, error = %e, "Failed to record attempt");
        }
    }

    pub async fn sanitize(&self, ctx: &RequestContext, input: &str, kind: SanitizeKind) -> Result<String, RejectReason> {
        self.sanitizer.sanitize(ctx, input, kind).await
    }

    pub async fn sanitize_value(&self, ctx: &RequestContext, value: &Value, kind: SanitizeKind) -> Value {
        self.sanitizer.sanitize_value(ctx, value, kind).await
    }

    pub async fn log_security(
        &self,
        ctx: &RequestContext,
        event_type: SecurityEventType,
        details: impl Into<String>,
        severity: SecuritySeverity,
        actor_id: Option<&str>,
    ) {
        self.auditor.record(ctx, event_type, details, severity, actor_id).await;
    }

    pub async fn is_ip_blacklisted(&self, ctx: &RequestContext, ip: Option<&str>) -> bool {
        self.reputation.is_blacklisted(ctx, ip).await
    }

    /// Apply the retention policy to the event log and attempt counters, and
    /// drop expired CSRF tokens
    pub async fn cleanup_security_logs(&self, retention_days: i64) -> GuardResult<CleanupSummary> {
        let mut summary = self.auditor.cleanup(retention_days).await?;
        summary.expired_csrf_tokens = self.csrf.purge_expired().await?;
        Ok(summary)
    }

    pub async fn get_security_report(&self, days: i64) -> GuardResult<SecurityReport> {
        self.auditor.report(days).await
    }

    /// Run the guarded-action pipeline: rate limit, then CSRF, then input
    /// sanitisation. Returns the cleaned fields by name.
    ///
    /// The caller still reports the business outcome with
    /// [`record_attempt`](Self::record_attempt).
    pub async fn protect(
        &self,
        ctx: &RequestContext,
        request: &GuardedRequest,
    ) -> Result<BTreeMap<String, String>, GuardRejection> {
        let decision = self
            .rate_limiter
            .check(ctx, &request.action, request.identifier.as_deref())
            .await;
        if !decision.allowed {
            return Err(GuardRejection::RateLimited {
                retry_after_secs: decision.retry_after_secs,
            });
        }

        if let Some(form_name) = &request.form_name {
            let token = request.csrf_token.as_deref().unwrap_or_default();
            if self.csrf.validate(ctx, token, form_name).await.is_err() {
                return Err(GuardRejection::InvalidCsrfToken);
            }
        }

        let mut cleaned = BTreeMap::new();
        for field in &request.fields {
            match self.sanitizer.sanitize(ctx, &field.value, field.kind).await {
                Ok(value) => {
                    cleaned.insert(field.name.clone(), value);
                }
                Err(reason) => {
                    debug!(action = %request.action, field = %field.name, reason = %reason, "Field rejected");
                    return Err(GuardRejection::InvalidInput {
                        field: field.name.clone(),
                    });
                }
            }
        }

        Ok(cleaned)
    }

    /// Periodically apply the configured retention every
    /// `audit.cleanup_interval_secs`. The first run happens one interval
    /// after spawning.
    pub fn spawn_cleanup_task(self: Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.audit.cleanup_interval_secs);
        info!(interval_secs = interval.as_secs(), "Starting scheduled security cleanup");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match self.cleanup_security_logs(self.config.audit.retention_days).await {
                    Ok(summary) => debug!(
                        events_deleted = summary.events_deleted,
                        counters_deleted = summary.counters_deleted,
                        expired_csrf_tokens = summary.expired_csrf_tokens,
                        "Scheduled security cleanup finished"
                    ),
                    Err(e) => error!(error = %e, "Scheduled security cleanup failed"),
                }
            }
        })
    }
}
