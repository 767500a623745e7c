// CSRF (Cross-Site Request Forgery) Protection Module
// Session-scoped, single-use form tokens held in the shared store

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::CsrfConfig;
use crate::context::RequestContext;
use crate::error::{GuardError, GuardResult};
use crate::security::audit::{SecurityAuditor, SecurityEventType, SecuritySeverity};
use crate::store::{SecurityStore, bounded};

/// Random bytes per token (256 bits)
const TOKEN_BYTES: usize = 32;

/// CSRF token with metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrfToken {
    pub form_name: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CsrfToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Reason a submitted token was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CsrfFailure {
    #[error("no session")]
    NoSession,
    #[error("not found")]
    NotFound,
    #[error("expired")]
    Expired,
    #[error("mismatch")]
    Mismatch,
    #[error("store unavailable")]
    Unavailable,
}

impl CsrfFailure {
    pub fn severity(&self) -> SecuritySeverity {
        match self {
            CsrfFailure::NoSession | CsrfFailure::NotFound | CsrfFailure::Expired => SecuritySeverity::Medium,
            CsrfFailure::Mismatch | CsrfFailure::Unavailable => SecuritySeverity::High,
        }
    }
}

/// CSRF protection manager
#[derive(Clone)]
pub struct CsrfProtection {
    store: Arc<dyn SecurityStore>,
    clock: Arc<dyn Clock>,
    auditor: Arc<SecurityAuditor>,
    /// Token lifetime
    token_lifetime: Duration,
    field_name: String,
    store_timeout: StdDuration,
}

impl CsrfProtection {
    pub fn new(
        store: Arc<dyn SecurityStore>,
        clock: Arc<dyn Clock>,
        auditor: Arc<SecurityAuditor>,
        config: &CsrfConfig,
        store_timeout: StdDuration,
    ) -> Self {
        Self {
            store,
            clock,
            auditor,
            token_lifetime: Duration::seconds(config.token_lifetime_secs),
            field_name: config.field_name.clone(),
            store_timeout,
        }
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Issue a fresh token for `form_name`, replacing any earlier one for the
    /// same session and form
    pub async fn issue(&self, ctx: &RequestContext, form_name: &str) -> GuardResult<CsrfToken> {
        let session_id = ctx.session_id.as_deref().ok_or(GuardError::MissingSession)?;

        let now = self.clock.now();
        let random_data: [u8; TOKEN_BYTES] = rand::random();
        let token = CsrfToken {
            form_name: form_name.to_string(),
            token: URL_SAFE_NO_PAD.encode(random_data),
            created_at: now,
            expires_at: now + self.token_lifetime,
        };

        bounded(
            self.store_timeout,
            "set_csrf_token",
            self.store.set_csrf_token(session_id, form_name, &token),
        )
        .await?;

        debug!(form_name, expires_at = %token.expires_at, "Issued CSRF token");
        Ok(token)
    }

    /// Issue a token and render it as a hidden form input
    pub async fn csrf_field(&self, ctx: &RequestContext, form_name: &str) -> GuardResult<String> {
        let token = self.issue(ctx, form_name).await?;
        Ok(format!(
            r#"<input type="hidden" name="{}" value="{}">"#,
            html_escape::encode_double_quoted_attribute(&self.field_name),
            html_escape::encode_double_quoted_attribute(&token.token)
        ))
    }

    /// Validate and consume a submitted token. Every failure is audited as a
    /// `csrf_violation`; storage problems reject the request.
    pub async fn validate(&self, ctx: &RequestContext, token: &str, form_name: &str) -> Result<(), CsrfFailure> {
        match self.check_token(ctx, token, form_name).await {
            Ok(()) => Ok(()),
            Err(failure) => {
                self.auditor
                    .record(
                        ctx,
                        SecurityEventType::CsrfViolation,
                        format!("CSRF token {} for form '{}'", failure, form_name),
                        failure.severity(),
                        None,
                    )
                    .await;
                Err(failure)
            }
        }
    }

    async fn check_token(&self, ctx: &RequestContext, token: &str, form_name: &str) -> Result<(), CsrfFailure> {
        let session_id = ctx.session_id.as_deref().ok_or(CsrfFailure::NoSession)?;
        let now = self.clock.now();

        let stored = bounded(
            self.store_timeout,
            "get_csrf_token",
            self.store.get_csrf_token(session_id, form_name),
        )
        .await
        .map_err(|e| self.unavailable(form_name, e))?
        .ok_or(CsrfFailure::NotFound)?;

        if stored.is_expired_at(now) {
            // Only remove the row we read; a token reissued meanwhile stays
            if let Err(e) = bounded(
                self.store_timeout,
                "consume_csrf_token",
                self.store.consume_csrf_token(session_id, form_name, &stored.token),
            )
            .await
            {
                warn!(form_name, error = %e, "Failed to delete expired CSRF token");
            }
            return Err(CsrfFailure::Expired);
        }

        if !bool::from(stored.token.as_bytes().ct_eq(token.as_bytes())) {
            return Err(CsrfFailure::Mismatch);
        }

        let consumed = bounded(
            self.store_timeout,
            "consume_csrf_token",
            self.store.consume_csrf_token(session_id, form_name, token),
        )
        .await
        .map_err(|e| self.unavailable(form_name, e))?;

        // Another request consumed it between our read and delete
        if !consumed {
            return Err(CsrfFailure::NotFound);
        }

        debug!(form_name, "CSRF token validated and consumed");
        Ok(())
    }

    fn unavailable(&self, form_name: &str, error: GuardError) -> CsrfFailure {
        warn!(form_name, error = %error, "CSRF token store unavailable, rejecting request");
        CsrfFailure::Unavailable
    }

    /// Remove expired tokens from the store
    pub async fn purge_expired(&self) -> GuardResult<u64> {
        let removed = self.store.purge_expired_csrf_tokens(self.clock.now()).await?;
        if removed > 0 {
            debug!(removed, "Purged expired CSRF tokens");
        }
        Ok(removed)
    }
}
