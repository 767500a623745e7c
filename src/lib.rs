//! Request-time abuse prevention for web applications.
//!
//! [`SecurityGuard`] bundles CSRF tokens, per-action rate limiting with
//! lockout, input sanitisation with XSS/SQL-injection screening, a security
//! audit log and IP reputation over one shared [`SecurityStore`].

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod logging;
pub mod middleware;
pub mod security;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GuardConfig;
pub use context::{CookieSessionIdentity, Identity, IdentityProvider, RequestContext};
pub use error::{GuardError, GuardRejection, GuardResult};
pub use guard::{FieldInput, GuardedRequest, SecurityGuard};
pub use middleware::guard_ingress;
pub use security::{
    RateLimitDecision, RejectReason, SanitizeKind, SecurityEvent, SecurityEventType,
    SecurityReport, SecuritySeverity,
};
pub use store::{MemorySecurityStore, PgSecurityStore, SecurityStore};
