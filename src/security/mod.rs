pub mod audit;
pub mod client_ip;
pub mod csrf;
pub mod ip_reputation;
pub mod rate_limiting;
pub mod threat_detection;
pub mod validation;

pub use audit::{
    CleanupSummary, IpActivity, SecurityAuditor, SecurityEvent, SecurityEventType,
    SecurityReport, SecuritySeverity,
};
pub use client_ip::resolve_client_ip;
pub use csrf::{CsrfFailure, CsrfProtection, CsrfToken};
pub use ip_reputation::IpReputation;
pub use rate_limiting::{AttemptCounter, RateLimitDecision, RateLimitPolicy, RateLimiter};
pub use threat_detection::{ThreatCategory, ThreatDetector, ThreatMatch, ThreatRule};
pub use validation::{InputSanitizer, RejectReason, SanitizeKind};

// Re-export convenience macros
pub use crate::log_security_event;
