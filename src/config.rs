use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::GuardError;
use crate::security::rate_limiting::RateLimitPolicy;

/// Environment variable prefix; nested keys are separated by `__`
/// (e.g. `GUARD_STORE__TIMEOUT_MS=250`).
pub const ENV_PREFIX: &str = "GUARD_";

/// Top-level configuration for the request guard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub csrf: CsrfConfig,

    /// Rate-limit policy per action name. Actions missing here are not limited.
    #[serde(default = "default_rate_limits")]
    pub rate_limits: HashMap<String, RateLimitPolicy>,

    #[serde(default)]
    pub reputation: ReputationConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub client_ip: ClientIpConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfConfig {
    /// Token lifetime in seconds (default: 1 hour)
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: i64,

    /// Name of the hidden form field carrying the token
    #[serde(default = "default_field_name")]
    pub field_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationConfig {
    /// Static deny-list; single addresses or CIDR ranges
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// More than this many high/critical events inside the window marks an IP
    #[serde(default = "default_reputation_threshold")]
    pub threshold: u64,

    #[serde(default = "default_reputation_window")]
    pub window_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Interval of the background cleanup job
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    #[serde(default = "default_report_top_ips")]
    pub report_top_ips: usize,

    #[serde(default = "default_report_critical_events")]
    pub report_critical_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIpConfig {
    /// Honour proxy/CDN headers (CF-Connecting-IP, X-Forwarded-For, ...).
    /// Only safe when every request arrives through a trusted proxy.
    #[serde(default = "default_true")]
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// PostgreSQL connection string; the in-memory store is used when absent
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// Upper bound for every individual store call made on the request path
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_true")]
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

fn default_true() -> bool {
    true
}

fn default_token_lifetime() -> i64 {
    3600
}

fn default_field_name() -> String {
    "csrf_token".to_string()
}

fn default_reputation_threshold() -> u64 {
    10
}

fn default_reputation_window() -> i64 {
    3600
}

fn default_retention_days() -> i64 {
    90
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_report_top_ips() -> usize {
    10
}

fn default_report_critical_events() -> usize {
    20
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    2000
}

fn default_store_timeout() -> u64 {
    500
}

fn default_cookie_name() -> String {
    "session_id".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Built-in policies for the application's guarded actions
pub fn default_rate_limits() -> HashMap<String, RateLimitPolicy> {
    let mut limits = HashMap::new();
    limits.insert("login".to_string(), RateLimitPolicy::new(5, 900));
    limits.insert("contact_form".to_string(), RateLimitPolicy::new(3, 300));
    limits.insert("booking".to_string(), RateLimitPolicy::new(10, 600));
    limits.insert("api".to_string(), RateLimitPolicy::new(30, 300));
    limits.insert("password_reset".to_string(), RateLimitPolicy::new(3, 3600));
    limits
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            token_lifetime_secs: default_token_lifetime(),
            field_name: default_field_name(),
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            blacklist: Vec::new(),
            threshold: default_reputation_threshold(),
            window_seconds: default_reputation_window(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval(),
            report_top_ips: default_report_top_ips(),
            report_critical_events: default_report_critical_events(),
        }
    }
}

impl Default for ClientIpConfig {
    fn default() -> Self {
        Self {
            trust_proxy_headers: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout(),
            timeout_ms: default_store_timeout(),
            auto_migrate: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            csrf: CsrfConfig::default(),
            rate_limits: default_rate_limits(),
            reputation: ReputationConfig::default(),
            audit: AuditConfig::default(),
            client_ip: ClientIpConfig::default(),
            store: StoreConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Load configuration: defaults, then an optional TOML file, then
    /// `GUARD_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, GuardError> {
        let mut figment = Figment::from(Serialized::defaults(GuardConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }

        let config: GuardConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| GuardError::config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), GuardError> {
        for (action, policy) in &self.rate_limits {
            if policy.max_attempts == 0 {
                return Err(GuardError::config(format!(
                    "rate_limits.{}.max_attempts must be at least 1",
                    action
                )));
            }
            if policy.window_seconds <= 0 {
                return Err(GuardError::config(format!(
                    "rate_limits.{}.window_seconds must be positive",
                    action
                )));
            }
        }

        if self.csrf.token_lifetime_secs <= 0 {
            return Err(GuardError::config("csrf.token_lifetime_secs must be positive"));
        }

        if self.csrf.field_name.is_empty() {
            return Err(GuardError::config("csrf.field_name cannot be empty"));
        }

        if self.reputation.window_seconds <= 0 {
            return Err(GuardError::config("reputation.window_seconds must be positive"));
        }

        if self.audit.retention_days <= 0 {
            return Err(GuardError::config("audit.retention_days must be positive"));
        }

        if self.audit.cleanup_interval_secs == 0 {
            return Err(GuardError::config("audit.cleanup_interval_secs must be positive"));
        }

        if self.store.timeout_ms == 0 {
            return Err(GuardError::config("store.timeout_ms must be positive"));
        }

        self.reputation.parsed_blacklist()?;

        Ok(())
    }
}

impl ReputationConfig {
    /// Parse deny-list entries; a bare address becomes a host-sized network
    pub fn parsed_blacklist(&self) -> Result<Vec<IpNetwork>, GuardError> {
        self.blacklist
            .iter()
            .map(|entry| {
                entry.trim().parse::<IpNetwork>().map_err(|e| {
                    GuardError::config(format!("invalid blacklist entry '{}': {}", entry, e))
                })
            })
            .collect()
    }
}
