use html_escape::encode_safe;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use super::audit::SecurityAuditor;
use super::threat_detection::{ThreatCategory, ThreatDetector, ThreatMatch};
use crate::context::RequestContext;

lazy_static! {
    static ref EMAIL_PATTERN: Regex = Regex::new(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$"
    )
    .expect("Valid regex pattern for email validation");
    static ref HTML_TAG: Regex = Regex::new(r"(?s)<!--.*?-->|<(/?)([a-zA-Z][a-zA-Z0-9]*)\b[^>]*>")
        .expect("Valid regex pattern for HTML tags");
    static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("Valid regex pattern for whitespace");
}

/// Tags kept by the `html` strategy; attributes are always dropped
const ALLOWED_HTML_TAGS: &[&str] = &[
    "p", "br", "b", "strong", "i", "em", "u", "ul", "ol", "li", "blockquote",
];

const MAX_EMAIL_LENGTH: usize = 254;
const MIN_PHONE_DIGITS: usize = 6;
const MAX_PHONE_DIGITS: usize = 20;

/// Sanitisation strategy for a form field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanitizeKind {
    String,
    Email,
    Phone,
    Name,
    Alphanumeric,
    Integer,
    Float,
    Url,
    Html,
}

impl SanitizeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SanitizeKind::String => "string",
            SanitizeKind::Email => "email",
            SanitizeKind::Phone => "phone",
            SanitizeKind::Name => "name",
            SanitizeKind::Alphanumeric => "alphanumeric",
            SanitizeKind::Integer => "integer",
            SanitizeKind::Float => "float",
            SanitizeKind::Url => "url",
            SanitizeKind::Html => "html",
        }
    }

    /// Apply this strategy's allow-list transform. Pure: no threat screening
    /// and no logging.
    pub fn apply(&self, input: &str) -> Result<String, RejectReason> {
        let input = input.trim();
        match self {
            SanitizeKind::String => Ok(encode_safe(&strip_control(input)).into_owned()),
            SanitizeKind::Email => clean_email(input),
            SanitizeKind::Phone => clean_phone(input),
            SanitizeKind::Name => Ok(clean_name(input)),
            SanitizeKind::Alphanumeric => Ok(input.chars().filter(|c| c.is_ascii_alphanumeric()).collect()),
            SanitizeKind::Integer => clean_integer(input),
            SanitizeKind::Float => clean_float(input),
            SanitizeKind::Url => clean_url(input),
            SanitizeKind::Html => Ok(clean_html(&strip_control(input))),
        }
    }
}

impl fmt::Display for SanitizeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SanitizeKind {
    type Err = RejectReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(SanitizeKind::String),
            "email" => Ok(SanitizeKind::Email),
            "phone" => Ok(SanitizeKind::Phone),
            "name" => Ok(SanitizeKind::Name),
            "alphanumeric" => Ok(SanitizeKind::Alphanumeric),
            "integer" | "int" => Ok(SanitizeKind::Integer),
            "float" => Ok(SanitizeKind::Float),
            "url" => Ok(SanitizeKind::Url),
            "html" => Ok(SanitizeKind::Html),
            other => Err(RejectReason::UnknownKind(other.to_string())),
        }
    }
}

/// Why a value was not accepted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("value is not a valid {0}")]
    InvalidFormat(SanitizeKind),

    #[error("{category} pattern detected by rule '{rule}'")]
    Threat { category: ThreatCategory, rule: String },

    #[error("unknown sanitize kind '{0}'")]
    UnknownKind(String),
}

impl RejectReason {
    /// Value that replaces a rejected field in structured input: `false` for
    /// a format failure, an empty string when a threat was detected
    pub fn replacement(&self) -> Value {
        match self {
            RejectReason::Threat { .. } => Value::String(String::new()),
            RejectReason::InvalidFormat(_) | RejectReason::UnknownKind(_) => Value::Bool(false),
        }
    }

    pub fn is_threat(&self) -> bool {
        matches!(self, RejectReason::Threat { .. })
    }
}

fn strip_control(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

fn clean_email(input: &str) -> Result<String, RejectReason> {
    let filtered: String = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || "!#$%&'*+-=?^_`{|}~@.[]".contains(*c))
        .collect();

    let local_ok = filtered
        .split_once('@')
        .map(|(local, _)| !local.starts_with('.') && !local.ends_with('.') && !local.contains(".."))
        .unwrap_or(false);

    if filtered.len() > MAX_EMAIL_LENGTH || !local_ok || !EMAIL_PATTERN.is_match(&filtered) {
        return Err(RejectReason::InvalidFormat(SanitizeKind::Email));
    }
    Ok(filtered)
}

fn clean_phone(input: &str) -> Result<String, RejectReason> {
    let filtered: String = input
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')' | '.'))
        .collect();
    let filtered = WHITESPACE.replace_all(filtered.trim(), " ").into_owned();

    let digits = filtered.chars().filter(|c| c.is_ascii_digit()).count();
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits) {
        return Err(RejectReason::InvalidFormat(SanitizeKind::Phone));
    }
    Ok(filtered)
}

fn clean_name(input: &str) -> String {
    let filtered: String = input
        .chars()
        .filter(|c| c.is_alphabetic() || matches!(c, ' ' | '-' | '\'' | '\u{2019}'))
        .collect();
    let collapsed = WHITESPACE.replace_all(filtered.trim(), " ");
    encode_safe(&collapsed).into_owned()
}

fn clean_integer(input: &str) -> Result<String, RejectReason> {
    let filtered: String = input
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '+' | '-'))
        .collect();
    filtered
        .parse::<i64>()
        .map(|n| n.to_string())
        .map_err(|_| RejectReason::InvalidFormat(SanitizeKind::Integer))
}

fn clean_float(input: &str) -> Result<String, RejectReason> {
    let filtered: String = input
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
        .collect();
    match filtered.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(n.to_string()),
        _ => Err(RejectReason::InvalidFormat(SanitizeKind::Float)),
    }
}

fn clean_url(input: &str) -> Result<String, RejectReason> {
    let url = url::Url::parse(input).map_err(|_| RejectReason::InvalidFormat(SanitizeKind::Url))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(RejectReason::InvalidFormat(SanitizeKind::Url));
    }
    Ok(url.to_string())
}

/// Keep allow-listed tags (without attributes), drop every other tag and
/// comment, escape all text in between. The result is always balanced: stray
/// closing tags are dropped and unclosed tags are closed.
fn clean_html(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut open: Vec<String> = Vec::new();
    let mut last = 0;

    for caps in HTML_TAG.captures_iter(input) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        output.push_str(&encode_safe(&input[last..whole.start()]));
        last = whole.end();

        let Some(name) = caps.get(2) else {
            continue;
        };
        let tag = name.as_str().to_ascii_lowercase();
        if !ALLOWED_HTML_TAGS.contains(&tag.as_str()) {
            continue;
        }

        let closing = caps.get(1).is_some_and(|c| !c.as_str().is_empty());
        if tag == "br" {
            output.push_str("<br>");
        } else if closing {
            let Some(depth) = open.iter().rposition(|t| *t == tag) else {
                continue;
            };
            for inner in open.drain(depth..).rev() {
                output.push_str(&format!("</{}>", inner));
            }
        } else {
            output.push_str(&format!("<{}>", tag));
            open.push(tag);
        }
    }

    output.push_str(&encode_safe(&input[last..]));
    for tag in open.iter().rev() {
        output.push_str(&format!("</{}>", tag));
    }
    output
}

/// Type-aware input sanitiser with heuristic threat screening.
///
/// Every value is screened before and after its kind-specific transform. A
/// detection is audited at the rule's severity and the value is replaced, never
/// passed through in any form.
#[derive(Clone)]
pub struct InputSanitizer {
    detector: ThreatDetector,
    auditor: Arc<SecurityAuditor>,
}

impl InputSanitizer {
    pub fn new(detector: ThreatDetector, auditor: Arc<SecurityAuditor>) -> Self {
        Self { detector, auditor }
    }

    pub fn detector(&self) -> &ThreatDetector {
        &self.detector
    }

    /// Screen and transform a single value without side effects
    pub fn clean(&self, input: &str, kind: SanitizeKind) -> Result<String, RejectReason> {
        self.screen(input)?;
        let cleaned = kind.apply(input)?;
        self.screen(&cleaned)?;
        Ok(cleaned)
    }

    /// Sanitise a single value, auditing any detected threat
    pub async fn sanitize(
        &self,
        ctx: &RequestContext,
        input: &str,
        kind: SanitizeKind,
    ) -> Result<String, RejectReason> {
        if let Some(found) = self.detector.scan(input) {
            self.report_threat(ctx, kind, &found).await;
            return Err(threat_reason(&found));
        }

        let cleaned = kind.apply(input)?;

        if let Some(found) = self.detector.scan(&cleaned) {
            self.report_threat(ctx, kind, &found).await;
            return Err(threat_reason(&found));
        }

        Ok(cleaned)
    }

    /// Sanitise structured input. Arrays and objects are walked recursively
    /// and keep their shape; strings are sanitised, other scalars pass through.
    /// Rejected strings are replaced by [`RejectReason::replacement`].
    pub async fn sanitize_value(&self, ctx: &RequestContext, value: &Value, kind: SanitizeKind) -> Value {
        let mut threats = Vec::new();
        let cleaned = self.clean_value(value, kind, &mut threats);
        for found in &threats {
            self.report_threat(ctx, kind, found).await;
        }
        cleaned
    }

    fn clean_value(&self, value: &Value, kind: SanitizeKind, threats: &mut Vec<ThreatMatch>) -> Value {
        match value {
            Value::String(s) => match self.screen_collect(s, kind, threats) {
                Ok(cleaned) => Value::String(cleaned),
                Err(reason) => reason.replacement(),
            },
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.clean_value(item, kind, threats))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.clean_value(v, kind, threats)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn screen_collect(
        &self,
        input: &str,
        kind: SanitizeKind,
        threats: &mut Vec<ThreatMatch>,
    ) -> Result<String, RejectReason> {
        if let Some(found) = self.detector.scan(input) {
            let reason = threat_reason(&found);
            threats.push(found);
            return Err(reason);
        }
        let cleaned = kind.apply(input)?;
        if let Some(found) = self.detector.scan(&cleaned) {
            let reason = threat_reason(&found);
            threats.push(found);
            return Err(reason);
        }
        Ok(cleaned)
    }

    fn screen(&self, input: &str) -> Result<(), RejectReason> {
        match self.detector.scan(input) {
            Some(found) => Err(threat_reason(&found)),
            None => Ok(()),
        }
    }

    async fn report_threat(&self, ctx: &RequestContext, kind: SanitizeKind, found: &ThreatMatch) {
        let details = format!(
            "{} pattern '{}' in {} field: {}",
            found.category,
            found.rule,
            kind,
            truncate(&found.matched, 120)
        );
        self.auditor
            .record(ctx, found.category.event_type(), details, found.severity, None)
            .await;
    }
}

fn threat_reason(found: &ThreatMatch) -> RejectReason {
    RejectReason::Threat {
        category: found.category,
        rule: found.rule.clone(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
