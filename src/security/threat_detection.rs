use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::audit::{SecurityEventType, SecuritySeverity};

/// Family of attack a rule recognises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    Xss,
    SqlInjection,
}

impl ThreatCategory {
    pub fn event_type(&self) -> SecurityEventType {
        match self {
            ThreatCategory::Xss => SecurityEventType::XssAttempt,
            ThreatCategory::SqlInjection => SecurityEventType::SqlInjection,
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreatCategory::Xss => f.write_str("XSS"),
            ThreatCategory::SqlInjection => f.write_str("SQL injection"),
        }
    }
}

/// A single `(pattern, category, severity)` heuristic
#[derive(Debug, Clone)]
pub struct ThreatRule {
    pub name: String,
    pub pattern: Regex,
    pub category: ThreatCategory,
    pub severity: SecuritySeverity,
}

impl ThreatRule {
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        category: ThreatCategory,
        severity: SecuritySeverity,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: Regex::new(pattern)?,
            category,
            severity,
        })
    }
}

/// Result of a positive scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreatMatch {
    pub rule: String,
    pub category: ThreatCategory,
    pub severity: SecuritySeverity,
    pub matched: String,
}

/// Built-in rules. Every pattern is case-insensitive.
const DEFAULT_RULES: &[(&str, &str, ThreatCategory)] = &[
    // XSS indicators
    ("script_tag", r"(?i)<\s*/?\s*script\b", ThreatCategory::Xss),
    ("javascript_scheme", r"(?i)\b(java|vb)script\s*:", ThreatCategory::Xss),
    ("inline_event_handler", r"(?i)\bon[a-z]{3,}\s*=", ThreatCategory::Xss),
    ("embedded_frame", r"(?i)<\s*(iframe|object|embed)\b", ThreatCategory::Xss),
    // SQL injection indicators
    ("union_select", r"(?i)\bunion\b(\s+all)?\s+select\b", ThreatCategory::SqlInjection),
    (
        "select_from",
        r#"(?i)\bselect\s+(\*|[\w.]+(\s*,\s*[\w.]+)*|count\s*\(\s*\*\s*\))\s+from\s+[\w.`"\[]+"#,
        ThreatCategory::SqlInjection,
    ),
    ("insert_into", r#"(?i)\binsert\s+into\s+[\w.`"\[]+"#, ThreatCategory::SqlInjection),
    (
        "update_set",
        r#"(?i)\bupdate\s+[\w.`"\[\]]+\s+set\s+[\w.`"\[\]]+\s*="#,
        ThreatCategory::SqlInjection,
    ),
    ("delete_from", r#"(?i)\bdelete\s+from\s+[\w.`"\[]+"#, ThreatCategory::SqlInjection),
    (
        "schema_change",
        r"(?i)\b(drop|create|alter|truncate)\s+(table|database|schema|user|index|view)\b",
        ThreatCategory::SqlInjection,
    ),
    (
        "exec_call",
        r"(?i)\bexec(ute)?\s*(\(|\s+(xp_|sp_)\w+|\s+master\.)",
        ThreatCategory::SqlInjection,
    ),
    (
        "numeric_tautology",
        r#"(?i)\bor\s+['"]?\d+['"]?\s*=\s*['"]?\d+\b"#,
        ThreatCategory::SqlInjection,
    ),
    (
        "string_tautology",
        r#"(?i)['"]\s*or\s*['"][^'"]*['"]\s*=\s*['"]"#,
        ThreatCategory::SqlInjection,
    ),
    (
        "stacked_statement",
        r"(?i);\s*(drop|delete|truncate|update|insert|alter|create|exec)\b",
        ThreatCategory::SqlInjection,
    ),
    ("quote_comment", r"'\s*(--|/\*)", ThreatCategory::SqlInjection),
];

/// Ordered, pluggable rule set used to screen user input.
///
/// Rules are evaluated in insertion order and the first match wins, so a
/// single value produces at most one detection.
#[derive(Debug, Clone)]
pub struct ThreatDetector {
    rules: Vec<ThreatRule>,
}

impl Default for ThreatDetector {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

impl ThreatDetector {
    pub fn new(rules: Vec<ThreatRule>) -> Self {
        Self { rules }
    }

    pub fn with_default_rules() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .map(|(name, pattern, category)| {
                ThreatRule::new(*name, pattern, *category, SecuritySeverity::Critical)
                    .expect("Valid regex pattern for threat detection")
            })
            .collect();
        Self { rules }
    }

    /// Append a rule; it is evaluated after the existing ones
    pub fn add_rule(&mut self, rule: ThreatRule) {
        self.rules.push(rule);
    }

    pub fn with_rule(mut self, rule: ThreatRule) -> Self {
        self.add_rule(rule);
        self
    }

    pub fn rules(&self) -> &[ThreatRule] {
        &self.rules
    }

    /// First rule matching `input`, if any
    pub fn scan(&self, input: &str) -> Option<ThreatMatch> {
        self.rules.iter().find_map(|rule| {
            rule.pattern.find(input).map(|m| ThreatMatch {
                rule: rule.name.clone(),
                category: rule.category,
                severity: rule.severity,
                matched: m.as_str().to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category_of(input: &str) -> Option<ThreatCategory> {
        ThreatDetector::with_default_rules()
            .scan(input)
            .map(|m| m.category)
    }

    #[test]
    fn test_xss_patterns() {
        assert_eq!(category_of("<script>alert(1)</script>"), Some(ThreatCategory::Xss));
        assert_eq!(category_of("<SCRIPT src=//evil.example>"), Some(ThreatCategory::Xss));
        assert_eq!(category_of("JavaScript:alert(document.cookie)"), Some(ThreatCategory::Xss));
        assert_eq!(category_of("<img src=x onerror=alert(1)>"), Some(ThreatCategory::Xss));
        assert_eq!(category_of("\" onmouseover = \"steal()"), Some(ThreatCategory::Xss));
        assert_eq!(category_of("<iframe src=//evil>"), Some(ThreatCategory::Xss));
        assert_eq!(category_of("< object data=x>"), Some(ThreatCategory::Xss));
    }

    #[test]
    fn test_sql_injection_patterns() {
        let sqli = Some(ThreatCategory::SqlInjection);
        assert_eq!(category_of("' OR 1=1 --"), sqli);
        assert_eq!(category_of("admin' or 'a'='a"), sqli);
        assert_eq!(category_of("1 UNION ALL SELECT password FROM users"), sqli);
        assert_eq!(category_of("SELECT * FROM bookings"), sqli);
        assert_eq!(category_of("x'; DROP TABLE users; --"), sqli);
        assert_eq!(category_of("INSERT INTO services VALUES (1)"), sqli);
        assert_eq!(category_of("update barbers set name='x'"), sqli);
        assert_eq!(category_of("DELETE FROM bookings"), sqli);
        assert_eq!(category_of("EXEC xp_cmdshell 'dir'"), sqli);
    }

    #[test]
    fn test_string_tautology_with_either_quote() {
        let detector = ThreatDetector::with_default_rules();
        for input in [r#"" OR ""=""#, "x' OR 'x'='x", r#"admin" or "a"="a"#] {
            let found = detector.scan(input).unwrap();
            assert_eq!(found.rule, "string_tautology", "wrong rule for {:?}", input);
        }
    }

    #[test]
    fn test_ordinary_text_passes() {
        for input in [
            "John O'Brien",
            "I'd like to update my booking for Friday",
            "Please delete my old appointment",
            "Online booking is great",
            "Meet me at 10:30; thanks!",
            "anne-marie@example.com",
            r#"She said "yes" or "no" to the offer"#,
        ] {
            assert_eq!(category_of(input), None, "false positive for {:?}", input);
        }
    }

    #[test]
    fn test_first_match_wins_and_rules_are_pluggable() {
        let detector = ThreatDetector::new(Vec::new());
        assert!(detector.scan("<script>").is_none());

        let detector = detector.with_rule(
            ThreatRule::new(
                "svg_payload",
                r"(?i)<\s*svg\b",
                ThreatCategory::Xss,
                SecuritySeverity::High,
            )
            .unwrap(),
        );
        let found = detector.scan("<svg/onload=alert(1)>").unwrap();
        assert_eq!(found.rule, "svg_payload");
        assert_eq!(found.severity, SecuritySeverity::High);
        assert_eq!(detector.rules().len(), 1);
    }

    #[test]
    fn test_category_event_types() {
        assert_eq!(ThreatCategory::Xss.event_type(), SecurityEventType::XssAttempt);
        assert_eq!(
            ThreatCategory::SqlInjection.event_type(),
            SecurityEventType::SqlInjection
        );
    }
}
