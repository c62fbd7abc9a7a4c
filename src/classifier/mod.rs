//! Provider error classification
//!
//! Maps a provider error code and message to one of four actionable outcomes
//! plus a suggested wait. The mapping lives in a JSON table rather than in
//! code: a default table is embedded in the binary and an operator can point
//! the loader at a corrected copy without rebuilding.
//!
//! Resolution order for [`ErrorClassifier::classify`]:
//!
//! 1. A mapped code's first matching message override
//! 2. The mapped code's own rule
//! 3. The first matching message rule (applies to unmapped and missing codes)
//! 4. The table default (retryable, moderate wait)
//!
//! All message matching is case-insensitive substring matching.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Embedded default table
const ERROR_CODES_JSON: &str = include_str!("error_codes.json");

/// Outcome category for a provider error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Stop the whole load; retrying cannot help
    Fatal,
    /// Transient; retry after backoff
    Retryable,
    /// The provider's rate limit was hit; retry after a longer wait
    Pacing,
    /// The provider has nothing for this request; skip it
    DataUnavailable,
}

impl ErrorKind {
    /// Short label used in logs, metrics and diagnostics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Fatal => "fatal",
            ErrorKind::Retryable => "retryable",
            ErrorKind::Pacing => "pacing",
            ErrorKind::DataUnavailable => "data_unavailable",
        }
    }

    /// Whether a request with this outcome should be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Retryable | ErrorKind::Pacing)
    }

    /// Operator-facing hint shown next to failures
    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorKind::Fatal => "Check the symbol, contract details and market data permissions",
            ErrorKind::Retryable => "Provider or network hiccup; the loader retries automatically",
            ErrorKind::Pacing => "Reduce request rate or widen the pacing interval",
            ErrorKind::DataUnavailable => "The provider has no data for this range",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one provider error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorClassification {
    /// Outcome category
    pub kind: ErrorKind,
    /// Wait the provider's documentation recommends before the next attempt
    pub suggested_wait: Duration,
}

impl ErrorClassification {
    /// Build a classification from a kind and a wait in seconds
    pub fn new(kind: ErrorKind, wait_secs: u64) -> Self {
        Self {
            kind,
            suggested_wait: Duration::from_secs(wait_secs),
        }
    }

    /// Classification used for local timeouts and lost sessions
    pub fn retryable(wait: Duration) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            suggested_wait: wait,
        }
    }
}

/// Errors loading a classification table
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// Failed to read the table file
    #[error("failed to read error table {path}: {message}")]
    IoError {
        /// Path that was read
        path: String,
        /// Underlying error
        message: String,
    },

    /// Table JSON did not parse
    #[error("error table parse error: {0}")]
    ParseError(String),

    /// Table parsed but is inconsistent
    #[error("invalid error table: {0}")]
    InvalidTable(String),
}

/// Result type for classifier operations
pub type ClassifierResult<T> = Result<T, ClassifierError>;

#[derive(Debug, Clone, Deserialize)]
struct RawRule {
    kind: ErrorKind,
    #[serde(default)]
    wait_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct RawMessageRule {
    contains: String,
    kind: ErrorKind,
    #[serde(default)]
    wait_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct RawCodeRule {
    code: i32,
    kind: ErrorKind,
    #[serde(default)]
    wait_secs: u64,
    #[serde(default)]
    description: String,
    #[serde(default)]
    message_overrides: Vec<RawMessageRule>,
}

#[derive(Debug, Deserialize)]
struct RawTable {
    schema_version: String,
    default: RawRule,
    #[serde(default)]
    codes: Vec<RawCodeRule>,
    #[serde(default)]
    message_rules: Vec<RawMessageRule>,
    #[serde(default)]
    identity_conflict_patterns: Vec<String>,
}

#[derive(Debug, Clone)]
struct MessageRule {
    needle: String,
    classification: ErrorClassification,
}

impl MessageRule {
    fn from_raw(raw: RawMessageRule) -> ClassifierResult<Self> {
        let needle = raw.contains.trim().to_lowercase();
        if needle.is_empty() {
            return Err(ClassifierError::InvalidTable(
                "message rule with empty 'contains'".to_string(),
            ));
        }
        Ok(Self {
            needle,
            classification: ErrorClassification::new(raw.kind, raw.wait_secs),
        })
    }
}

#[derive(Debug, Clone)]
struct CodeRule {
    classification: ErrorClassification,
    description: String,
    overrides: Vec<MessageRule>,
}

/// Table-driven provider error classifier
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    schema_version: String,
    default: ErrorClassification,
    codes: HashMap<i32, CodeRule>,
    message_rules: Vec<MessageRule>,
    identity_conflict_patterns: Vec<String>,
}

impl ErrorClassifier {
    /// Load the table compiled into the crate
    pub fn embedded() -> ClassifierResult<Self> {
        Self::from_json(ERROR_CODES_JSON)
    }

    /// Load a table from a JSON file
    pub fn from_file(path: &Path) -> ClassifierResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| ClassifierError::IoError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let classifier = Self::from_json(&json)?;
        debug!(
            path = %path.display(),
            codes = classifier.codes.len(),
            "Loaded error classification table"
        );
        Ok(classifier)
    }

    /// Parse a table from a JSON string
    pub fn from_json(json: &str) -> ClassifierResult<Self> {
        let raw: RawTable = serde_json::from_str(json)
            .map_err(|e| ClassifierError::ParseError(format!("Failed to parse table: {e}")))?;

        let mut codes = HashMap::with_capacity(raw.codes.len());
        for entry in raw.codes {
            let overrides = entry
                .message_overrides
                .into_iter()
                .map(MessageRule::from_raw)
                .collect::<ClassifierResult<Vec<_>>>()?;
            let rule = CodeRule {
                classification: ErrorClassification::new(entry.kind, entry.wait_secs),
                description: entry.description,
                overrides,
            };
            if codes.insert(entry.code, rule).is_some() {
                return Err(ClassifierError::InvalidTable(format!(
                    "code {} is listed more than once",
                    entry.code
                )));
            }
        }

        let message_rules = raw
            .message_rules
            .into_iter()
            .map(MessageRule::from_raw)
            .collect::<ClassifierResult<Vec<_>>>()?;

        let identity_conflict_patterns = raw
            .identity_conflict_patterns
            .into_iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        Ok(Self {
            schema_version: raw.schema_version,
            default: ErrorClassification::new(raw.default.kind, raw.default.wait_secs),
            codes,
            message_rules,
            identity_conflict_patterns,
        })
    }

    /// Table schema version
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Number of mapped error codes
    pub fn code_count(&self) -> usize {
        self.codes.len()
    }

    /// Classify a provider error
    pub fn classify(&self, code: Option<i32>, message: &str) -> ErrorClassification {
        let message = message.to_lowercase();

        if let Some(rule) = code.and_then(|c| self.codes.get(&c)) {
            return first_match(&rule.overrides, &message).unwrap_or(rule.classification);
        }

        first_match(&self.message_rules, &message).unwrap_or(self.default)
    }

    /// Whether a connection failure means the session identity is taken
    pub fn is_identity_conflict(&self, message: &str) -> bool {
        let message = message.to_lowercase();
        self.identity_conflict_patterns
            .iter()
            .any(|pattern| message.contains(pattern.as_str()))
    }

    /// Table description for a code, if mapped
    pub fn describe(&self, code: i32) -> Option<&str> {
        self.codes
            .get(&code)
            .map(|rule| rule.description.as_str())
            .filter(|d| !d.is_empty())
    }
}

fn first_match(rules: &[MessageRule], message: &str) -> Option<ErrorClassification> {
    rules
        .iter()
        .find(|rule| message.contains(rule.needle.as_str()))
        .map(|rule| rule.classification)
}
