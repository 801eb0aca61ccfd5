//! The error taxonomy shared by every layer of the engine.
//!
//! Any failure raised while running a job is normalised into a
//! [`TranslationError`]: a closed [`ErrorKind`], a [`Severity`], and the
//! optional upstream detail (HTTP status, suggested retry-after, structured
//! context). The retry controller, batch scheduler and job driver all make
//! their decisions exclusively through the predicates on this type.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of failure categories the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request to the provider was malformed (HTTP 400).
    InvalidRequest,
    /// Provider credentials were rejected (HTTP 401).
    Unauthorized,
    /// The credentials lack access to the requested resource (HTTP 403).
    Forbidden,
    /// The provider endpoint or model does not exist (HTTP 404).
    NotFound,
    /// The provider is rate limiting us (HTTP 429).
    RateLimited,
    /// Provider-side failure (HTTP 500/502/503).
    Server,
    /// The provider or an intermediary timed out (HTTP 504, client timeouts).
    Timeout,
    /// Transport-level failure reaching the provider.
    Connection,
    /// The provider's content filter rejected the text.
    ContentFiltered,
    /// A translation failed for a reason we could not classify further.
    Translation,
    /// Reading or writing the card image failed.
    File,
    /// The job was cancelled by the user.
    Cancelled,
    /// All retry attempts for an operation were used up.
    RetriesExhausted,
    /// A bug or unexpected engine state.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::Server => "server_error",
            Self::Timeout => "timeout",
            Self::Connection => "connection_error",
            Self::ContentFiltered => "content_filtered",
            Self::Translation => "translation_error",
            Self::File => "file_error",
            Self::Cancelled => "cancelled",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Internal => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad a failure is, independently of whether it can be retried.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A classified failure.
///
/// Immutable once constructed: classification happens exactly once, at the
/// point where a raw failure enters the engine.
#[derive(Debug, Clone, Error)]
#[error("[{kind}] {message}")]
pub struct TranslationError {
    pub kind: ErrorKind,
    pub message: String,
    pub severity: Severity,
    pub http_status: Option<u16>,
    /// Upstream-suggested delay before retrying, when the provider told us.
    pub retry_after: Option<Duration>,
    pub context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl TranslationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            kind,
            message: message.into(),
            severity,
            http_status: None,
            retry_after: None,
            context: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "job was cancelled", Severity::Critical)
    }

    pub fn file(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::File, message, Severity::High)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message, Severity::High)
    }

    /// Classifies an arbitrary failure message.
    ///
    /// A 3-digit HTTP status embedded in the message takes precedence, then
    /// well-known provider error phrases, then the generic translation kind.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if let Some(status) = find_status(&message) {
            return Self::from_status(status, &message);
        }
        let lower = message.to_lowercase();
        if lower.contains("authentication") || lower.contains("invalid_api_key") {
            Self::new(ErrorKind::Unauthorized, message, Severity::Critical)
        } else if lower.contains("permission") || lower.contains("forbidden") {
            Self::new(ErrorKind::Forbidden, message, Severity::Critical)
        } else if lower.contains("rate") || lower.contains("too many requests") {
            Self::new(ErrorKind::RateLimited, message, Severity::Medium)
                .with_retry_after(DEFAULT_RATE_LIMIT_RETRY_AFTER)
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::new(ErrorKind::Timeout, message, Severity::Medium)
        } else if lower.contains("connection") || lower.contains("network") {
            Self::new(ErrorKind::Connection, message, Severity::Medium)
        } else if lower.contains("content_filter") || lower.contains("content policy") {
            Self::new(ErrorKind::ContentFiltered, message, Severity::High)
        } else {
            Self::new(ErrorKind::Translation, message, Severity::Medium)
        }
    }

    /// Maps an HTTP status in the 400..=599 range onto the taxonomy.
    pub fn from_status(status: u16, detail: &str) -> Self {
        let (kind, severity) = match status {
            400 => (ErrorKind::InvalidRequest, Severity::High),
            401 => (ErrorKind::Unauthorized, Severity::Critical),
            403 => (ErrorKind::Forbidden, Severity::Critical),
            404 => (ErrorKind::NotFound, Severity::High),
            429 => (ErrorKind::RateLimited, Severity::Medium),
            500 | 502 | 503 => (ErrorKind::Server, Severity::Medium),
            504 => (ErrorKind::Timeout, Severity::Medium),
            _ => (ErrorKind::Translation, Severity::Medium),
        };
        let error = Self::new(kind, format!("HTTP {status}: {detail}"), severity)
            .with_status(status);
        if status == 429 {
            error.with_retry_after(DEFAULT_RATE_LIMIT_RETRY_AFTER)
        } else {
            error
        }
    }

    /// Whether another attempt can meaningfully be made.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::InvalidRequest
                | ErrorKind::Unauthorized
                | ErrorKind::Forbidden
                | ErrorKind::NotFound
                | ErrorKind::Cancelled
                | ErrorKind::ContentFiltered
        )
    }

    /// Whether the whole job should be aborted, overriding retryability.
    pub fn should_stop_immediately(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Unauthorized
                | ErrorKind::Forbidden
                | ErrorKind::Cancelled
                | ErrorKind::ContentFiltered
        ) || self.severity == Severity::Critical
    }

    /// The delay to wait before retry number `attempt`.
    ///
    /// An upstream-suggested delay wins; otherwise each kind has its own
    /// exponential curve and ceiling.
    pub fn retry_delay(&self, attempt: u16) -> Duration {
        if let Some(delay) = self.retry_after {
            return delay;
        }
        let (base, cap): (u64, u64) = match self.kind {
            ErrorKind::RateLimited => (5, 60),
            ErrorKind::Connection | ErrorKind::Timeout => (2, 30),
            ErrorKind::Server => (3, 45),
            _ => (1, 20),
        };
        let factor = 2u64.saturating_pow(u32::from(attempt));
        Duration::from_secs(base.saturating_mul(factor).min(cap))
    }
}

const DEFAULT_RATE_LIMIT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Finds a standalone 3-digit number in the 400..=599 range.
fn find_status(message: &str) -> Option<u16> {
    let bytes = message.as_bytes();
    for (i, window) in bytes.windows(3).enumerate() {
        if !window.iter().all(u8::is_ascii_digit) {
            continue;
        }
        let preceded = i > 0 && bytes[i - 1].is_ascii_digit();
        let followed = bytes.get(i + 3).is_some_and(u8::is_ascii_digit);
        if preceded || followed {
            continue;
        }
        let status = (u16::from(window[0] - b'0') * 100)
            + (u16::from(window[1] - b'0') * 10)
            + u16::from(window[2] - b'0');
        if (400..=599).contains(&status) {
            return Some(status);
        }
    }
    None
}

/// The bounds applied to any retried operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The number of retries after the initial attempt.
    pub max_retries: u16,
    /// Total wall-clock budget across all attempts and backoff sleeps.
    pub max_total_time: Duration,
    /// Base delay when the error does not dictate its own.
    pub base_delay: Duration,
    /// Ceiling on any single backoff sleep.
    pub max_delay: Duration,
    /// Grow the delay exponentially with the attempt number.
    pub exponential: bool,
    /// Apply a ±10% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_total_time: Duration::from_secs(300),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential: true,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Whether another retry is permitted after attempt number `attempt`.
    ///
    /// The attempt ceiling is absolute: once `attempt >= max_retries` this
    /// returns `false` even for retryable errors with time to spare.
    pub fn should_retry(&self, attempt: u16, elapsed: Duration, error: &TranslationError) -> bool {
        attempt < self.max_retries
            && elapsed < self.max_total_time
            && error.is_retryable()
            && !error.should_stop_immediately()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_table_maps_the_fixed_codes() {
        let cases = [
            (400, ErrorKind::InvalidRequest, Severity::High),
            (401, ErrorKind::Unauthorized, Severity::Critical),
            (403, ErrorKind::Forbidden, Severity::Critical),
            (404, ErrorKind::NotFound, Severity::High),
            (429, ErrorKind::RateLimited, Severity::Medium),
            (500, ErrorKind::Server, Severity::Medium),
            (502, ErrorKind::Server, Severity::Medium),
            (503, ErrorKind::Server, Severity::Medium),
            (504, ErrorKind::Timeout, Severity::Medium),
        ];
        for (status, kind, severity) in cases {
            let error = TranslationError::from_status(status, "upstream said no");
            assert_eq!(error.kind, kind, "status {status}");
            assert_eq!(error.severity, severity, "status {status}");
            assert_eq!(error.http_status, Some(status));
        }
    }

    #[test]
    fn classify_prefers_embedded_status_codes() {
        let error = TranslationError::classify("provider returned 429 Too Many Requests");
        assert_eq!(error.kind, ErrorKind::RateLimited);
        assert_eq!(error.retry_after, Some(Duration::from_secs(30)));
    }

    #[test]
    fn classify_ignores_numbers_outside_the_status_range() {
        let error = TranslationError::classify("request id 1234567 failed");
        assert_eq!(error.kind, ErrorKind::Translation);
    }

    #[test]
    fn classify_matches_known_phrases() {
        let cases = [
            ("Authentication failed for key", ErrorKind::Unauthorized),
            ("permission denied for model", ErrorKind::Forbidden),
            ("rate limit reached", ErrorKind::RateLimited),
            ("request timed out", ErrorKind::Timeout),
            ("connection reset by peer", ErrorKind::Connection),
            ("flagged by content_filter", ErrorKind::ContentFiltered),
            ("something inexplicable", ErrorKind::Translation),
        ];
        for (message, kind) in cases {
            assert_eq!(TranslationError::classify(message).kind, kind, "{message}");
        }
    }

    #[test]
    fn fatal_kinds_are_not_retryable() {
        for kind in [
            ErrorKind::InvalidRequest,
            ErrorKind::Unauthorized,
            ErrorKind::Forbidden,
            ErrorKind::NotFound,
            ErrorKind::Cancelled,
            ErrorKind::ContentFiltered,
        ] {
            assert!(!TranslationError::new(kind, "x", Severity::Medium).is_retryable());
        }
        for kind in [
            ErrorKind::RateLimited,
            ErrorKind::Server,
            ErrorKind::Timeout,
            ErrorKind::Connection,
            ErrorKind::Translation,
        ] {
            assert!(TranslationError::new(kind, "x", Severity::Medium).is_retryable());
        }
    }

    #[test]
    fn critical_severity_stops_immediately_regardless_of_kind() {
        let error = TranslationError::new(ErrorKind::Server, "x", Severity::Critical);
        assert!(error.should_stop_immediately());
        let error = TranslationError::new(ErrorKind::Server, "x", Severity::Medium);
        assert!(!error.should_stop_immediately());
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        let error = TranslationError::new(ErrorKind::RateLimited, "x", Severity::Medium);
        assert_eq!(error.retry_delay(0), Duration::from_secs(5));
        assert_eq!(error.retry_delay(1), Duration::from_secs(10));
        assert_eq!(error.retry_delay(2), Duration::from_secs(20));
        assert_eq!(error.retry_delay(10), Duration::from_secs(60));

        let error = TranslationError::new(ErrorKind::Connection, "x", Severity::Medium);
        assert_eq!(error.retry_delay(0), Duration::from_secs(2));
        assert_eq!(error.retry_delay(5), Duration::from_secs(30));

        let error = TranslationError::new(ErrorKind::Server, "x", Severity::Medium);
        assert_eq!(error.retry_delay(1), Duration::from_secs(6));
        assert_eq!(error.retry_delay(6), Duration::from_secs(45));

        let error = TranslationError::new(ErrorKind::Translation, "x", Severity::Medium);
        assert_eq!(error.retry_delay(0), Duration::from_secs(1));
        assert_eq!(error.retry_delay(8), Duration::from_secs(20));
    }

    #[test]
    fn upstream_retry_after_wins() {
        let error = TranslationError::new(ErrorKind::Server, "x", Severity::Medium)
            .with_retry_after(Duration::from_secs(7));
        assert_eq!(error.retry_delay(5), Duration::from_secs(7));
    }

    #[test]
    fn should_retry_is_false_at_the_attempt_ceiling() {
        let policy = RetryPolicy::default();
        let error = TranslationError::new(ErrorKind::Server, "x", Severity::Medium);
        assert!(policy.should_retry(0, Duration::ZERO, &error));
        assert!(policy.should_retry(2, Duration::ZERO, &error));
        assert!(!policy.should_retry(3, Duration::ZERO, &error));
        assert!(!policy.should_retry(4, Duration::ZERO, &error));
    }

    #[test]
    fn should_retry_respects_the_time_budget_and_the_error() {
        let policy = RetryPolicy::default();
        let retryable = TranslationError::new(ErrorKind::Server, "x", Severity::Medium);
        assert!(!policy.should_retry(0, Duration::from_secs(301), &retryable));

        let fatal = TranslationError::new(ErrorKind::Unauthorized, "x", Severity::Critical);
        assert!(!policy.should_retry(0, Duration::ZERO, &fatal));
    }
}
