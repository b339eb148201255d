//! Upstream error classification
//!
//! Pure functions that categorize an upstream failure (by HTTP status or
//! message text) into one of four classes driving retry and key-pool policy

use std::fmt;

/// Classification of an upstream failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient upstream failure, safe to retry with backoff
    Retryable,
    /// Credential-level failure, the key should be rotated out
    KeyInvalid,
    /// HTTP 429 - deliberately neither retried nor treated as key failure
    RateLimited,
    /// Permanent failure, propagated immediately
    Fatal,
}

/// A classified upstream error carrying the original status and message
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub status: Option<u16>,
    pub message: String,
}

/// HTTP status codes considered transient
const RETRYABLE_STATUS_CODES: &[u16] = &[408, 409, 425, 500, 502, 503, 504, 524];

/// HTTP status codes indicating an invalid or revoked credential
const KEY_FAILURE_STATUS_CODES: &[u16] = &[401, 403];

/// Message fragments that mark an error as transient regardless of status
const RETRYABLE_MESSAGE_FRAGMENTS: &[&str] = &[
    "upstream service unavailable",
    "upstream connect error",
    "overloaded",
    "rate limit",
    "too many requests",
    "deadline exceeded",
    "backend error",
    "temporarily unavailable",
    "network",
    "fetch failed",
    "quic",
];

/// Classify an upstream failure by status code and/or message text.
///
/// Status codes take precedence over message matching; 429 gets its own
/// class so a rate limit is never amplified by retries and never evicts a
/// healthy key under burst traffic.
pub fn classify(status: Option<u16>, message: &str) -> ErrorClass {
    if let Some(code) = status {
        if code == 429 {
            return ErrorClass::RateLimited;
        }
        if RETRYABLE_STATUS_CODES.contains(&code) {
            return ErrorClass::Retryable;
        }
        if KEY_FAILURE_STATUS_CODES.contains(&code) {
            return ErrorClass::KeyInvalid;
        }
    }

    if is_retryable_message(message) {
        return ErrorClass::Retryable;
    }

    ErrorClass::Fatal
}

/// Check whether a message matches the fixed transient-failure list
pub fn is_retryable_message(message: &str) -> bool {
    if message.is_empty() {
        return false;
    }
    let lower = message.to_lowercase();
    RETRYABLE_MESSAGE_FRAGMENTS.iter().any(|f| lower.contains(f))
}

/// Extract an upstream-advised retry delay from an error message.
///
/// Recognizes "retry in Ns" phrasing and embedded `"retryDelay": "Ns"`
/// JSON fields. The result is clamped to [1s, 60s] so a malformed hint
/// cannot stall a request indefinitely.
pub fn advised_retry_delay_ms(message: &str) -> Option<u64> {
    const MIN_MS: u64 = 1_000;
    const MAX_MS: u64 = 60_000;

    let parsed = parse_retry_seconds(message, "retry in ")
        .or_else(|| parse_retry_delay_field(message))?;

    Some(((parsed * 1000.0).ceil() as u64).clamp(MIN_MS, MAX_MS))
}

fn parse_retry_seconds(message: &str, marker: &str) -> Option<f64> {
    let lower = message.to_lowercase();
    let start = lower.find(marker)? + marker.len();
    let rest = &lower[start..];
    let digits: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let end = start + digits.len();
    if !lower[end..].starts_with('s') {
        return None;
    }
    digits.parse().ok()
}

fn parse_retry_delay_field(message: &str) -> Option<f64> {
    let idx = message.find("\"retryDelay\"")?;
    let rest = &message[idx..];
    let colon = rest.find(':')?;
    let value = rest[colon + 1..].trim_start().trim_start_matches('"');
    let digits: String = value
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() || !value[digits.len()..].starts_with('s') {
        return None;
    }
    digits.parse().ok()
}

impl ClassifiedError {
    /// Classify and wrap an upstream failure
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: classify(status, &message),
            status,
            message,
        }
    }

    /// Build a fatal error without consulting the classifier
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            status: None,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Retryable
    }

    pub fn is_key_invalid(&self) -> bool {
        self.class == ErrorClass::KeyInvalid
    }

    pub fn is_rate_limited(&self) -> bool {
        self.class == ErrorClass::RateLimited
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "upstream error {}: {}", code, self.message),
            None => write!(f, "upstream error: {}", self.message),
        }
    }
}

impl std::error::Error for ClassifiedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        for code in [408, 409, 425, 500, 502, 503, 504, 524] {
            assert_eq!(classify(Some(code), ""), ErrorClass::Retryable);
        }
        for code in [401, 403] {
            assert_eq!(classify(Some(code), ""), ErrorClass::KeyInvalid);
        }
        assert_eq!(classify(Some(429), ""), ErrorClass::RateLimited);
        assert_eq!(classify(Some(400), ""), ErrorClass::Fatal);
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(
            classify(None, "The model is overloaded, please retry"),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(None, "Deadline Exceeded while waiting for upstream"),
            ErrorClass::Retryable
        );
        assert_eq!(classify(None, "invalid request payload"), ErrorClass::Fatal);
    }

    #[test]
    fn test_status_wins_over_message() {
        // A 403 with transient-sounding text is still a key failure
        assert_eq!(
            classify(Some(403), "service temporarily unavailable"),
            ErrorClass::KeyInvalid
        );
    }

    #[test]
    fn test_advised_retry_delay() {
        assert_eq!(advised_retry_delay_ms("please retry in 7s"), Some(7_000));
        assert_eq!(
            advised_retry_delay_ms("{\"retryDelay\": \"12s\"}"),
            Some(12_000)
        );
        // Clamped to the floor
        assert_eq!(advised_retry_delay_ms("retry in 0.2s"), Some(1_000));
        assert_eq!(advised_retry_delay_ms("no hint here"), None);
    }
}
