//! Error classification tests
//!
//! Verify the status and message taxonomy driving retry and key-pool
//! policy

use aigateway::services::classifier::{advised_retry_delay_ms, classify, ClassifiedError, ErrorClass};

#[test]
fn test_server_errors_are_retryable() {
    for code in [500, 502, 503, 504] {
        assert_eq!(
            classify(Some(code), ""),
            ErrorClass::Retryable,
            "status {} should be retryable",
            code
        );
    }
}

#[test]
fn test_extended_transient_statuses_are_retryable() {
    for code in [408, 409, 425, 524] {
        assert_eq!(classify(Some(code), ""), ErrorClass::Retryable);
    }
}

#[test]
fn test_auth_errors_invalidate_keys() {
    for code in [401, 403] {
        assert_eq!(
            classify(Some(code), ""),
            ErrorClass::KeyInvalid,
            "status {} should invalidate the key",
            code
        );
    }
}

#[test]
fn test_rate_limit_is_its_own_class() {
    let class = classify(Some(429), "");
    assert_eq!(class, ErrorClass::RateLimited);
    // Never folded into the other classes
    assert_ne!(class, ErrorClass::Retryable);
    assert_ne!(class, ErrorClass::KeyInvalid);
}

#[test]
fn test_transient_message_fragments() {
    let transient = [
        "Upstream service unavailable, try later",
        "the model is OVERLOADED",
        "rate limit hit for project",
        "Too Many Requests from this region",
        "context deadline exceeded",
        "backend error while routing",
        "network connection reset",
        "fetch failed",
        "QUIC handshake failure",
    ];
    for message in transient {
        assert_eq!(
            classify(None, message),
            ErrorClass::Retryable,
            "message {:?} should be retryable",
            message
        );
    }
}

#[test]
fn test_unknown_failures_are_fatal() {
    assert_eq!(classify(None, "invalid request body"), ErrorClass::Fatal);
    assert_eq!(classify(Some(400), "bad request"), ErrorClass::Fatal);
    assert_eq!(classify(Some(404), "model not found"), ErrorClass::Fatal);
    assert_eq!(classify(None, ""), ErrorClass::Fatal);
}

#[test]
fn test_status_takes_precedence_over_message() {
    // A key failure stays a key failure even with transient-sounding text
    assert_eq!(
        classify(Some(401), "service temporarily unavailable"),
        ErrorClass::KeyInvalid
    );
    // And a 429 stays rate-limited
    assert_eq!(classify(Some(429), "overloaded"), ErrorClass::RateLimited);
}

#[test]
fn test_classified_error_display() {
    let err = ClassifiedError::new(Some(503), "Service Unavailable");
    assert!(err.is_retryable());
    assert_eq!(err.to_string(), "upstream error 503: Service Unavailable");

    let err = ClassifiedError::new(None, "overloaded");
    assert_eq!(err.to_string(), "upstream error: overloaded");
}

#[test]
fn test_advised_retry_delay_parsing() {
    assert_eq!(
        advised_retry_delay_ms("quota exceeded, retry in 30s"),
        Some(30_000)
    );
    assert_eq!(
        advised_retry_delay_ms(r#"{"error": {"details": {"retryDelay": "4s"}}}"#),
        Some(4_000)
    );
    assert_eq!(advised_retry_delay_ms("permanent failure"), None);
    // Clamped to the one-minute ceiling
    assert_eq!(advised_retry_delay_ms("retry in 600s"), Some(60_000));
}
