//! Authentication middleware
//!
//! Decodes bearer tokens for free-tier requests. The token's middle JWT
//! segment is decoded as base64 JSON and trusted for its claims; there is
//! no cryptographic signature verification. Malformed and expired tokens
//! are rejected.

use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

/// Claims the gateway reads from a bearer token
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
}

impl TokenClaims {
    /// The user id: `user_id` claim first, `sub` as fallback
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.sub.as_deref())
    }
}

/// Extract and verify the bearer token from request headers.
///
/// Returns the authenticated user id, or `None` for missing, malformed or
/// expired tokens.
pub fn authenticate(headers: &HeaderMap) -> Option<String> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())?
        .strip_prefix("Bearer ")?;
    verify_bearer_token(token)
}

/// Decode a bearer token and return the user id it claims.
///
/// The payload segment is decoded without signature verification; the
/// `exp` claim is still honored.
pub fn verify_bearer_token(token: &str) -> Option<String> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) =
        (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    let bytes = base64url_decode(payload)?;
    let claims: TokenClaims = match serde_json::from_slice(&bytes) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("Token payload is not valid JSON: {}", e);
            return None;
        }
    };

    if let Some(exp) = claims.exp {
        if exp < Utc::now().timestamp() {
            debug!("Token expired");
            return None;
        }
    }

    claims.user_id().map(str::to_string)
}

/// Decode URL-safe base64 (padding optional)
fn base64url_decode(input: &str) -> Option<Vec<u8>> {
    let input = input.trim_end_matches('=');
    let mut output = Vec::with_capacity(input.len() * 3 / 4);
    let mut accum: u32 = 0;
    let mut bits = 0u32;

    for c in input.bytes() {
        let value = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a' + 26,
            b'0'..=b'9' => c - b'0' + 52,
            b'-' | b'+' => 62,
            b'_' | b'/' => 63,
            _ => return None,
        } as u32;

        accum = (accum << 6) | value;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            output.push((accum >> bits) as u8);
        }
    }

    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_segment(bytes: &[u8]) -> String {
        const TABLE: &[u8] =
            b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
        let mut out = String::new();
        for chunk in bytes.chunks(3) {
            let mut accum = 0u32;
            for (i, b) in chunk.iter().enumerate() {
                accum |= (*b as u32) << (16 - i * 8);
            }
            let chars = match chunk.len() {
                3 => 4,
                2 => 3,
                _ => 2,
            };
            for i in 0..chars {
                out.push(TABLE[((accum >> (18 - i * 6)) & 0x3F) as usize] as char);
            }
        }
        out
    }

    fn make_token(payload: &str) -> String {
        format!(
            "{}.{}.{}",
            encode_segment(b"{\"alg\":\"RS256\"}"),
            encode_segment(payload.as_bytes()),
            "sig"
        )
    }

    #[test]
    fn test_valid_token() {
        let exp = Utc::now().timestamp() + 3600;
        let token = make_token(&format!("{{\"user_id\":\"u-123\",\"exp\":{}}}", exp));
        assert_eq!(verify_bearer_token(&token), Some("u-123".to_string()));
    }

    #[test]
    fn test_sub_fallback() {
        let token = make_token("{\"sub\":\"u-456\"}");
        assert_eq!(verify_bearer_token(&token), Some("u-456".to_string()));
    }

    #[test]
    fn test_expired_token_rejected() {
        let exp = Utc::now().timestamp() - 60;
        let token = make_token(&format!("{{\"user_id\":\"u-123\",\"exp\":{}}}", exp));
        assert_eq!(verify_bearer_token(&token), None);
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        assert_eq!(verify_bearer_token("not-a-jwt"), None);
        assert_eq!(verify_bearer_token("a.b"), None);
        assert_eq!(verify_bearer_token("a.!!!.c"), None);
    }

    #[test]
    fn test_base64url_decode() {
        assert_eq!(base64url_decode("aGVsbG8"), Some(b"hello".to_vec()));
        assert_eq!(base64url_decode("aGVsbG8="), Some(b"hello".to_vec()));
        assert_eq!(base64url_decode("???"), None);
    }
}
