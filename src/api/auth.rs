use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::api::types::{unauthorized, ApiError};

pub const AGENT_KEY_HEADER: &str = "x-api-key";
pub const ORCHESTRATOR_SECRET_HEADER: &str = "x-orchestrator-secret";

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

/// Compare fixed-size digests so the check does not leak the secret's length or prefix
pub fn secret_matches(provided: &str, expected: &str) -> bool {
    let (a, b) = (digest(provided), digest(expected));
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Require `header` to carry `expected`. An unset secret disables the check.
pub fn ensure_header_secret(
    headers: &HeaderMap,
    header: &str,
    expected: Option<&str>,
) -> std::result::Result<(), ApiError> {
    let Some(expected) = expected.filter(|s| !s.is_empty()) else {
        return Ok(());
    };

    let provided = headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    match provided {
        Some(value) if secret_matches(value, expected) => Ok(()),
        Some(_) => Err(unauthorized("invalid credentials")),
        None => Err(unauthorized("missing credentials")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_secret_matches() {
        assert!(secret_matches("s3cret", "s3cret"));
        assert!(!secret_matches("s3cret", "s3cret2"));
        assert!(!secret_matches("", "s3cret"));
    }

    #[test]
    fn test_unset_secret_allows_everything() {
        assert!(ensure_header_secret(&HeaderMap::new(), AGENT_KEY_HEADER, None).is_ok());
        assert!(ensure_header_secret(&HeaderMap::new(), AGENT_KEY_HEADER, Some("")).is_ok());
    }

    #[test]
    fn test_header_checked_when_configured() {
        let mut headers = HeaderMap::new();
        assert!(ensure_header_secret(&headers, AGENT_KEY_HEADER, Some("k")).is_err());
        headers.insert(AGENT_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert!(ensure_header_secret(&headers, AGENT_KEY_HEADER, Some("k")).is_err());
        headers.insert(AGENT_KEY_HEADER, HeaderValue::from_static("k"));
        assert!(ensure_header_secret(&headers, AGENT_KEY_HEADER, Some("k")).is_ok());
    }
}
