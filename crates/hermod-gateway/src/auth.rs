//! Token gate for the webhook surface.
//!
//! A request authenticates with any of:
//! - `Authorization: Bearer <token>`
//! - `X-Gateway-Token: <token>`
//! - `?token=<token>`
//!
//! A gateway with no configured token refuses all webhook traffic.

use axum::http::HeaderMap;

/// Constant-time comparison to keep token checks timing-safe.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Extract the presented token from headers or query string.
pub fn presented_token<'a>(headers: &'a HeaderMap, query: Option<&'a str>) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    if let Some(token) = headers.get("x-gateway-token").and_then(|v| v.to_str().ok()) {
        return Some(token.to_string());
    }
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=") {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Check the presented token against the configured one.
pub fn authorize(expected: Option<&str>, headers: &HeaderMap, query: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    match presented_token(headers, query) {
        Some(token) => constant_time_eq(&token, expected),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn bearer_header_accepted() {
        let h = headers(&[("authorization", "Bearer s3cret")]);
        assert!(authorize(Some("s3cret"), &h, None));
    }

    #[test]
    fn gateway_token_header_accepted() {
        let h = headers(&[("x-gateway-token", "s3cret")]);
        assert!(authorize(Some("s3cret"), &h, None));
    }

    #[test]
    fn query_token_accepted() {
        let h = HeaderMap::new();
        assert!(authorize(Some("s3cret"), &h, Some("a=b&token=s3cret")));
    }

    #[test]
    fn wrong_or_missing_token_rejected() {
        let h = headers(&[("authorization", "Bearer nope")]);
        assert!(!authorize(Some("s3cret"), &h, None));
        assert!(!authorize(Some("s3cret"), &HeaderMap::new(), None));
    }

    #[test]
    fn unconfigured_token_rejects_everything() {
        let h = headers(&[("authorization", "Bearer anything")]);
        assert!(!authorize(None, &h, None));
    }
}
