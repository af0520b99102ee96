use axum::http::HeaderMap;

/// Check the bearer token from the Authorization header or a `token`
/// query parameter (the SSE path cannot set headers from EventSource).
pub fn is_authorized(headers: &HeaderMap, query_token: Option<&str>, expected: &str) -> bool {
    if expected.is_empty() {
        // No token configured: the surface is open (dev mode).
        return true;
    }

    if let Some(value) = headers.get("authorization") {
        if let Ok(raw) = value.to_str() {
            if let Some(token) = raw.strip_prefix("Bearer ") {
                return constant_time_eq(token, expected);
            }
        }
    }

    query_token.is_some_and(|token| constant_time_eq(token, expected))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn accepts_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer s3cret"));
        assert!(is_authorized(&headers, None, "s3cret"));
        assert!(!is_authorized(&headers, None, "other"));
    }

    #[test]
    fn accepts_query_token() {
        let headers = HeaderMap::new();
        assert!(is_authorized(&headers, Some("s3cret"), "s3cret"));
        assert!(!is_authorized(&headers, Some("wrong"), "s3cret"));
        assert!(!is_authorized(&headers, None, "s3cret"));
    }

    #[test]
    fn empty_expected_token_disables_auth() {
        let headers = HeaderMap::new();
        assert!(is_authorized(&headers, None, ""));
    }
}
