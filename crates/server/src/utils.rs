use axum::http::HeaderMap;
use base64::Engine;

/// Generate a secure random identifier (32 bytes, ~256 bits of entropy).
///
/// Returns a URL-safe base64-encoded string. Used for session ids and
/// authorization codes.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes).expect("Failed to generate random bytes");
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Best-effort client IP extraction for rate limiting.
///
/// The server is expected to sit behind a reverse proxy that sets
/// `X-Forwarded-For`. Falls back to `X-Real-IP`, then a fixed marker so
/// direct connections still share one throttling bucket.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
    {
        return value.trim().to_string();
    }
    "direct".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn random_tokens_are_unique_and_url_safe() {
        let a = random_token();
        let b = random_token();
        assert_ne!(a, b);
        assert!(!a.contains('+'));
        assert!(!a.contains('/'));
        assert!(!a.contains('='));
        // 32 bytes base64url encodes to 43 characters
        assert_eq!(a.len(), 43);
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_ip(&headers), "203.0.113.7");
    }

    #[test]
    fn client_ip_falls_back() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_ip(&headers), "198.51.100.2");
        assert_eq!(client_ip(&HeaderMap::new()), "direct");
    }
}
