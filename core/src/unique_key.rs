//! Stable request identifiers.
//!
//! Two requests are the same unit of work iff their unique keys are equal.
//! The key is a SHA-256 digest over the normalized URL, the HTTP method and
//! the payload bytes, so it survives serialization round trips and process
//! restarts.

use sha2::{Digest, Sha256};
use url::Url;

use crate::request::Method;

/// Normalize a URL for deduplication purposes.
///
/// Lowercases the scheme and host, strips the fragment and drops default
/// ports. Query parameters are kept in their original order: reordering is
/// observable by servers and must not collapse two distinct requests.
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    if let Some(port) = normalized.port() {
        if (normalized.scheme() == "http" && port == 80)
            || (normalized.scheme() == "https" && port == 443)
        {
            let _ = normalized.set_port(None);
        }
    }

    if let Some(host) = normalized.host_str() {
        let lowered = host.to_lowercase();
        if lowered != host {
            let _ = normalized.set_host(Some(&lowered));
        }
    }

    normalized.to_string()
}

/// Compute the unique key for a request.
pub fn compute_unique_key(url: &Url, method: Method, payload: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_url(url).as_bytes());
    hasher.update(b"\0");
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"\0");
    if let Some(payload) = payload {
        hasher.update(payload);
    }
    hex_digest(&hasher.finalize())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_key_is_stable() {
        let a = compute_unique_key(&url("https://example.com/a"), Method::GET, None);
        let b = compute_unique_key(&url("https://example.com/a"), Method::GET, None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fragment_is_ignored() {
        let a = compute_unique_key(&url("https://example.com/a#top"), Method::GET, None);
        let b = compute_unique_key(&url("https://example.com/a"), Method::GET, None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_default_port_is_dropped() {
        let a = compute_unique_key(&url("https://example.com:443/a"), Method::GET, None);
        let b = compute_unique_key(&url("https://example.com/a"), Method::GET, None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_host_case_is_ignored() {
        let a = compute_unique_key(&url("https://EXAMPLE.com/a"), Method::GET, None);
        let b = compute_unique_key(&url("https://example.com/a"), Method::GET, None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_method_and_payload_matter() {
        let get = compute_unique_key(&url("https://example.com/a"), Method::GET, None);
        let post = compute_unique_key(&url("https://example.com/a"), Method::POST, None);
        let post_body =
            compute_unique_key(&url("https://example.com/a"), Method::POST, Some(b"x=1"));
        assert_ne!(get, post);
        assert_ne!(post, post_body);
    }

    #[test]
    fn test_query_order_is_preserved() {
        let a = compute_unique_key(&url("https://example.com/a?x=1&y=2"), Method::GET, None);
        let b = compute_unique_key(&url("https://example.com/a?y=2&x=1"), Method::GET, None);
        assert_ne!(a, b);
    }
}
