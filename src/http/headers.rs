//! Header filtering and upstream path construction.

use axum::http::header::{HeaderMap, HeaderName, HOST};

/// Headers that describe a single transport hop and are never forwarded.
/// `HeaderName` is always lowercase, so comparisons are case-insensitive.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy every end-to-end header from `src`, keeping repeated values.
pub fn end_to_end(src: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(src.keys_len());
    for (name, value) in src {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Headers forwarded to the upstream.  `Host` is also dropped so the client
/// derives it from the target URL.
pub fn for_upstream(src: &HeaderMap) -> HeaderMap {
    let mut out = end_to_end(src);
    out.remove(HOST);
    out
}

/// Join the upstream base path and the request path with exactly one slash
/// between them.
pub fn single_slash_join(base: &str, path: &str) -> String {
    match (base, path) {
        ("" | "/", _) => ensure_leading_slash(path),
        (_, "" | "/") => ensure_leading_slash(base),
        _ => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        ),
    }
}

pub fn ensure_leading_slash(s: &str) -> String {
    if s.starts_with('/') {
        s.to_string()
    } else {
        format!("/{s}")
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn hop_by_hop_names() {
        for name in [
            "Connection",
            "Proxy-Connection",
            "Keep-Alive",
            "Proxy-Authenticate",
            "Proxy-Authorization",
            "TE",
            "Trailer",
            "Transfer-Encoding",
            "UPGRADE",
        ] {
            let name = HeaderName::from_bytes(name.as_bytes()).unwrap();
            assert!(is_hop_by_hop(&name), "{name} should be hop-by-hop");
        }
        for name in ["content-type", "authorization", "x-forwarded-for", "host"] {
            assert!(!is_hop_by_hop(&HeaderName::from_static(name)));
        }
    }

    #[test]
    fn end_to_end_strips_and_keeps_multi_values() {
        let mut src = HeaderMap::new();
        src.insert("connection", HeaderValue::from_static("close"));
        src.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        src.append("set-cookie", HeaderValue::from_static("a=1"));
        src.append("set-cookie", HeaderValue::from_static("b=2"));
        src.insert("content-type", HeaderValue::from_static("text/plain"));

        let out = end_to_end(&src);
        assert!(out.get("connection").is_none());
        assert!(out.get("transfer-encoding").is_none());
        let cookies: Vec<_> = out.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(out.get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn for_upstream_drops_host() {
        let mut src = HeaderMap::new();
        src.insert(HOST, HeaderValue::from_static("proxy.local"));
        src.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        src.insert("accept", HeaderValue::from_static("*/*"));
        let out = for_upstream(&src);
        assert!(out.get(HOST).is_none());
        assert!(out.get("keep-alive").is_none());
        assert_eq!(out.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn join_with_empty_or_root_base() {
        assert_eq!(single_slash_join("", "/a"), "/a");
        assert_eq!(single_slash_join("/", "a"), "/a");
        assert_eq!(single_slash_join("", ""), "/");
    }

    #[test]
    fn join_with_empty_or_root_path() {
        assert_eq!(single_slash_join("/api", ""), "/api");
        assert_eq!(single_slash_join("api", "/"), "/api");
    }

    #[test]
    fn join_collapses_slashes() {
        assert_eq!(single_slash_join("/api/", "/users"), "/api/users");
        assert_eq!(single_slash_join("/api", "users"), "/api/users");
        assert_eq!(single_slash_join("/api//", "//users"), "/api/users");
        assert_eq!(single_slash_join("/api/v1", "/users/42/"), "/api/v1/users/42/");
    }

    #[test]
    fn leading_slash() {
        assert_eq!(ensure_leading_slash(""), "/");
        assert_eq!(ensure_leading_slash("x"), "/x");
        assert_eq!(ensure_leading_slash("/x"), "/x");
    }
}
