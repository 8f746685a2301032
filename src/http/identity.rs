//! Caller identity resolution.

use axum::http::HeaderMap;
use std::net::SocketAddr;

/// Proxy headers consulted, in order, when forwarded headers are trusted.
pub const FORWARDED_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "client-ip"];

/// Identity used when neither headers nor the socket reveal the caller.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Resolve the caller identity for a request.
///
/// With `trust_forwarded`, the first non-empty entry of the first present
/// proxy header wins (the client end of an `X-Forwarded-For` chain).
/// Otherwise the socket peer address is used.
pub fn resolve_identity(
    headers: &HeaderMap,
    remote: Option<SocketAddr>,
    trust_forwarded: bool,
) -> String {
    if trust_forwarded {
        for name in FORWARDED_HEADERS {
            let first = headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());

            if let Some(ip) = first {
                return ip.to_string();
            }
        }
    }

    remote
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
}
