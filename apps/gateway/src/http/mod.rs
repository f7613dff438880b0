//! HTTP surface: request-head handling for the accept loop, workbench HTML,
//! and static asset serving.

pub mod assets;
pub mod connection;
pub mod head;
pub mod routes;
pub mod workbench;

/// Derive the remote authority as observed by the client.
///
/// Behind an https-terminating proxy a portless `Host` implies 443; otherwise
/// the `Host` header is the authority.
pub fn derive_authority(host: Option<&str>, forwarded_proto: Option<&str>) -> Option<String> {
    let host = host?.trim();
    if host.is_empty() {
        return None;
    }
    let https = forwarded_proto
        .map(|p| p.eq_ignore_ascii_case("https"))
        .unwrap_or(false);
    if https && !host_has_port(host) {
        Some(format!("{host}:443"))
    } else {
        Some(host.to_string())
    }
}

fn host_has_port(host: &str) -> bool {
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal: a port follows the closing bracket.
        rest.contains("]:")
    } else {
        host.contains(':')
    }
}
