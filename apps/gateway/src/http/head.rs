//! Minimal HTTP/1.1 request-head parsing for the accept loop.
//!
//! The gateway reads the request head itself so that WebSocket upgrades keep
//! ownership of the raw socket. Non-upgrade requests are replayed into hyper,
//! so this parser only needs the request line and headers.

use std::collections::HashMap;

/// Largest request head the gateway will buffer before giving up.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    #[error("malformed request head")]
    Malformed,
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    TooLarge,
}

/// A parsed request line plus headers (names lowercased).
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a complete head (everything up to and including `\r\n\r\n`).
    pub fn parse(head: &[u8]) -> Result<Self, HeadError> {
        let text = std::str::from_utf8(head).map_err(|_| HeadError::Malformed)?;
        let mut lines = text.split("\r\n");
        let request_line = lines.next().ok_or(HeadError::Malformed)?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or(HeadError::Malformed)?.to_string();
        let target = parts.next().ok_or(HeadError::Malformed)?.to_string();
        match parts.next() {
            Some(version) if version.starts_with("HTTP/1.") => {}
            _ => return Err(HeadError::Malformed),
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or(HeadError::Malformed)?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
        Ok(Self {
            method,
            target,
            headers,
        })
    }

    /// First header value by lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The path component of the request target.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    /// Decoded query parameters, preserving duplicates.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let Some((_, query)) = self.target.split_once('?') else {
            return Vec::new();
        };
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                (percent_decode(name), percent_decode(value))
            })
            .collect()
    }

    /// Whether this request asks for a WebSocket upgrade.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let connection = self
            .header("connection")
            .map(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false);
        upgrade && connection
    }
}

/// Query parameters the session broker cares about.
#[derive(Debug, Clone, Default)]
pub struct UpgradeQuery {
    pub reconnection_token: String,
    pub reconnection: bool,
    pub skip_websocket_frames: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("missing required query parameter `reconnectionToken`")]
    MissingToken,
    #[error("query parameter `reconnectionToken` supplied more than once")]
    DuplicateToken,
}

impl UpgradeQuery {
    pub fn parse(head: &RequestHead) -> Result<Self, QueryError> {
        let mut pairs: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in head.query_pairs() {
            pairs.entry(name).or_default().push(value);
        }
        let tokens = pairs.remove("reconnectionToken").unwrap_or_default();
        let reconnection_token = match tokens.len() {
            0 => return Err(QueryError::MissingToken),
            1 => tokens.into_iter().next().unwrap_or_default(),
            _ => return Err(QueryError::DuplicateToken),
        };
        if reconnection_token.is_empty() {
            return Err(QueryError::MissingToken);
        }
        let flag = |name: &str| {
            pairs
                .get(name)
                .and_then(|values| values.first())
                .map(|v| v == "true")
                .unwrap_or(false)
        };
        Ok(Self {
            reconnection: flag("reconnection"),
            skip_websocket_frames: flag("skipWebSocketFrames"),
            reconnection_token,
        })
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if let (Some(hi), Some(lo)) = (
                    bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                ) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                    continue;
                }
                out.push(b'%');
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(target: &str, extra: &str) -> RequestHead {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n{extra}\r\n");
        RequestHead::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn parses_request_line_and_headers() {
        let h = head("/static/app.js?x=1", "X-Custom: a\r\n");
        assert_eq!(h.method, "GET");
        assert_eq!(h.path(), "/static/app.js");
        assert_eq!(h.header("x-custom"), Some("a"));
        assert_eq!(h.header("host"), Some("localhost"));
    }

    #[test]
    fn detects_websocket_upgrade() {
        let h = head("/", "Connection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n");
        assert!(h.is_websocket_upgrade());
        let h = head("/", "Connection: keep-alive\r\n");
        assert!(!h.is_websocket_upgrade());
    }

    #[test]
    fn upgrade_query_requires_token() {
        let h = head("/?reconnection=true", "");
        assert!(matches!(
            UpgradeQuery::parse(&h),
            Err(QueryError::MissingToken)
        ));
    }

    #[test]
    fn upgrade_query_rejects_duplicate_token() {
        let h = head("/?reconnectionToken=a&reconnectionToken=b", "");
        assert!(matches!(
            UpgradeQuery::parse(&h),
            Err(QueryError::DuplicateToken)
        ));
    }

    #[test]
    fn upgrade_query_parses_flags() {
        let h = head(
            "/?reconnectionToken=tok%2D1&reconnection=true&skipWebSocketFrames=true",
            "",
        );
        let q = UpgradeQuery::parse(&h).unwrap();
        assert_eq!(q.reconnection_token, "tok-1");
        assert!(q.reconnection);
        assert!(q.skip_websocket_frames);
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%20b+c"), "a b c");
        assert_eq!(percent_decode("100%"), "100%");
    }
}
