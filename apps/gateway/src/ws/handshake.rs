//! WebSocket upgrade handshake (server side).

use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::http::head::RequestHead;

use super::frame::SocketLink;

/// Fixed GUID appended to the client key, per RFC 6455 §4.2.2.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("missing or malformed Sec-WebSocket-Key")]
    BadKey,
    #[error("io error during upgrade: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a successful upgrade: the framed link and whether
/// permessage-deflate was negotiated.
pub struct Upgraded<S> {
    pub link: SocketLink<S>,
    pub deflate_enabled: bool,
}

/// Compute `Sec-WebSocket-Accept` for a client-supplied key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Validate the client key: base64 of 16 random bytes.
fn key_is_valid(key: &str) -> bool {
    base64::engine::general_purpose::STANDARD
        .decode(key.trim())
        .map(|bytes| bytes.len() == 16)
        .unwrap_or(false)
}

/// Negotiate `permessage-deflate` from the client's extension offer.
///
/// If the client offered it, the offer is echoed back; a valueless
/// `client_max_window_bits` is normalized to 15. Other parameters are
/// accepted as offered. Returns the response header value, or `None` when the
/// extension was not offered.
pub fn negotiate_deflate(offer: Option<&str>) -> Option<String> {
    let offer = offer?;
    for extension in offer.split(',') {
        let mut parts = extension.split(';').map(str::trim);
        let name = parts.next()?;
        if !name.eq_ignore_ascii_case("permessage-deflate") {
            continue;
        }
        let mut response = String::from("permessage-deflate");
        for param in parts {
            if param.is_empty() {
                continue;
            }
            response.push_str("; ");
            if param.eq_ignore_ascii_case("client_max_window_bits") {
                response.push_str("client_max_window_bits=15");
            } else {
                response.push_str(param);
            }
        }
        return Some(response);
    }
    None
}

/// Perform the server side of the upgrade on an already-parsed request head.
///
/// Writes the `101` (or a literal `400` on a bad key) directly to the stream.
/// With `skip_frames` the upgrade still happens but the returned link is a
/// raw byte pipe.
pub async fn accept_upgrade<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    head: &RequestHead,
    leftover: BytesMut,
    skip_frames: bool,
) -> Result<Upgraded<S>, UpgradeError> {
    let key = match head.header("sec-websocket-key") {
        Some(key) if key_is_valid(key) => key.trim().to_string(),
        _ => {
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
                .await;
            let _ = stream.shutdown().await;
            return Err(UpgradeError::BadKey);
        }
    };

    let extensions = negotiate_deflate(head.header("sec-websocket-extensions"));
    let deflate_enabled = extensions.is_some();

    let mut response = String::with_capacity(256);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept_key(&key)));
    if let Some(extensions) = &extensions {
        response.push_str(&format!("Sec-WebSocket-Extensions: {extensions}\r\n"));
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    let link = if skip_frames {
        SocketLink::raw(stream, leftover)
    } else {
        SocketLink::websocket(stream, leftover, deflate_enabled)
    };
    Ok(Upgraded {
        link,
        deflate_enabled,
    })
}
