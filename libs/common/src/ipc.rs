//! Wire types for the gateway ↔ extension-host worker IPC channel.
//!
//! The gateway creates a `socketpair(AF_UNIX, SOCK_STREAM)` before forking the
//! worker and dups the child end onto [`IPC_SOCKET_FD`]. Both directions speak
//! newline-delimited JSON. The [`GatewayToWorker::IpcSocket`] line is special:
//! it travels in the same `sendmsg` that carries the live TCP socket as
//! `SCM_RIGHTS` ancillary data, so the worker picks up the fd and the message
//! describing it atomically.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File descriptor the worker inherits its IPC socket on.
pub const IPC_SOCKET_FD: i32 = 3;

/// Messages sent from the gateway to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayToWorker {
    /// Hand-off of the client socket. The TCP fd rides along as ancillary
    /// data on the same message.
    #[serde(rename = "VSCODE_EXTHOST_IPC_SOCKET")]
    IpcSocket {
        /// Base64 of protocol bytes received but not yet consumed at the
        /// moment of hand-off.
        #[serde(rename = "initialDataChunk")]
        initial_data_chunk: String,
        /// When true the client speaks the raw persistent protocol with no
        /// WebSocket framing.
        #[serde(rename = "skipWebSocketFrames")]
        skip_websocket_frames: bool,
        /// Whether permessage-deflate was negotiated for this socket.
        #[serde(rename = "permessageDeflate")]
        permessage_deflate: bool,
        /// Base64 of the decompressed tail that seeds the worker's inflater.
        /// Empty when deflate is off.
        #[serde(rename = "inflateBytes")]
        inflate_bytes: String,
    },
}

/// Messages sent from the worker to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerToGateway {
    /// The worker's IPC loop is up; the gateway may hand over the socket.
    #[serde(rename = "VSCODE_EXTHOST_IPC_READY")]
    Ready,
    /// Console output forwarded from extension code. `arguments` is a JSON
    /// array encoded as a string; the first element is the printable message.
    #[serde(rename = "__$console")]
    Console {
        severity: String,
        arguments: String,
    },
}

/// First element of a `__$console` arguments array, rendered printable.
pub fn console_first_argument(arguments: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(arguments).ok()?;
    let first = parsed.as_array()?.first()?;
    Some(match first {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}
