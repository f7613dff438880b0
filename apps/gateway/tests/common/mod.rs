//! Shared harness: boots a real gateway on an ephemeral port and provides
//! protocol-speaking clients.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

use workbench_gateway::config::Config;
use workbench_gateway::protocol::persistent::{encode_message, kinds, HEADER_LEN};
use workbench_gateway::{serve, AppState};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestHarness {
    pub addr: SocketAddr,
    pub state: AppState,
    // Held so the temp trees outlive the server.
    pub app_root: tempfile::TempDir,
    pub user_root: tempfile::TempDir,
}

/// Start an actual gateway for end-to-end testing. The app root carries a
/// workbench template and one static asset.
pub async fn start_server() -> TestHarness {
    let app_root = tempfile::tempdir().expect("app root");
    let user_root = tempfile::tempdir().expect("user root");
    std::fs::write(
        app_root.path().join("workbench.html"),
        "<!DOCTYPE html><html><body data-settings=\"{{WORKBENCH_WEB_CONFIGURATION}}\"></body></html>",
    )
    .expect("template");
    std::fs::write(app_root.path().join("app.js"), "console.log('workbench');\n")
        .expect("asset");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let config = Config {
        port: addr.port(),
        app_root: app_root.path().to_path_buf(),
        exthost_binary: PathBuf::from(env!("CARGO_BIN_EXE_exthost-smoke")),
        uri_transformer_path: app_root.path().join("uri-transformer.js"),
        builtin_extensions_dir: app_root.path().join("extensions"),
        user_extensions_dir: user_root.path().join("extensions"),
        user_data_dir: user_root.path().join("data"),
        commit: Some("abc123".to_string()),
        welcome_banner: Some("welcome to the test bench".to_string()),
        log_level: "debug".to_string(),
        nls_config: r#"{"locale":"en","availableLanguages":{}}"#.to_string(),
    };
    let state = AppState::new(config);

    let server_state = state.clone();
    tokio::spawn(async move {
        let _ = serve(listener, server_state).await;
    });

    TestHarness {
        addr,
        state,
        app_root,
        user_root,
    }
}

/// Send a hand-written upgrade request and return the raw response head.
pub async fn upgrade_response_head(addr: SocketAddr, target: &str, extra_headers: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = format!(
        "GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\n{extra_headers}\r\n",
    );
    stream.write_all(request.as_bytes()).await.expect("send upgrade");
    read_head(&mut stream).await.0
}

async fn read_head(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut collected: Vec<u8> = Vec::new();
    loop {
        if let Some(pos) = collected.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&collected[..pos + 4]).into_owned();
            let rest = collected[pos + 4..].to_vec();
            return (head, rest);
        }
        let mut chunk = [0u8; 4096];
        let n = time::timeout(TIMEOUT, stream.read(&mut chunk))
            .await
            .expect("head read timeout")
            .expect("head read");
        if n == 0 {
            return (String::from_utf8_lossy(&collected).into_owned(), Vec::new());
        }
        collected.extend_from_slice(&chunk[..n]);
    }
}

/// A raw-protocol client (`skipWebSocketFrames=true`): persistent-protocol
/// messages straight over TCP after the upgrade.
pub struct RawClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl RawClient {
    /// Connect and upgrade; `query` must include the reconnection token.
    pub async fn connect(addr: SocketAddr, query: &str) -> RawClient {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!(
            "GET /?{query}&skipWebSocketFrames=true HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        );
        stream.write_all(request.as_bytes()).await.expect("send upgrade");
        let (head, rest) = read_head(&mut stream).await;
        assert!(
            head.starts_with("HTTP/1.1 101"),
            "expected 101 upgrade, got: {head}"
        );
        RawClient { stream, buf: rest }
    }

    pub async fn send_control(&mut self, payload: &Value) {
        let wire = encode_message(kinds::CONTROL, 0, 0, payload.to_string().as_bytes());
        self.stream.write_all(&wire).await.expect("send control");
    }

    pub async fn send_regular(&mut self, id: u32, payload: &[u8]) {
        let wire = encode_message(kinds::REGULAR, id, 0, payload);
        self.stream.write_all(&wire).await.expect("send regular");
    }

    pub async fn send_disconnect(&mut self) {
        let wire = encode_message(kinds::DISCONNECT, 0, 0, &[]);
        self.stream.write_all(&wire).await.expect("send disconnect");
    }

    /// Next protocol message of any kind.
    pub async fn next_message(&mut self) -> (u8, u32, u32, Vec<u8>) {
        loop {
            if self.buf.len() >= HEADER_LEN {
                let len = u32::from_be_bytes([self.buf[9], self.buf[10], self.buf[11], self.buf[12]])
                    as usize;
                if self.buf.len() >= HEADER_LEN + len {
                    let kind = self.buf[0];
                    let id =
                        u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
                    let ack =
                        u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]);
                    let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
                    self.buf.drain(..HEADER_LEN + len);
                    return (kind, id, ack, payload);
                }
            }
            let mut chunk = [0u8; 8192];
            let n = time::timeout(TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("message read timeout")
                .expect("message read");
            assert!(n > 0, "connection closed while waiting for a message");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Next message that is not an ack or keep-alive.
    pub async fn next_data_message(&mut self) -> (u8, u32, u32, Vec<u8>) {
        loop {
            let (kind, id, ack, payload) = self.next_message().await;
            if kind != kinds::ACK && kind != kinds::KEEP_ALIVE {
                return (kind, id, ack, payload);
            }
        }
    }

    pub async fn expect_control(&mut self) -> Value {
        let (kind, _, _, payload) = self.next_data_message().await;
        assert_eq!(kind, kinds::CONTROL, "expected a control message");
        serde_json::from_slice(&payload).expect("control json")
    }

    pub async fn expect_regular(&mut self) -> (u32, Value) {
        let (kind, id, _, payload) = self.next_data_message().await;
        assert_eq!(kind, kinds::REGULAR, "expected a regular message");
        (id, serde_json::from_slice(&payload).expect("regular json"))
    }

    /// `auth` → `sign` → `connectionType` as a workbench client would.
    pub async fn handshake(&mut self, connection_type: u8, commit: &str, args: Value) -> Value {
        self.send_control(&serde_json::json!({ "type": "auth", "auth": "" }))
            .await;
        let sign = self.expect_control().await;
        assert_eq!(sign["type"], "sign");
        let mut connection = serde_json::json!({
            "type": "connectionType",
            "desiredConnectionType": connection_type,
            "commit": commit,
        });
        if !args.is_null() {
            connection["args"] = args;
        }
        self.send_control(&connection).await;
        self.expect_control().await
    }

    /// Half-close from the client side, leaving the session dormant.
    pub async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Connect a tungstenite WebSocket client to the gateway.
pub async fn ws_connect(
    addr: SocketAddr,
    query: &str,
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let url = format!("ws://{addr}/?{query}");
    let (ws, _response) = tokio_tungstenite::connect_async(&url).await.expect("ws connect");
    ws
}

pub mod ws_proto {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio_tungstenite::tungstenite;

    use workbench_gateway::protocol::persistent::{encode_message, kinds, HEADER_LEN};

    use super::TIMEOUT;

    pub type WsStream = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    pub async fn send(ws: &mut WsStream, kind: u8, id: u32, payload: &[u8]) {
        let wire = encode_message(kind, id, 0, payload);
        ws.send(tungstenite::Message::Binary(wire.into()))
            .await
            .expect("ws send");
    }

    pub async fn send_control(ws: &mut WsStream, payload: &Value) {
        send(ws, kinds::CONTROL, 0, payload.to_string().as_bytes()).await;
    }

    /// Read the next protocol message (one per binary frame).
    pub async fn next(ws: &mut WsStream) -> (u8, u32, u32, Vec<u8>) {
        loop {
            let message = tokio::time::timeout(TIMEOUT, ws.next())
                .await
                .expect("ws message timeout")
                .expect("ws stream ended")
                .expect("ws read");
            let data = match message {
                tungstenite::Message::Binary(data) => data,
                tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
                other => panic!("unexpected ws message: {other:?}"),
            };
            assert!(data.len() >= HEADER_LEN, "short protocol message");
            let kind = data[0];
            if kind == kinds::ACK || kind == kinds::KEEP_ALIVE {
                continue;
            }
            let id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
            let ack = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
            let payload = data[HEADER_LEN..].to_vec();
            return (kind, id, ack, payload);
        }
    }

    pub async fn expect_control(ws: &mut WsStream) -> Value {
        let (kind, _, _, payload) = next(ws).await;
        assert_eq!(kind, kinds::CONTROL);
        serde_json::from_slice(&payload).expect("control json")
    }

    pub async fn expect_regular(ws: &mut WsStream) -> (u32, Value) {
        let (kind, id, _, payload) = next(ws).await;
        assert_eq!(kind, kinds::REGULAR);
        (id, serde_json::from_slice(&payload).expect("regular json"))
    }

    /// Full client handshake over the websocket.
    pub async fn handshake(ws: &mut WsStream, connection_type: u8, args: Value) -> Value {
        send_control(ws, &serde_json::json!({ "type": "auth", "auth": "" })).await;
        let sign = expect_control(ws).await;
        assert_eq!(sign["type"], "sign");
        let mut connection = serde_json::json!({
            "type": "connectionType",
            "desiredConnectionType": connection_type,
            "commit": "abc123",
        });
        if !args.is_null() {
            connection["args"] = args;
        }
        send_control(ws, &connection).await;
        expect_control(ws).await
    }
}
