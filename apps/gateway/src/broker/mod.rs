//! The session broker: WebSocket upgrade, the `auth`/`connectionType`
//! handshake, and routing to the management or extension-host path.

pub mod exthost;
pub mod management;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::channels::debug::ExtensionHostDebugChannel;
use crate::channels::env::RemoteExtensionsEnvironmentChannel;
use crate::channels::extensions::ExtensionManagementChannel;
use crate::channels::logger::{LogLevelChannel, LoggerChannel};
use crate::channels::terminal::RemoteTerminalChannel;
use crate::channels::{RpcDispatcher, SessionContext};
use crate::exthost::ports;
use crate::http::head::{QueryError, RequestHead, UpgradeQuery};
use crate::protocol::messages::{
    ClientControl, ConnectionType, ExtHostStartParams, ServerControl,
};
use crate::protocol::{PersistentProtocol, ProtocolEvent};
use crate::ws;
use crate::AppState;

use exthost::{run_exthost_session, ExtHostSession};
use management::{run_management_session, ManagementSession};

/// A client that never completes `auth`/`connectionType` is cut off.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Entry point for an upgrade request plucked off the accept loop.
pub async fn handle_upgrade(
    mut stream: TcpStream,
    head: RequestHead,
    leftover: BytesMut,
    state: AppState,
) {
    let query = match UpgradeQuery::parse(&head) {
        Ok(query) => query,
        Err(err) => {
            tracing::debug!(%err, "rejecting upgrade with bad query");
            let reason = match err {
                QueryError::MissingToken => "missing `reconnectionToken`",
                QueryError::DuplicateToken => "`reconnectionToken` supplied more than once",
            };
            let response = format!(
                "HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                reason.len(),
                reason
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
            return;
        }
    };

    let authority = crate::http::derive_authority(
        head.header("host"),
        head.header("x-forwarded-proto"),
    )
    .unwrap_or_else(|| format!("localhost:{}", state.config.port));

    let prefix: String = query.reconnection_token.chars().take(8).collect();
    tracing::debug!(
        %prefix,
        reconnection = query.reconnection,
        skip_frames = query.skip_websocket_frames,
        "websocket upgrade"
    );

    let upgraded =
        match ws::accept_upgrade(stream, &head, leftover, query.skip_websocket_frames).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::debug!(%prefix, %err, "upgrade failed");
                return;
            }
        };

    let mut protocol = PersistentProtocol::new(upgraded.link);

    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, run_handshake(&mut protocol)).await;
    let outcome = match handshake {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(HandshakeError::Closed)) => {
            tracing::debug!(%prefix, "connection closed during handshake");
            return;
        }
        Ok(Err(HandshakeError::Protocol(reason))) => {
            abort(&mut protocol, reason).await;
            return;
        }
        Err(_elapsed) => {
            abort(&mut protocol, "Handshake timed out").await;
            return;
        }
    };

    if let (Some(server), Some(client)) = (state.config.commit.as_deref(), outcome.commit.as_deref())
    {
        if server != client {
            // Mismatch is tolerated; the client takes its chances.
            tracing::warn!(%prefix, client, server, "client/server commit mismatch");
        }
    }

    match outcome.connection_type {
        ConnectionType::Management => {
            handle_management(protocol, query, authority, state, prefix).await;
        }
        ConnectionType::ExtensionHost => {
            handle_extension_host(protocol, query, outcome.args, state, prefix).await;
        }
        ConnectionType::Tunnel => {
            // Accepted and ignored: reply ok, then drain until close.
            tracing::info!(%prefix, "tunnel connection accepted (no-op)");
            let _ = protocol.send_control(&ServerControl::Ok.to_bytes()).await;
            while let Ok(Some(_)) = protocol.read_event().await {}
        }
    }
}

struct HandshakeOutcome {
    connection_type: ConnectionType,
    commit: Option<String>,
    args: Option<Value>,
}

enum HandshakeError {
    Closed,
    Protocol(&'static str),
}

/// Linear handshake state machine: `auth` → `sign` reply → `connectionType`.
async fn run_handshake(
    protocol: &mut PersistentProtocol<TcpStream>,
) -> Result<HandshakeOutcome, HandshakeError> {
    let mut authed = false;
    loop {
        let event = protocol
            .read_event()
            .await
            .map_err(|_| HandshakeError::Closed)?;
        let payload = match event {
            Some(ProtocolEvent::Control(payload)) => payload,
            Some(ProtocolEvent::Regular(_)) => {
                return Err(HandshakeError::Protocol(
                    "Unexpected regular message during handshake",
                ));
            }
            Some(ProtocolEvent::Disconnect) | None => return Err(HandshakeError::Closed),
        };

        let message: ClientControl = match serde_json::from_slice(&payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(%err, "unparseable handshake control message");
                return Err(HandshakeError::Protocol("Malformed handshake message"));
            }
        };

        match message {
            ClientControl::Auth { .. } => {
                if authed {
                    return Err(HandshakeError::Protocol("Duplicate `auth` message"));
                }
                authed = true;
                // Placeholder contract: no signing is performed.
                let sign = ServerControl::Sign {
                    data: String::new(),
                };
                protocol
                    .send_control(&sign.to_bytes())
                    .await
                    .map_err(|_| HandshakeError::Closed)?;
            }
            ClientControl::ConnectionType {
                desired_connection_type,
                commit,
                args,
            } => {
                if !authed {
                    return Err(HandshakeError::Protocol("Expected `auth` first"));
                }
                let connection_type = ConnectionType::from_wire(desired_connection_type)
                    .ok_or(HandshakeError::Protocol("Unknown connection type"))?;
                return Ok(HandshakeOutcome {
                    connection_type,
                    commit,
                    args,
                });
            }
        }
    }
}

async fn handle_management(
    mut protocol: PersistentProtocol<TcpStream>,
    query: UpgradeQuery,
    authority: String,
    state: AppState,
    prefix: String,
) {
    let token = query.reconnection_token.clone();
    match state.management.lookup(&token) {
        None if query.reconnection => {
            abort(&mut protocol, "Asking to reconnect but provided token is unknown").await;
        }
        Some(existing) => {
            // A resident entry always takes the reconnect path, whether or
            // not the client set `reconnection`. The resident actor replies
            // `ok` on the swapped-in protocol and replays unacked output.
            let (link, residual) = protocol.into_reconnect_parts();
            if !existing.reconnect(link, residual).await {
                tracing::warn!(%prefix, "resident session gone during reconnect");
            }
        }
        None => {
            let (session, commands) = ManagementSession::new(token.clone());
            state.management.register(token.clone(), session.clone());

            if protocol
                .send_control(&ServerControl::Ok.to_bytes())
                .await
                .is_err()
            {
                state.management.remove(&token);
                return;
            }

            // The client-connected event: wire the channel dispatcher up to
            // this session.
            let (outbound_tx, outbound_rx) = mpsc::channel(64);
            let ctx = SessionContext::new(authority, token);
            let dispatcher = build_dispatcher(&state, ctx, outbound_tx);
            run_management_session(
                session,
                protocol,
                commands,
                dispatcher,
                outbound_rx,
                state.management.clone(),
            )
            .await;
        }
    }
}

async fn handle_extension_host(
    mut protocol: PersistentProtocol<TcpStream>,
    query: UpgradeQuery,
    args: Option<Value>,
    state: AppState,
    prefix: String,
) {
    let token = query.reconnection_token.clone();
    let params = ExtHostStartParams::from_args(args.as_ref());

    match state.exthost.lookup(&token) {
        None if query.reconnection => {
            abort(&mut protocol, "Asking to reconnect but provided token is unknown").await;
        }
        Some(existing) => {
            // A resident entry always routes to the worker, whether or not
            // the client set `reconnection`.
            if existing.worker_pid().is_none() {
                abort(&mut protocol, "Extension host is not defined").await;
                return;
            }
            // `ok` must go out while the gateway still owns the socket.
            if protocol
                .send_control(&ServerControl::Ok.to_bytes())
                .await
                .is_err()
            {
                return;
            }
            let debug_port = params.debug_port.filter(|port| *port != 0);
            if !existing.reconnect(protocol, debug_port).await {
                tracing::warn!(%prefix, "extension host session gone during reconnect");
            }
        }
        None => {
            let debug_port = match params.debug_port {
                Some(0) => match ports::find_free_port().await {
                    Some(port) => Some(port),
                    None => {
                        abort(&mut protocol, "Could not allocate a free debug port").await;
                        return;
                    }
                },
                other => other,
            };

            let (session, commands) = ExtHostSession::new(token.clone());
            state.exthost.register(token.clone(), session.clone());

            if protocol
                .send_control(&ServerControl::Ok.to_bytes())
                .await
                .is_err()
            {
                state.exthost.remove(&token);
                return;
            }

            run_exthost_session(
                session,
                commands,
                state.exthost.clone(),
                state.config.clone(),
                params,
                debug_port,
                protocol,
                state.log_level.as_str().to_string(),
            )
            .await;
        }
    }
}

/// Register the channel surface for one management session.
fn build_dispatcher(
    state: &AppState,
    ctx: SessionContext,
    outbound_tx: mpsc::Sender<Vec<u8>>,
) -> RpcDispatcher {
    let mut dispatcher = RpcDispatcher::new(ctx, outbound_tx);
    dispatcher.register("logLevel", Arc::new(LogLevelChannel::new(state.log_level.clone())));
    dispatcher.register("logger", Arc::new(LoggerChannel));
    dispatcher.register(
        "remoteextensionsenvironment",
        Arc::new(RemoteExtensionsEnvironmentChannel::new(
            state.config.clone(),
            state.scanner.clone(),
        )),
    );
    dispatcher.register("remotefilesystem", state.filesystem.clone());
    dispatcher.register("remoteterminal", Arc::new(RemoteTerminalChannel));
    dispatcher.register(
        "extensions",
        Arc::new(ExtensionManagementChannel::new(state.scanner.clone())),
    );
    dispatcher.register(
        "extensionHostDebugBroadcast",
        Arc::new(ExtensionHostDebugChannel::new(state.debug_hub.clone())),
    );
    dispatcher
}

/// Abort contract: `{type:"error",reason}` on the control channel, drain,
/// close.
async fn abort(protocol: &mut PersistentProtocol<TcpStream>, reason: &str) {
    tracing::debug!(reason, "aborting connection");
    let error = ServerControl::Error {
        reason: reason.to_string(),
    };
    let _ = protocol.send_control(&error.to_bytes()).await;
    let _ = protocol.drain().await;
    protocol.close().await;
}
