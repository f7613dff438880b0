//! Management sessions: the resident actor that owns the protocol, serves
//! RPC, and survives socket loss until a reconnect or the TTL sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::channels::RpcDispatcher;
use crate::protocol::{PersistentProtocol, ProtocolError, ProtocolEvent};
use crate::ws::SocketLink;

use super::registry::SessionRegistry;

/// Disconnected sessions are swept after this long without a reconnect.
pub const SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// Cross-task operations on a resident session.
pub enum ManagementCommand {
    /// Swap the new connection's socket in and replay unacked output.
    Reconnect {
        link: SocketLink<TcpStream>,
        residual: Vec<u8>,
    },
    /// Dispose the session explicitly.
    Dispose,
}

pub struct ManagementSession {
    pub token: String,
    mailbox: mpsc::Sender<ManagementCommand>,
    disconnected_at: Mutex<Option<Instant>>,
    disposed: AtomicBool,
}

impl ManagementSession {
    pub fn new(token: String) -> (Arc<Self>, mpsc::Receiver<ManagementCommand>) {
        let (mailbox, rx) = mpsc::channel(4);
        (
            Arc::new(Self {
                token,
                mailbox,
                disconnected_at: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Hand a reconnecting socket over to the resident actor.
    pub async fn reconnect(&self, link: SocketLink<TcpStream>, residual: Vec<u8>) -> bool {
        self.mailbox
            .send(ManagementCommand::Reconnect { link, residual })
            .await
            .is_ok()
    }

    /// Ask the resident actor to dispose (used by the TTL sweeper).
    pub fn request_dispose(&self) {
        let _ = self.mailbox.try_send(ManagementCommand::Dispose);
    }

    pub fn mark_disconnected(&self) {
        *self.disconnected_at.lock() = Some(Instant::now());
    }

    pub fn mark_connected(&self) {
        *self.disconnected_at.lock() = None;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn set_disposed(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    /// Disconnected longer than the TTL.
    pub fn expired(&self, now: Instant) -> bool {
        match *self.disconnected_at.lock() {
            Some(at) => now.duration_since(at) >= SESSION_TTL,
            None => false,
        }
    }
}

enum Step {
    Command(Option<ManagementCommand>),
    Outbound(Option<Vec<u8>>),
    Event(Result<Option<ProtocolEvent>, ProtocolError>),
}

/// The resident loop of one management session. Returns when the session is
/// disposed; the registry entry is dropped on the way out.
pub async fn run_management_session(
    session: Arc<ManagementSession>,
    mut protocol: PersistentProtocol<TcpStream>,
    mut commands: mpsc::Receiver<ManagementCommand>,
    mut dispatcher: RpcDispatcher,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    registry: Arc<SessionRegistry<ManagementSession>>,
) {
    let prefix: String = session.token.chars().take(8).collect();
    tracing::info!(%prefix, "management session established");

    loop {
        let dormant = protocol.is_paused();
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            payload = outbound.recv() => Step::Outbound(payload),
            event = protocol.read_event(), if !dormant => Step::Event(event),
        };

        match step {
            Step::Command(Some(ManagementCommand::Reconnect { link, residual })) => {
                protocol.begin_accept_reconnection(link, &residual);
                let ok = crate::protocol::messages::ServerControl::Ok.to_bytes();
                if let Err(err) = protocol.send_control(&ok).await {
                    tracing::debug!(%prefix, %err, "reconnect reply failed; back to dormant");
                    protocol.pause();
                    session.mark_disconnected();
                    continue;
                }
                if let Err(err) = protocol.end_accept_reconnection().await {
                    tracing::debug!(%prefix, %err, "replay failed; back to dormant");
                    protocol.pause();
                    session.mark_disconnected();
                    continue;
                }
                session.mark_connected();
                tracing::info!(%prefix, "management session reconnected");
            }
            Step::Command(Some(ManagementCommand::Dispose)) | Step::Command(None) => {
                let _ = protocol.send_disconnect().await;
                break;
            }
            Step::Outbound(Some(payload)) => {
                match protocol.send(&payload).await {
                    Ok(()) => {}
                    Err(ProtocolError::Socket(err)) => {
                        // The message stays in the replay buffer.
                        tracing::debug!(%prefix, %err, "write failed; session dormant");
                        protocol.pause();
                        session.mark_disconnected();
                    }
                    Err(err) => {
                        tracing::warn!(%prefix, %err, "management session overflowed");
                        break;
                    }
                }
            }
            Step::Outbound(None) => break,
            Step::Event(Ok(Some(ProtocolEvent::Regular(frame)))) => {
                let replies = dispatcher.handle_frame(&frame).await;
                let mut failed = false;
                for reply in replies {
                    match protocol.send(&reply).await {
                        Ok(()) => {}
                        Err(ProtocolError::Socket(err)) => {
                            tracing::debug!(%prefix, %err, "reply write failed; session dormant");
                            protocol.pause();
                            session.mark_disconnected();
                            failed = true;
                            break;
                        }
                        Err(err) => {
                            tracing::warn!(%prefix, %err, "management session overflowed");
                            failed = true;
                            break;
                        }
                    }
                }
                if !failed {
                    let _ = protocol.send_ack().await;
                }
            }
            Step::Event(Ok(Some(ProtocolEvent::Control(_)))) => {
                tracing::debug!(%prefix, "ignoring control message after handshake");
            }
            Step::Event(Ok(Some(ProtocolEvent::Disconnect))) => {
                tracing::info!(%prefix, "client requested disconnect");
                break;
            }
            Step::Event(Ok(None)) => {
                tracing::debug!(%prefix, "socket lost; session eligible for reconnect");
                protocol.pause();
                session.mark_disconnected();
            }
            Step::Event(Err(err)) => {
                tracing::debug!(%prefix, %err, "protocol error; session dormant");
                protocol.pause();
                session.mark_disconnected();
            }
        }
    }

    // Disposal: no further control or RPC traffic reaches handlers.
    session.set_disposed();
    dispatcher.dispose();
    protocol.close().await;
    registry.remove(&session.token);
    tracing::info!(%prefix, "management session ended");
}
