//! Extension-host sessions: one resident actor per token that owns the
//! worker process across socket reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::exthost::{Supervisor, SupervisorEvent};
use crate::protocol::messages::ExtHostStartParams;
use crate::protocol::PersistentProtocol;

use super::registry::SessionRegistry;

pub enum ExtHostCommand {
    /// A reconnecting client: capture a fresh initial data chunk from this
    /// protocol and repeat the hand-off. `ok` was already sent on it.
    Reconnect {
        protocol: PersistentProtocol<TcpStream>,
        debug_port: Option<u16>,
    },
    Dispose,
}

pub struct ExtHostSession {
    pub token: String,
    mailbox: mpsc::Sender<ExtHostCommand>,
    worker_pid: Mutex<Option<u32>>,
    disposed: AtomicBool,
}

impl ExtHostSession {
    pub fn new(token: String) -> (Arc<Self>, mpsc::Receiver<ExtHostCommand>) {
        let (mailbox, rx) = mpsc::channel(4);
        (
            Arc::new(Self {
                token,
                mailbox,
                worker_pid: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn worker_pid(&self) -> Option<u32> {
        *self.worker_pid.lock()
    }

    fn set_worker_pid(&self, pid: u32) {
        *self.worker_pid.lock() = Some(pid);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn set_disposed(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub async fn reconnect(
        &self,
        protocol: PersistentProtocol<TcpStream>,
        debug_port: Option<u16>,
    ) -> bool {
        self.mailbox
            .send(ExtHostCommand::Reconnect {
                protocol,
                debug_port,
            })
            .await
            .is_ok()
    }

    pub fn request_dispose(&self) {
        let _ = self.mailbox.try_send(ExtHostCommand::Dispose);
    }
}

enum Step {
    Command(Option<ExtHostCommand>),
    Event(Result<SupervisorEvent, crate::exthost::supervisor::SupervisorError>),
}

/// Resident loop of one extension-host session: quiesce the handshake
/// protocol, fork the worker, wait for IPC-ready, ship the socket, then keep
/// owning the worker across reconnects until it exits.
#[allow(clippy::too_many_arguments)]
pub async fn run_exthost_session(
    session: Arc<ExtHostSession>,
    mut commands: mpsc::Receiver<ExtHostCommand>,
    registry: Arc<SessionRegistry<ExtHostSession>>,
    config: Arc<Config>,
    params: ExtHostStartParams,
    debug_port: Option<u16>,
    protocol: PersistentProtocol<TcpStream>,
    log_level: String,
) {
    let prefix: String = session.token.chars().take(8).collect();

    let handoff = match Supervisor::connect(protocol, debug_port).await {
        Ok(handoff) => handoff,
        Err(err) => {
            tracing::warn!(%prefix, %err, "extension host connect failed");
            registry.remove(&session.token);
            return;
        }
    };
    let mut supervisor =
        match Supervisor::spawn(&config, &params, debug_port, &log_level, prefix.clone()) {
            Ok(supervisor) => supervisor,
            Err(err) => {
                tracing::error!(%prefix, %err, "extension host fork failed");
                registry.remove(&session.token);
                return;
            }
        };
    session.set_worker_pid(supervisor.pid());
    if let Err(err) = supervisor.install_handoff(handoff).await {
        tracing::error!(%prefix, %err, "initial hand-off failed");
        supervisor.dispose();
        session.set_disposed();
        registry.remove(&session.token);
        return;
    }

    loop {
        let step = tokio::select! {
            command = commands.recv() => Step::Command(command),
            event = supervisor.next_event() => Step::Event(event),
        };

        match step {
            Step::Command(Some(ExtHostCommand::Reconnect {
                protocol,
                debug_port,
            })) => match supervisor.reconnect(protocol, debug_port).await {
                Ok(()) => {
                    tracing::info!(%prefix, pid = supervisor.pid(), "extension host socket reattached");
                }
                Err(err) => {
                    tracing::warn!(%prefix, %err, "extension host reconnect failed");
                }
            },
            Step::Command(Some(ExtHostCommand::Dispose)) | Step::Command(None) => {
                tracing::info!(%prefix, "extension host session disposed");
                break;
            }
            Step::Event(Ok(SupervisorEvent::Ready)) => {
                if let Err(err) = supervisor.flush_pending().await {
                    tracing::error!(%prefix, %err, "socket hand-off failed");
                    break;
                }
                tracing::info!(%prefix, pid = supervisor.pid(), "extension host ipc ready");
            }
            Step::Event(Ok(SupervisorEvent::Console { severity, message })) => {
                match severity.as_str() {
                    "error" => tracing::error!(%prefix, "exthost console: {message}"),
                    "warn" => tracing::warn!(%prefix, "exthost console: {message}"),
                    _ => tracing::info!(%prefix, "exthost console: {message}"),
                }
            }
            Step::Event(Ok(SupervisorEvent::Exited(status))) => {
                tracing::info!(%prefix, %status, "extension host exited");
                break;
            }
            Step::Event(Ok(SupervisorEvent::IpcClosed)) => {
                tracing::warn!(%prefix, "extension host closed its ipc channel");
                break;
            }
            Step::Event(Err(err)) => {
                tracing::error!(%prefix, %err, "extension host supervision error");
                break;
            }
        }
    }

    supervisor.dispose();
    session.set_disposed();
    registry.remove(&session.token);
    tracing::info!(%prefix, "extension host session ended");
}
