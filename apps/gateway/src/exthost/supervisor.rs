//! Owns one extension-host worker process and its IPC channel.
//!
//! The worker inherits a `socketpair` end on fd 3 and speaks newline-delimited
//! JSON over it. Once it reports `VSCODE_EXTHOST_IPC_READY`, the gateway ships
//! the client TCP socket (plus residual protocol bytes and, with deflate, the
//! recorded inflate tail) in a single `sendmsg` carrying the fd as
//! `SCM_RIGHTS` ancillary data. The worker outlives any one socket; a
//! reconnect repeats the hand-off with a fresh socket.

use std::os::unix::io::AsRawFd;
use std::process::Stdio;
use std::sync::Arc;

use base64::Engine;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use workbench_common::ipc::{GatewayToWorker, WorkerToGateway, IPC_SOCKET_FD};

use crate::config::Config;
use crate::protocol::messages::ExtHostStartParams;
use crate::protocol::{PersistentProtocol, ProtocolError};

use super::fd;

/// `NEW → STARTED → ATTACHED ⇄ REATTACHING → DEAD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    New,
    Started,
    Attached,
    Reattaching,
    Dead,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker ipc encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Everything needed to hand the client socket to the worker.
pub struct PendingHandoff {
    stream: std::net::TcpStream,
    initial_data_chunk: String,
    skip_websocket_frames: bool,
    permessage_deflate: bool,
    inflate_bytes: String,
}

/// Events the owning session task reacts to.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// Worker IPC loop is up; pending hand-off may be sent.
    Ready,
    /// Forwarded `__$console` entry.
    Console { severity: String, message: String },
    /// Worker exited.
    Exited(std::process::ExitStatus),
    /// Worker closed its IPC end without exiting (treated as fatal).
    IpcClosed,
}

pub struct Supervisor {
    child: Child,
    pid: u32,
    ipc: tokio::net::UnixStream,
    ipc_buf: Vec<u8>,
    state: SupervisorState,
    ready_seen: bool,
    pending: Option<PendingHandoff>,
    log_prefix: String,
}

impl Supervisor {
    /// Quiesce a handshake-complete protocol and capture the hand-off state.
    ///
    /// Sends the `{debugPort}` control so the client learns the allocated
    /// port, drains writes, then tears the protocol down to its socket plus
    /// residual bytes.
    pub async fn connect(
        mut protocol: PersistentProtocol<TcpStream>,
        debug_port: Option<u16>,
    ) -> Result<PendingHandoff, SupervisorError> {
        let announce = match debug_port {
            Some(port) => json!({ "debugPort": port }),
            None => json!({}),
        };
        protocol.send_control(announce.to_string().as_bytes()).await?;
        protocol.drain().await?;

        let parts = protocol.into_handoff();
        let stream = parts.stream.into_std()?;
        // The child inherits the descriptor as-is; leave blocking mode set.
        stream.set_nonblocking(false)?;
        Ok(PendingHandoff {
            stream,
            initial_data_chunk: base64::engine::general_purpose::STANDARD
                .encode(parts.initial_data),
            skip_websocket_frames: !parts.was_websocket,
            permessage_deflate: parts.deflate_enabled,
            inflate_bytes: base64::engine::general_purpose::STANDARD
                .encode(parts.recorded_inflate),
        })
    }

    /// Fork the worker binary with the documented argv and environment.
    pub fn spawn(
        config: &Arc<Config>,
        params: &ExtHostStartParams,
        debug_port: Option<u16>,
        log_level: &str,
        log_prefix: String,
    ) -> Result<Self, SupervisorError> {
        let (parent_end, child_end) = std::os::unix::net::UnixStream::pair()?;
        parent_end.set_nonblocking(true)?;
        let ipc = tokio::net::UnixStream::from_std(parent_end)?;

        let mut command = Command::new(&config.exthost_binary);
        command
            .arg("--type=extensionHost")
            .arg(format!(
                "--uriTransformerPath={}",
                config.uri_transformer_path.display()
            ))
            .env(
                "VSCODE_AMD_ENTRYPOINT",
                "vs/workbench/services/extensions/node/extensionHostProcess",
            )
            .env("VSCODE_PIPE_LOGGING", "true")
            .env("VSCODE_VERBOSE_LOGGING", "true")
            .env("VSCODE_LOG_NATIVE", "false")
            .env("VSCODE_EXTHOST_WILL_SEND_SOCKET", "true")
            .env("VSCODE_HANDLES_UNCAUGHT_ERRORS", "true")
            .env("VSCODE_LOG_STACK", "true")
            .env("VSCODE_NLS_CONFIG", &config.nls_config)
            .env("VSCODE_LOG_LEVEL", log_level)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(port) = debug_port {
            let flag = if params.break_on_entry {
                "--inspect-brk"
            } else {
                "--inspect"
            };
            command.arg(format!("{flag}=0.0.0.0:{port}"));
        }

        let child_fd = child_end.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                // dup2 clears CLOEXEC on the target descriptor.
                if libc::dup2(child_fd, IPC_SOCKET_FD) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        drop(child_end);
        let pid = child.id().unwrap_or_default();

        spawn_output_readers(&mut child, &log_prefix);
        tracing::info!(prefix = %log_prefix, pid, language = %params.language, "extension host forked");

        Ok(Self {
            child,
            pid,
            ipc,
            ipc_buf: Vec::new(),
            state: SupervisorState::Started,
            ready_seen: false,
            pending: None,
            log_prefix,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Queue a hand-off; it is sent now if the worker already reported
    /// ready, or by [`Self::flush_pending`] once it does.
    pub async fn install_handoff(&mut self, handoff: PendingHandoff) -> Result<(), SupervisorError> {
        self.pending = Some(handoff);
        if self.ready_seen {
            self.flush_pending().await?;
        }
        Ok(())
    }

    /// Reconnect with a fresh protocol: capture a new initial data chunk and
    /// repeat the hand-off on the new socket. The worker is untouched.
    pub async fn reconnect(
        &mut self,
        protocol: PersistentProtocol<TcpStream>,
        debug_port: Option<u16>,
    ) -> Result<(), SupervisorError> {
        if self.state == SupervisorState::Attached {
            self.state = SupervisorState::Reattaching;
        }
        let handoff = Self::connect(protocol, debug_port).await?;
        self.install_handoff(handoff).await
    }

    /// Wait for the next worker event.
    ///
    /// This future is dropped freely by the owning task's `select!`; it never
    /// writes, so cancellation cannot corrupt the IPC stream. After a
    /// [`SupervisorEvent::Ready`] the owner must call
    /// [`Self::flush_pending`].
    pub async fn next_event(&mut self) -> Result<SupervisorEvent, SupervisorError> {
        loop {
            if let Some(line) = take_line(&mut self.ipc_buf) {
                match serde_json::from_str::<WorkerToGateway>(&line) {
                    Ok(WorkerToGateway::Ready) => {
                        self.ready_seen = true;
                        return Ok(SupervisorEvent::Ready);
                    }
                    Ok(WorkerToGateway::Console {
                        severity,
                        arguments,
                    }) => {
                        let message =
                            workbench_common::ipc::console_first_argument(&arguments)
                                .unwrap_or_default();
                        return Ok(SupervisorEvent::Console { severity, message });
                    }
                    Err(err) => {
                        tracing::debug!(prefix = %self.log_prefix, %err, %line, "unparseable worker ipc line");
                    }
                }
                continue;
            }

            let mut chunk = [0u8; 4096];
            tokio::select! {
                status = self.child.wait() => {
                    self.state = SupervisorState::Dead;
                    return Ok(SupervisorEvent::Exited(status?));
                }
                read = self.ipc.read(&mut chunk) => match read {
                    Ok(0) => return Ok(SupervisorEvent::IpcClosed),
                    Ok(n) => self.ipc_buf.extend_from_slice(&chunk[..n]),
                    Err(err) => return Err(err.into()),
                },
            }
        }
    }

    /// Kill the worker and mark the supervisor dead. Idempotent.
    pub fn dispose(&mut self) {
        if self.state == SupervisorState::Dead {
            return;
        }
        self.state = SupervisorState::Dead;
        self.pending = None;
        if let Err(err) = self.child.start_kill() {
            tracing::debug!(prefix = %self.log_prefix, %err, "worker already gone at dispose");
        }
    }

    /// Ship the queued socket to the worker, if any. The pending hand-off is
    /// only cleared once the `sendmsg` succeeded.
    pub async fn flush_pending(&mut self) -> Result<(), SupervisorError> {
        let Some(handoff) = self.pending.as_ref() else {
            return Ok(());
        };
        let message = GatewayToWorker::IpcSocket {
            initial_data_chunk: handoff.initial_data_chunk.clone(),
            skip_websocket_frames: handoff.skip_websocket_frames,
            permessage_deflate: handoff.permessage_deflate,
            inflate_bytes: handoff.inflate_bytes.clone(),
        };
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        let socket_fd = handoff.stream.as_raw_fd();

        loop {
            self.ipc.writable().await?;
            match fd::send_with_fd(self.ipc.as_raw_fd(), &line, socket_fd) {
                Ok(_) => break,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err.into()),
            }
        }
        // Dropping the pending stream closes the gateway's copy; the worker
        // owns the duplicated descriptor now.
        self.pending = None;
        self.state = SupervisorState::Attached;
        tracing::debug!(prefix = %self.log_prefix, pid = self.pid, "socket handed to extension host");
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Pop one complete newline-terminated line off the buffer.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = buf.drain(..=pos).collect();
    let trimmed = &line[..line.len() - 1];
    Some(String::from_utf8_lossy(trimmed).into_owned())
}

fn spawn_output_readers(child: &mut Child, log_prefix: &str) {
    if let Some(stdout) = child.stdout.take() {
        let prefix = log_prefix.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(prefix = %prefix, "exthost: {line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let prefix = log_prefix.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(prefix = %prefix, "exthost: {line}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_line_splits_on_newline() {
        let mut buf = b"{\"a\":1}\npartial".to_vec();
        assert_eq!(take_line(&mut buf).as_deref(), Some("{\"a\":1}"));
        assert_eq!(take_line(&mut buf), None);
        assert_eq!(buf, b"partial");
    }
}
