//! Minimal extension-host worker speaking the gateway's IPC contract.
//!
//! Used by the integration tests and for local smoke runs: it reports ready
//! on fd 3, accepts `VSCODE_EXTHOST_IPC_SOCKET` hand-offs (recording each one
//! to the file named by `EXTHOST_SMOKE_OUT`), and answers on the received
//! socket with a persistent-protocol control message so the other end can
//! verify the descriptor really moved.

use std::io::Write;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

use workbench_gateway::exthost::fd::recv_with_fd;
use workbench_gateway::protocol::persistent::{encode_message, kinds};

use workbench_common::ipc::{GatewayToWorker, IPC_SOCKET_FD};

fn main() {
    let ipc = unsafe { UnixStream::from_raw_fd(IPC_SOCKET_FD) };
    let mut ipc_writer = ipc.try_clone().expect("clone ipc socket");

    // A console entry first, then ready, in the order the gateway expects to
    // tolerate.
    let console = serde_json::json!({
        "type": "__$console",
        "severity": "log",
        "arguments": "[\"smoke worker booted\"]",
    });
    writeln!(ipc_writer, "{console}").expect("write console line");
    writeln!(ipc_writer, "{}", serde_json::json!({ "type": "VSCODE_EXTHOST_IPC_READY" }))
        .expect("write ready line");

    let record_path = std::env::var("EXTHOST_SMOKE_OUT").ok();
    let mut buf = vec![0u8; 64 * 1024];
    let mut held_sockets: Vec<std::net::TcpStream> = Vec::new();

    loop {
        let (n, fds) = match recv_with_fd(ipc.as_raw_fd(), &mut buf) {
            Ok(result) => result,
            Err(err) => {
                eprintln!("smoke worker recv error: {err}");
                std::process::exit(1);
            }
        };
        if n == 0 {
            // Gateway closed the channel; orderly exit.
            std::process::exit(0);
        }

        for line in buf[..n].split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
            let message: GatewayToWorker = match serde_json::from_slice(line) {
                Ok(message) => message,
                Err(err) => {
                    eprintln!("smoke worker: unparseable ipc line: {err}");
                    continue;
                }
            };
            let GatewayToWorker::IpcSocket {
                initial_data_chunk,
                skip_websocket_frames,
                permessage_deflate,
                inflate_bytes,
            } = message;

            let socket_fd: Option<RawFd> = fds.first().copied();
            if let Some(path) = &record_path {
                let record = serde_json::json!({
                    "pid": std::process::id(),
                    "initialDataChunk": initial_data_chunk,
                    "skipWebSocketFrames": skip_websocket_frames,
                    "permessageDeflate": permessage_deflate,
                    "inflateBytes": inflate_bytes,
                    "fdReceived": socket_fd.is_some(),
                });
                if let Ok(mut file) = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                {
                    let _ = writeln!(file, "{record}");
                }
            }

            if let Some(fd) = socket_fd {
                let mut socket = unsafe { std::net::TcpStream::from_raw_fd(fd) };
                if skip_websocket_frames {
                    // Raw-protocol clients can hear us directly: confirm the
                    // hand-off on the wire.
                    let payload = serde_json::json!({
                        "type": "smokeAck",
                        "initialDataChunk": initial_data_chunk,
                    });
                    let wire =
                        encode_message(kinds::CONTROL, 0, 0, payload.to_string().as_bytes());
                    let _ = socket.write_all(&wire);
                    let _ = socket.flush();
                }
                held_sockets.push(socket);
            }
        }
    }
}
