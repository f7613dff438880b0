//! The persistent protocol: length-prefixed, sequenced messages with a
//! replayable send buffer, carried over a [`SocketLink`].
//!
//! Wire format per message: a 13-byte big-endian header
//! `[kind: u8, id: u32, ack: u32, len: u32]` followed by `len` payload bytes.
//! Regular messages consume an id; control, ack and keep-alive messages carry
//! id 0. Every outbound header acknowledges the highest regular id received,
//! and regular receipt additionally triggers an explicit ack message so the
//! peer can prune promptly on quiet connections.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::ws::{SocketError, SocketLink};

pub const HEADER_LEN: usize = 13;

/// Unacknowledged outgoing bytes beyond this kill the session.
const MAX_UNACKED_BYTES: usize = 16 * 1024 * 1024;

const KIND_NONE: u8 = 0;
const KIND_REGULAR: u8 = 1;
const KIND_CONTROL: u8 = 2;
const KIND_ACK: u8 = 3;
const KIND_DISCONNECT: u8 = 5;
const KIND_KEEP_ALIVE: u8 = 8;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("outgoing send buffer exceeded {MAX_UNACKED_BYTES} unacknowledged bytes")]
    SendBufferFull,
}

/// Events surfaced to the session owner.
#[derive(Debug)]
pub enum ProtocolEvent {
    /// A sequenced application message.
    Regular(Vec<u8>),
    /// An out-of-band control message (handshake traffic).
    Control(Vec<u8>),
    /// The peer asked for an orderly teardown.
    Disconnect,
}

struct Unacked {
    id: u32,
    payload: Vec<u8>,
}

/// Pieces handed to the extension-host worker at socket transfer time.
pub struct HandoffParts<S> {
    pub stream: S,
    /// Protocol bytes received but not yet consumed.
    pub initial_data: Vec<u8>,
    /// Decompressed tail seeding the worker's inflater (empty without deflate).
    pub recorded_inflate: Vec<u8>,
    pub deflate_enabled: bool,
    pub was_websocket: bool,
}

pub struct PersistentProtocol<S> {
    link: SocketLink<S>,
    incoming: BytesMut,
    out_id: u32,
    in_id: u32,
    unacked: VecDeque<Unacked>,
    unacked_bytes: usize,
    /// While paused (socket lost, awaiting reconnect) sends only buffer.
    paused: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PersistentProtocol<S> {
    pub fn new(link: SocketLink<S>) -> Self {
        Self {
            link,
            incoming: BytesMut::new(),
            out_id: 0,
            in_id: 0,
            unacked: VecDeque::new(),
            unacked_bytes: 0,
            paused: false,
        }
    }

    pub fn deflate_enabled(&self) -> bool {
        self.link.deflate_enabled()
    }

    pub fn is_websocket(&self) -> bool {
        self.link.is_websocket()
    }

    /// Read the next protocol event. `Ok(None)` means the socket closed.
    pub async fn read_event(&mut self) -> Result<Option<ProtocolEvent>, ProtocolError> {
        loop {
            while let Some((kind, id, ack, payload)) = self.parse_message() {
                self.prune_acked(ack);
                match kind {
                    KIND_REGULAR => {
                        self.in_id = id;
                        return Ok(Some(ProtocolEvent::Regular(payload)));
                    }
                    KIND_CONTROL => return Ok(Some(ProtocolEvent::Control(payload))),
                    KIND_DISCONNECT => return Ok(Some(ProtocolEvent::Disconnect)),
                    KIND_ACK | KIND_KEEP_ALIVE | KIND_NONE => {}
                    other => {
                        tracing::debug!(kind = other, "ignoring unknown protocol message kind");
                    }
                }
            }
            match self.link.read_chunk().await? {
                Some(chunk) => self.incoming.extend_from_slice(&chunk),
                None => return Ok(None),
            }
        }
    }

    /// Send a sequenced application message; it stays buffered until acked.
    /// While paused the message is buffered only, awaiting replay.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.out_id = self.out_id.wrapping_add(1);
        let id = self.out_id;
        self.unacked_bytes += payload.len();
        self.unacked.push_back(Unacked {
            id,
            payload: payload.to_vec(),
        });
        if self.unacked_bytes > MAX_UNACKED_BYTES {
            return Err(ProtocolError::SendBufferFull);
        }
        if self.paused {
            return Ok(());
        }
        self.write_message(KIND_REGULAR, id, payload).await
    }

    /// Send a control message (never buffered, never replayed; dropped while
    /// paused).
    pub async fn send_control(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        if self.paused {
            tracing::debug!("dropping control message on paused protocol");
            return Ok(());
        }
        self.write_message(KIND_CONTROL, 0, payload).await
    }

    /// Acknowledge everything received so far with an explicit ack message.
    pub async fn send_ack(&mut self) -> Result<(), ProtocolError> {
        if self.paused {
            return Ok(());
        }
        self.write_message(KIND_ACK, 0, &[]).await
    }

    /// Stop writing to the (lost) socket; sends buffer until a reconnect
    /// swaps a live socket back in.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Ask the peer for an orderly teardown.
    pub async fn send_disconnect(&mut self) -> Result<(), ProtocolError> {
        self.write_message(KIND_DISCONNECT, 0, &[]).await
    }

    /// Bytes sent but not yet acknowledged by the peer.
    pub fn unacked_len(&self) -> usize {
        self.unacked_bytes
    }

    /// Drain every buffered-but-unconsumed incoming byte.
    pub fn read_entire_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.incoming).to_vec()
    }

    /// Swap in a new socket after a reconnect. `residual` holds protocol
    /// bytes the new connection's wrapper had already pulled off its socket.
    pub fn begin_accept_reconnection(&mut self, link: SocketLink<S>, residual: &[u8]) {
        self.link = link;
        self.paused = false;
        self.incoming.extend_from_slice(residual);
    }

    /// Replay every unacknowledged message on the new socket, oldest first.
    pub async fn end_accept_reconnection(&mut self) -> Result<(), ProtocolError> {
        let pending: Vec<(u32, Vec<u8>)> = self
            .unacked
            .iter()
            .map(|m| (m.id, m.payload.clone()))
            .collect();
        for (id, payload) in pending {
            self.write_message(KIND_REGULAR, id, &payload).await?;
        }
        Ok(())
    }

    /// Flush pending socket writes down to the kernel.
    pub async fn drain(&mut self) -> Result<(), ProtocolError> {
        self.link.drain().await?;
        Ok(())
    }

    /// Close the underlying socket politely.
    pub async fn close(&mut self) {
        let _ = self.link.close(1000).await;
    }

    /// Tear the protocol apart for the extension-host hand-off.
    ///
    /// In raw mode any undecoded socket bytes are protocol bytes and join the
    /// initial data chunk. In WebSocket mode the client is quiesced awaiting
    /// our reply at hand-off time, so no partial frame is in flight.
    pub fn into_handoff(self) -> HandoffParts<S> {
        let deflate_enabled = self.link.deflate_enabled();
        let was_websocket = self.link.is_websocket();
        let recorded_inflate = self.link.recorded_inflate_bytes();
        let mut initial_data = self.incoming.to_vec();
        let (stream, leftover) = self.link.into_parts();
        if !was_websocket {
            initial_data.extend_from_slice(&leftover);
        } else if !leftover.is_empty() {
            tracing::warn!(
                bytes = leftover.len(),
                "undecoded websocket bytes at hand-off; client broke quiescence"
            );
        }
        HandoffParts {
            stream,
            initial_data,
            recorded_inflate,
            deflate_enabled,
            was_websocket,
        }
    }

    /// Tear the protocol apart for a reconnect hand-over to a resident
    /// session: returns the link and the residual protocol bytes.
    pub fn into_reconnect_parts(mut self) -> (SocketLink<S>, Vec<u8>) {
        let residual = self.read_entire_buffer();
        (self.link, residual)
    }

    fn parse_message(&mut self) -> Option<(u8, u32, u32, Vec<u8>)> {
        if self.incoming.len() < HEADER_LEN {
            return None;
        }
        let kind = self.incoming[0];
        let id = u32::from_be_bytes([
            self.incoming[1],
            self.incoming[2],
            self.incoming[3],
            self.incoming[4],
        ]);
        let ack = u32::from_be_bytes([
            self.incoming[5],
            self.incoming[6],
            self.incoming[7],
            self.incoming[8],
        ]);
        let len = u32::from_be_bytes([
            self.incoming[9],
            self.incoming[10],
            self.incoming[11],
            self.incoming[12],
        ]) as usize;
        if self.incoming.len() < HEADER_LEN + len {
            return None;
        }
        self.incoming.advance(HEADER_LEN);
        let payload = self.incoming.split_to(len).to_vec();
        Some((kind, id, ack, payload))
    }

    fn prune_acked(&mut self, ack: u32) {
        while let Some(front) = self.unacked.front() {
            if front.id <= ack {
                self.unacked_bytes -= front.payload.len();
                self.unacked.pop_front();
            } else {
                break;
            }
        }
    }

    async fn write_message(&mut self, kind: u8, id: u32, payload: &[u8]) -> Result<(), ProtocolError> {
        let mut wire = Vec::with_capacity(HEADER_LEN + payload.len());
        wire.push(kind);
        wire.extend_from_slice(&id.to_be_bytes());
        wire.extend_from_slice(&self.in_id.to_be_bytes());
        wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        wire.extend_from_slice(payload);
        self.link.write_chunk(&wire).await?;
        Ok(())
    }
}

/// Encode one protocol message; shared with the test clients and the smoke
/// worker, which speak the client side of the wire.
pub fn encode_message(kind: u8, id: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(HEADER_LEN + payload.len());
    wire.push(kind);
    wire.extend_from_slice(&id.to_be_bytes());
    wire.extend_from_slice(&ack.to_be_bytes());
    wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    wire.extend_from_slice(payload);
    wire
}

/// Message kind constants exposed for client-side tooling.
pub mod kinds {
    pub const REGULAR: u8 = super::KIND_REGULAR;
    pub const CONTROL: u8 = super::KIND_CONTROL;
    pub const ACK: u8 = super::KIND_ACK;
    pub const DISCONNECT: u8 = super::KIND_DISCONNECT;
    pub const KEEP_ALIVE: u8 = super::KIND_KEEP_ALIVE;
}
