//! Server-side RFC 6455 framing over a raw byte stream.
//!
//! A [`SocketLink`] owns the transport for one session. In WebSocket mode it
//! decodes masked client frames into message payloads and wraps writes into
//! unmasked binary frames; in raw mode (`skipWebSocketFrames`) it is a plain
//! byte pipe. Either way the undecoded remainder and the transport itself can
//! be taken back out for the extension-host hand-off.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::deflate::DeflateState;

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

/// Close codes the gateway emits.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;

/// Frames larger than this are treated as a protocol violation.
const MAX_FRAME_PAYLOAD: u64 = 64 * 1024 * 1024;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket protocol violation: {0}")]
    Protocol(&'static str),
    #[error("websocket payload error: {0}")]
    Payload(String),
}

/// A session transport: the TCP stream plus framing state.
pub struct SocketLink<S> {
    stream: S,
    read_buf: BytesMut,
    mode: LinkMode,
}

enum LinkMode {
    Raw,
    WebSocket(Box<WsState>),
}

struct WsState {
    deflate: Option<DeflateState>,
    fragments: Vec<u8>,
    fragment_started: bool,
    fragment_compressed: bool,
    close_sent: bool,
}

struct Frame {
    fin: bool,
    rsv1: bool,
    opcode: u8,
    payload: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SocketLink<S> {
    /// A raw byte pipe; `initial` holds bytes already read off the stream.
    pub fn raw(stream: S, initial: BytesMut) -> Self {
        Self {
            stream,
            read_buf: initial,
            mode: LinkMode::Raw,
        }
    }

    /// A WebSocket link, optionally with permessage-deflate contexts.
    pub fn websocket(stream: S, initial: BytesMut, deflate: bool) -> Self {
        Self {
            stream,
            read_buf: initial,
            mode: LinkMode::WebSocket(Box::new(WsState {
                deflate: deflate.then(DeflateState::new),
                fragments: Vec::new(),
                fragment_started: false,
                fragment_compressed: false,
                close_sent: false,
            })),
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.mode, LinkMode::WebSocket(_))
    }

    pub fn deflate_enabled(&self) -> bool {
        match &self.mode {
            LinkMode::WebSocket(ws) => ws.deflate.is_some(),
            LinkMode::Raw => false,
        }
    }

    /// The recorded inflate tail, empty when deflate is off.
    pub fn recorded_inflate_bytes(&self) -> Vec<u8> {
        match &self.mode {
            LinkMode::WebSocket(ws) => ws
                .deflate
                .as_ref()
                .map(DeflateState::recorded_inflate_bytes)
                .unwrap_or_default(),
            LinkMode::Raw => Vec::new(),
        }
    }

    /// Read the next chunk of application bytes.
    ///
    /// Returns `Ok(None)` once the peer has closed (close frame or EOF).
    /// Frame-level violations surface as errors after a best-effort close
    /// frame has been written; the caller only needs to drop the link.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, SocketError> {
        match &self.mode {
            LinkMode::Raw => {
                if !self.read_buf.is_empty() {
                    let chunk = self.read_buf.split().freeze();
                    return Ok(Some(chunk.to_vec()));
                }
                let mut chunk = vec![0u8; READ_CHUNK];
                let n = self.stream.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(None);
                }
                chunk.truncate(n);
                Ok(Some(chunk))
            }
            LinkMode::WebSocket(_) => self.read_ws_message().await,
        }
    }

    async fn read_ws_message(&mut self) -> Result<Option<Vec<u8>>, SocketError> {
        loop {
            let frame = match parse_frame(&mut self.read_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    let mut chunk = vec![0u8; READ_CHUNK];
                    let n = self.stream.read(&mut chunk).await?;
                    if n == 0 {
                        return Ok(None);
                    }
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    continue;
                }
                Err(violation) => {
                    self.fail(CLOSE_PROTOCOL_ERROR).await;
                    return Err(SocketError::Protocol(violation));
                }
            };

            match frame.opcode {
                OP_PING => {
                    self.write_frame(OP_PONG, false, &frame.payload).await?;
                }
                OP_PONG => {}
                OP_CLOSE => {
                    let already_sent = {
                        let ws = self.ws_state();
                        let sent = ws.close_sent;
                        ws.close_sent = true;
                        sent
                    };
                    if !already_sent {
                        // Echo the close before reporting end-of-stream.
                        let payload = frame.payload.get(..2).map(<[u8]>::to_vec).unwrap_or_default();
                        let _ = self.write_frame(OP_CLOSE, false, &payload).await;
                    }
                    return Ok(None);
                }
                OP_TEXT | OP_BINARY => {
                    if self.ws_state().fragment_started {
                        self.fail(CLOSE_PROTOCOL_ERROR).await;
                        return Err(SocketError::Protocol("data frame inside fragmented message"));
                    }
                    if frame.fin {
                        if frame.rsv1 {
                            return self.inflate_message(frame.payload).await.map(Some);
                        }
                        return Ok(Some(frame.payload));
                    }
                    let ws = self.ws_state();
                    ws.fragment_started = true;
                    ws.fragment_compressed = frame.rsv1;
                    ws.fragments = frame.payload;
                }
                OP_CONTINUATION => {
                    if !self.ws_state().fragment_started {
                        self.fail(CLOSE_PROTOCOL_ERROR).await;
                        return Err(SocketError::Protocol("continuation without initial frame"));
                    }
                    let (done, compressed, payload) = {
                        let ws = self.ws_state();
                        ws.fragments.extend_from_slice(&frame.payload);
                        if frame.fin {
                            ws.fragment_started = false;
                            (true, ws.fragment_compressed, std::mem::take(&mut ws.fragments))
                        } else {
                            (false, false, Vec::new())
                        }
                    };
                    if done {
                        if compressed {
                            return self.inflate_message(payload).await.map(Some);
                        }
                        return Ok(Some(payload));
                    }
                }
                _ => {
                    self.fail(CLOSE_PROTOCOL_ERROR).await;
                    return Err(SocketError::Protocol("reserved opcode"));
                }
            }
        }
    }

    /// Write application bytes as one message (or raw bytes in raw mode).
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), SocketError> {
        match &mut self.mode {
            LinkMode::Raw => {
                self.stream.write_all(data).await?;
                Ok(())
            }
            LinkMode::WebSocket(ws) => {
                if let Some(deflate) = ws.deflate.as_mut() {
                    let compressed = deflate
                        .compress_message(data)
                        .map_err(|e| SocketError::Payload(e.to_string()))?;
                    self.write_frame(OP_BINARY, true, &compressed).await
                } else {
                    self.write_frame(OP_BINARY, false, data).await
                }
            }
        }
    }

    /// Flush pending writes down to the kernel. Must complete before the
    /// socket is handed to another process.
    pub async fn drain(&mut self) -> Result<(), SocketError> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Send a close frame (no-op in raw mode or if one was already sent).
    pub async fn close(&mut self, code: u16) -> Result<(), SocketError> {
        if let LinkMode::WebSocket(ws) = &mut self.mode {
            if !ws.close_sent {
                ws.close_sent = true;
                let payload = code.to_be_bytes();
                self.write_frame(OP_CLOSE, false, &payload).await?;
            }
        }
        self.drain().await
    }

    /// Take the transport and the undecoded byte remainder back out.
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream, self.read_buf)
    }

    async fn fail(&mut self, code: u16) {
        let _ = self.close(code).await;
    }

    async fn write_frame(&mut self, opcode: u8, rsv1: bool, payload: &[u8]) -> Result<(), SocketError> {
        let mut header = BytesMut::with_capacity(10);
        let b0 = 0x80 | (if rsv1 { 0x40 } else { 0x00 }) | opcode;
        header.put_u8(b0);
        if payload.len() < 126 {
            header.put_u8(payload.len() as u8);
        } else if payload.len() <= u16::MAX as usize {
            header.put_u8(126);
            header.put_u16(payload.len() as u16);
        } else {
            header.put_u8(127);
            header.put_u64(payload.len() as u64);
        }
        self.stream.write_all(&header).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn inflate_message(&mut self, payload: Vec<u8>) -> Result<Vec<u8>, SocketError> {
        let result = match self.ws_state().deflate.as_mut() {
            Some(deflate) => deflate
                .decompress_message(&payload)
                .map_err(|e| SocketError::Payload(e.to_string())),
            // rsv1 on a connection that never negotiated compression.
            None => Err(SocketError::Protocol("rsv1 set without negotiated extension")),
        };
        match result {
            Ok(bytes) => Ok(bytes),
            Err(SocketError::Protocol(p)) => {
                self.fail(CLOSE_PROTOCOL_ERROR).await;
                Err(SocketError::Protocol(p))
            }
            Err(err) => {
                self.fail(CLOSE_INVALID_PAYLOAD).await;
                Err(err)
            }
        }
    }

    fn ws_state(&mut self) -> &mut WsState {
        match &mut self.mode {
            LinkMode::WebSocket(ws) => ws,
            LinkMode::Raw => unreachable!("ws state accessed on raw link"),
        }
    }
}

/// Try to parse one complete frame from `buf`. `Ok(None)` means more bytes
/// are needed; `Err` is a protocol violation.
fn parse_frame(buf: &mut BytesMut) -> Result<Option<Frame>, &'static str> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let b0 = buf[0];
    let b1 = buf[1];
    if b0 & 0x30 != 0 {
        return Err("reserved bits rsv2/rsv3 set");
    }
    let fin = b0 & 0x80 != 0;
    let rsv1 = b0 & 0x40 != 0;
    let opcode = b0 & 0x0F;
    let masked = b1 & 0x80 != 0;
    if !masked {
        return Err("client frame not masked");
    }
    let len7 = (b1 & 0x7F) as u64;

    let mut offset = 2usize;
    let payload_len = match len7 {
        126 => {
            if buf.len() < offset + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as u64;
            offset += 2;
            len
        }
        127 => {
            if buf.len() < offset + 8 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[offset..offset + 8]);
            offset += 8;
            u64::from_be_bytes(bytes)
        }
        n => n,
    };
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err("frame exceeds payload limit");
    }
    if opcode >= OP_CLOSE {
        // Control frames may not be fragmented or oversized.
        if !fin {
            return Err("fragmented control frame");
        }
        if payload_len > 125 {
            return Err("oversized control frame");
        }
    }

    if buf.len() < offset + 4 {
        return Ok(None);
    }
    let mut mask = [0u8; 4];
    mask.copy_from_slice(&buf[offset..offset + 4]);
    offset += 4;

    if buf.len() < offset + payload_len as usize {
        return Ok(None);
    }
    buf.advance(offset);
    let mut payload = buf.split_to(payload_len as usize).to_vec();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    Ok(Some(Frame {
        fin,
        rsv1,
        opcode,
        payload,
    }))
}
