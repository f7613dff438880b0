//! permessage-deflate state: one raw-deflate stream per direction with
//! stateful context takeover, plus the recorded inflate tail that seeds a
//! fresh decompressor after a socket hand-off.

use std::collections::VecDeque;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

/// Upper bound on the recorded inflate tail. Matches the 32 KiB zlib window:
/// a fresh decompressor cannot use more history than this.
const RECORDED_TAIL_LIMIT: usize = 32 * 1024;

/// The `00 00 FF FF` block every sync-flushed deflate message ends with. The
/// wire format strips it on send and restores it on receive (RFC 7692 §7.2.1).
const SYNC_FLUSH_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

#[derive(Debug, thiserror::Error)]
#[error("deflate stream error: {0}")]
pub struct DeflateError(String);

/// Per-connection compression context.
pub struct DeflateState {
    compress: Compress,
    decompress: Decompress,
    recorded: VecDeque<u8>,
}

impl DeflateState {
    pub fn new() -> Self {
        Self {
            // `false` selects raw deflate streams, no zlib wrapper.
            compress: Compress::new(Compression::default(), false),
            decompress: Decompress::new(false),
            recorded: VecDeque::new(),
        }
    }

    /// Compress one message payload, stripping the sync-flush tail.
    pub fn compress_message(&mut self, input: &[u8]) -> Result<Vec<u8>, DeflateError> {
        let mut out = Vec::with_capacity(input.len() / 2 + 16);
        let mut consumed = 0usize;
        let mut chunk = [0u8; 8192];
        loop {
            let in_before = self.compress.total_in();
            let out_before = self.compress.total_out();
            self.compress
                .compress(&input[consumed..], &mut chunk, FlushCompress::Sync)
                .map_err(|e| DeflateError(e.to_string()))?;
            consumed += (self.compress.total_in() - in_before) as usize;
            let produced = (self.compress.total_out() - out_before) as usize;
            out.extend_from_slice(&chunk[..produced]);
            if consumed >= input.len() && produced < chunk.len() {
                break;
            }
        }
        if out.ends_with(&SYNC_FLUSH_TAIL) {
            out.truncate(out.len() - SYNC_FLUSH_TAIL.len());
        }
        Ok(out)
    }

    /// Decompress one message payload (tail restored per RFC 7692) and record
    /// the decompressed bytes into the bounded tail buffer.
    pub fn decompress_message(&mut self, input: &[u8]) -> Result<Vec<u8>, DeflateError> {
        let mut full = Vec::with_capacity(input.len() + SYNC_FLUSH_TAIL.len());
        full.extend_from_slice(input);
        full.extend_from_slice(&SYNC_FLUSH_TAIL);

        let mut out = Vec::with_capacity(input.len() * 2 + 16);
        let mut consumed = 0usize;
        let mut chunk = [0u8; 8192];
        loop {
            let in_before = self.decompress.total_in();
            let out_before = self.decompress.total_out();
            self.decompress
                .decompress(&full[consumed..], &mut chunk, FlushDecompress::Sync)
                .map_err(|e| DeflateError(e.to_string()))?;
            consumed += (self.decompress.total_in() - in_before) as usize;
            let produced = (self.decompress.total_out() - out_before) as usize;
            out.extend_from_slice(&chunk[..produced]);
            if consumed >= full.len() && produced < chunk.len() {
                break;
            }
        }
        self.record(&out);
        Ok(out)
    }

    fn record(&mut self, bytes: &[u8]) {
        // Only the final window-sized slice matters; skip the rest outright
        // for large messages.
        if bytes.len() >= RECORDED_TAIL_LIMIT {
            self.recorded.clear();
            self.recorded
                .extend(&bytes[bytes.len() - RECORDED_TAIL_LIMIT..]);
            return;
        }
        self.recorded.extend(bytes);
        while self.recorded.len() > RECORDED_TAIL_LIMIT {
            self.recorded.pop_front();
        }
    }

    /// The bounded tail of recently decompressed bytes, oldest first.
    pub fn recorded_inflate_bytes(&self) -> Vec<u8> {
        self.recorded.iter().copied().collect()
    }
}

impl Default for DeflateState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_message() {
        let mut tx = DeflateState::new();
        let mut rx = DeflateState::new();
        let msg = b"hello hello hello hello hello".to_vec();
        let wire = tx.compress_message(&msg).unwrap();
        assert!(!wire.ends_with(&SYNC_FLUSH_TAIL));
        let back = rx.decompress_message(&wire).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn context_takeover_spans_messages() {
        let mut tx = DeflateState::new();
        let mut rx = DeflateState::new();
        // The second message back-references the first message's window, so
        // decoding it with a fresh context would fail.
        let first = vec![b'a'; 2048];
        let second = vec![b'a'; 2048];
        let w1 = tx.compress_message(&first).unwrap();
        let w2 = tx.compress_message(&second).unwrap();
        assert_eq!(rx.decompress_message(&w1).unwrap(), first);
        assert_eq!(rx.decompress_message(&w2).unwrap(), second);
    }

    #[test]
    fn recorded_tail_is_bounded() {
        let mut tx = DeflateState::new();
        let mut rx = DeflateState::new();
        let big = vec![b'x'; RECORDED_TAIL_LIMIT * 2];
        let wire = tx.compress_message(&big).unwrap();
        rx.decompress_message(&wire).unwrap();
        let tail = rx.recorded_inflate_bytes();
        assert_eq!(tail.len(), RECORDED_TAIL_LIMIT);
        assert!(tail.iter().all(|&b| b == b'x'));
    }

    #[test]
    fn recorded_tail_accumulates_small_messages() {
        let mut tx = DeflateState::new();
        let mut rx = DeflateState::new();
        for i in 0..4u8 {
            let msg = vec![i; 16];
            let wire = tx.compress_message(&msg).unwrap();
            rx.decompress_message(&wire).unwrap();
        }
        let tail = rx.recorded_inflate_bytes();
        assert_eq!(tail.len(), 64);
        assert_eq!(&tail[..16], &[0u8; 16]);
        assert_eq!(&tail[48..], &[3u8; 16]);
    }
}
