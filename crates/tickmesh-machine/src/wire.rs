//! Wire protocol: a one-line handshake followed by newline-delimited JSON.
//!
//! ```text
//! dialer -> acceptor:  CONNECT 5000\n
//! either direction:    {"sender":1,"clock":3}\n
//!                      {"sender":1,"clock":4}\n
//! ```
//!
//! Frames never contain a raw newline because `serde_json` escapes them.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tickmesh_types::{LogicalTime, MachineId};

/// Longest partial frame kept while waiting for its newline.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const HANDSHAKE_PREFIX: &str = "CONNECT ";

/// A clock-stamped message between machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: MachineId,
    pub clock: LogicalTime,
}

/// Errors decoding a single frame. None of them affect the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed handshake: {0:?}")]
    InvalidHandshake(String),
}

/// Encodes the handshake line a dialer sends first.
pub fn encode_handshake(port: u16) -> String {
    format!("{HANDSHAKE_PREFIX}{port}\n")
}

/// Parses a handshake line (without its newline) into the dialer's port.
pub fn parse_handshake(line: &[u8]) -> Result<u16, FrameError> {
    let text = std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)?;
    text.strip_prefix(HANDSHAKE_PREFIX)
        .and_then(|port| port.trim().parse().ok())
        .ok_or_else(|| FrameError::InvalidHandshake(text.to_string()))
}

/// Encodes a message as one newline-terminated frame.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decodes one frame (without its newline).
pub fn decode_message(line: &[u8]) -> Result<Message, FrameError> {
    Ok(serde_json::from_slice(line)?)
}

/// Splits a byte stream into lines.
///
/// Blank lines are skipped and a trailing `\r` is stripped. A partial line
/// that grows past [`MAX_FRAME_LEN`] is discarded and counted.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
    /// Bytes already scanned for a newline.
    scanned: usize,
    oversized: u64,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes and returns the next complete, non-blank line.
    pub fn next_line(&mut self) -> Option<Bytes> {
        loop {
            let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.buf.len();
                if self.buf.len() > MAX_FRAME_LEN {
                    self.buf.clear();
                    self.scanned = 0;
                    self.oversized += 1;
                }
                return None;
            };

            let newline = self.scanned + offset;
            let mut line = self.buf.split_to(newline);
            self.buf.advance(1);
            self.scanned = 0;

            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(line.freeze());
        }
    }

    /// Bytes buffered after the last returned line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Partial frames discarded for exceeding [`MAX_FRAME_LEN`].
    pub fn oversized(&self) -> u64 {
        self.oversized
    }
}
