//! Length-prefixed framing for stream transports.
//!
//! A frame is `[magic: u32 LE][len: u16 LE][payload]`. Message transports
//! carry payloads as-is since they already keep message boundaries.

use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

use super::Error;

pub const MAGIC: u32 = 0x2123_676f;
pub const HEADER_LEN: usize = 6;
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

pub const PING: &[u8; 5] = b"#ping";
pub const PONG: &[u8; 5] = b"#pong";
pub const HANDSHAKE_ACK: &[u8; 5] = b"#hsuc";

/// Reserved 5-byte control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Ping,
    Pong,
    HandshakeAck,
}

impl Control {
    pub fn parse(msg: &[u8]) -> Option<Self> {
        if msg.len() != 5 || msg[0] != b'#' {
            return None;
        }
        match array_ref![msg, 0, 5] {
            PING => Some(Control::Ping),
            PONG => Some(Control::Pong),
            HANDSHAKE_ACK => Some(Control::HandshakeAck),
            _ => None,
        }
    }

    pub fn bytes(self) -> &'static [u8; 5] {
        match self {
            Control::Ping => PING,
            Control::Pong => PONG,
            Control::HandshakeAck => HANDSHAKE_ACK,
        }
    }
}

pub fn encode(payload: &[u8]) -> Result<Vec<u8>, Error> {
    if payload.len() > MAX_PAYLOAD {
        Err(Error::FrameTooLarge(payload.len()))?
    }
    let mut buf = vec![0u8; HEADER_LEN + payload.len()];
    LittleEndian::write_u32(&mut buf[0..4], MAGIC);
    LittleEndian::write_u16(&mut buf[4..6], payload.len() as u16);
    buf[HEADER_LEN..].copy_from_slice(payload);
    Ok(buf)
}

/// Reassembles frames from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    dropped: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered and not yet returned as a frame.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes discarded because of a bad header.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Pops the next complete frame's payload. On a bad magic everything
    /// buffered is discarded and reading carries on with the next push.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let header = array_ref![self.buf, 0, HEADER_LEN];
        let magic = LittleEndian::read_u32(&header[0..4]);
        if magic != MAGIC {
            warn!(
                buffered = self.buf.len(),
                magic,
                "bad frame magic, dropping buffered bytes"
            );
            self.dropped += self.buf.len();
            self.buf.clear();
            return None;
        }
        let len = LittleEndian::read_u16(&header[4..6]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return None;
        }
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Some(payload)
    }
}
