//! Stream framers (C1).
//!
//! Each framer is a `tokio_util::codec::Decoder` over a per-connection
//! `BytesMut` buffer.  A framer yields one complete frame at a time and
//! fails with a [`FrameError`] on any structural violation; the connection
//! loop closes the socket on error — there is no resynchronization.
//!
//! UDP protocols do not use a framer: one datagram is one frame, and the
//! codec's `validate`/`decode` covers the structural checks.

use crate::FrameError;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Default frame ceiling for the ASCII (Wialon) framer.
pub const MAX_ASCII_FRAME: usize = 2048;
/// Default frame ceiling for the binary framers.
pub const MAX_BINARY_FRAME: usize = 4096;

/// Error type shared by the framers; `Decoder` requires `From<io::Error>`.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("framing: {0}")]
    Frame(#[from] FrameError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Wialon: ASCII, CRLF-terminated
// ---------------------------------------------------------------------------

/// Yields one `#…#…` line at a time, CRLF stripped.
#[derive(Debug)]
pub struct WialonFramer {
    max_frame: usize,
}

impl WialonFramer {
    pub fn new(max_frame: usize) -> WialonFramer {
        WialonFramer { max_frame }
    }
}

impl Default for WialonFramer {
    fn default() -> Self {
        WialonFramer::new(MAX_ASCII_FRAME)
    }
}

impl Decoder for WialonFramer {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, CodecError> {
        match src.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                if pos + 2 > self.max_frame {
                    return Err(FrameError::BadLength.into());
                }
                let line = src.split_to(pos + 2);
                match std::str::from_utf8(&line[..pos]) {
                    // Non-ASCII payload on an ASCII-only port.
                    Err(_) => Err(FrameError::BadPreamble.into()),
                    Ok(s) => Ok(Some(s.to_owned())),
                }
            }
            None if src.len() > self.max_frame => Err(FrameError::BadLength.into()),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Concox/Meiligao: 0x78 0x78 length-prefixed binary
// ---------------------------------------------------------------------------

/// Yields one complete `78 78 … 0D 0A` frame, preamble and terminator
/// included.  The length byte counts protocol byte + body + serial + CRC;
/// the CRC itself is verified by the codec, not here.
#[derive(Debug)]
pub struct BinaryFramer {
    max_frame: usize,
}

impl BinaryFramer {
    pub fn new(max_frame: usize) -> BinaryFramer {
        BinaryFramer { max_frame }
    }
}

impl Default for BinaryFramer {
    fn default() -> Self {
        BinaryFramer::new(MAX_BINARY_FRAME)
    }
}

/// Shortest legal length byte: protocol (1) + serial (2) + CRC (2).
const BINARY_MIN_LEN: usize = 5;

impl Decoder for BinaryFramer {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if src.len() < 3 {
            return Ok(None);
        }
        if src[0] != 0x78 || src[1] != 0x78 {
            return Err(FrameError::BadPreamble.into());
        }
        let len = src[2] as usize;
        let total = len + 5; // preamble (2) + length byte (1) + len + terminator (2)
        if len < BINARY_MIN_LEN || total > self.max_frame {
            return Err(FrameError::BadLength.into());
        }
        if src.len() < total {
            return Ok(None);
        }
        if src[total - 2] != 0x0D || src[total - 1] != 0x0A {
            return Err(FrameError::BadTerminator.into());
        }
        Ok(Some(src.split_to(total).freeze()))
    }
}

// ---------------------------------------------------------------------------
// SGAvl: 8-byte IMEI preamble, then seq/len/type records
// ---------------------------------------------------------------------------

/// What the SGAvl framer yields: the one-time login preamble, then records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SgAvlItem {
    Login { imei: u64 },
    Record { seq: u32, id: u8, body: Bytes },
}

/// Stateful framer for the legacy SGAvl stream.  The first 8 bytes of a
/// connection are the little-endian IMEI; every record after that is a
/// 7-byte header (4-byte seq, 2-byte body length, 1-byte type) plus body.
#[derive(Debug)]
pub struct SgAvlFramer {
    max_frame: usize,
    logged_in: bool,
}

impl SgAvlFramer {
    pub fn new(max_frame: usize) -> SgAvlFramer {
        SgAvlFramer {
            max_frame,
            logged_in: false,
        }
    }
}

impl Default for SgAvlFramer {
    fn default() -> Self {
        SgAvlFramer::new(MAX_BINARY_FRAME)
    }
}

impl Decoder for SgAvlFramer {
    type Item = SgAvlItem;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SgAvlItem>, CodecError> {
        if !self.logged_in {
            if src.len() < 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&src[..8]);
            src.advance(8);
            self.logged_in = true;
            return Ok(Some(SgAvlItem::Login {
                imei: u64::from_le_bytes(raw),
            }));
        }

        if src.len() < 7 {
            return Ok(None);
        }
        let seq = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let len = u16::from_le_bytes([src[4], src[5]]) as usize;
        if 7 + len > self.max_frame {
            return Err(FrameError::BadLength.into());
        }
        if src.len() < 7 + len {
            return Ok(None);
        }
        let id = src[6];
        src.advance(7);
        let body = src.split_to(len).freeze();
        Ok(Some(SgAvlItem::Record { seq, id, body }))
    }
}
