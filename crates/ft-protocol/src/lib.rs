//! ft-protocol: wire framing and per-protocol codecs for the device fleet.
//!
//! Layering contract:
//! - [`framing`] turns a byte stream (or datagram) into one complete frame
//!   at a time and reports only *structural* violations.
//! - The codec modules ([`wialon`], [`concox`], [`sgavl`], [`blu`]) validate
//!   and decode complete frames into typed [`record::Record`] values, and
//!   encode server replies / queued commands back into wire bytes.
//!
//! Framing violations are fatal for the connection that produced them; a
//! record-level decode error skips the single record and the frame
//! continues.  The gateway enforces that policy — this crate just reports
//! errors precisely enough to tell the two apart.

pub mod blu;
pub mod concox;
pub mod crc;
pub mod framing;
pub mod record;
pub mod sgavl;
pub mod wialon;

use thiserror::Error;

pub use framing::{BinaryFramer, CodecError, SgAvlFramer, SgAvlItem, WialonFramer};
pub use record::{Fix, Record};

/// Structural framing violations.  Any of these closes a TCP connection
/// (or drops a UDP datagram) without resynchronization.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated")]
    Short,
    #[error("bad preamble")]
    BadPreamble,
    #[error("bad length field")]
    BadLength,
    #[error("bad terminator")]
    BadTerminator,
    #[error("bad checksum")]
    BadChecksum,
}

/// Record-level decode failures.  `Frame` wraps a structural violation
/// detected during decode (a frame that never passed `validate`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("framing: {0}")]
    Frame(#[from] FrameError),
    #[error("field out of range: {0}")]
    FieldRange(&'static str),
    #[error("unknown record id {0:#04x}")]
    UnknownRecordId(u8),
    #[error("truncated record body")]
    Truncated,
    #[error("malformed text field")]
    BadText,
}
