//! fleet-core: shared data model for the fleet-tracking gateway.
//!
//! Plain data records only — no storage handles, no side effects.  The
//! gateway service owns persistence and state transitions; this crate owns
//! the types those transitions operate on, plus the small pure functions
//! (distance, timestamp sanitization, connection quality) that both the
//! pipeline and the liveness sweeper share.

pub mod command;
pub mod device;
pub mod event;
pub mod geo;
pub mod harness;
pub mod quality;
pub mod time;

pub use command::{CommandKind, CommandStatus, OutboundCommand};
pub use device::{ConnStatus, Device, InvalidImei, Position, ProtocolKind, validate_imei};
pub use event::{Event, EventKind, EventPayload, GsmKind};
pub use harness::{HARNESS_IO_COUNT, Harness};
