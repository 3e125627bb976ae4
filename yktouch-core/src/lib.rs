//! Shared plumbing for the yktouch daemon: the touch-state message
//! vocabulary, the event bus that fans detector output out to notifier
//! sinks, the coordinated-shutdown registry, and the configuration model.

use std::fmt;

pub mod bus;
pub mod config;
pub mod shutdown;

pub use bus::EventBus;
pub use config::{Config, TimingConfig};
pub use shutdown::{ShutdownAck, ShutdownHandle, ShutdownRegistry};

/// A touch-state transition token, one ON/OFF pair per detector backend.
///
/// Every token serializes to exactly [`Message::WIRE_LEN`] bytes so that
/// socket clients can frame a raw byte stream without a length prefix.
/// The byte values are part of the external wire protocol and must not
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Message {
    GpgOn,
    GpgOff,
    U2fOn,
    U2fOff,
    HmacOn,
    HmacOff,
}

impl Message {
    /// On-the-wire width of every token, in bytes.
    pub const WIRE_LEN: usize = 5;

    /// The fixed-width wire representation of this token.
    pub fn as_bytes(self) -> &'static [u8; Message::WIRE_LEN] {
        match self {
            Message::GpgOn => b"GPG_1",
            Message::GpgOff => b"GPG_0",
            Message::U2fOn => b"U2F_1",
            Message::U2fOff => b"U2F_0",
            Message::HmacOn => b"MAC_1",
            Message::HmacOff => b"MAC_0",
        }
    }

    /// `true` for the ON half of each pair (a touch is being waited on).
    pub fn is_on(self) -> bool {
        matches!(self, Message::GpgOn | Message::U2fOn | Message::HmacOn)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Wire tokens are ASCII by construction.
        f.write_str(std::str::from_utf8(self.as_bytes()).unwrap_or("?????"))
    }
}
