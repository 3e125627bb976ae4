//! The detection subsystem: one independent task per backend, all
//! publishing [`yktouch_core::Message`] transitions onto the event bus.
//!
//! Detectors never call into each other; the GPG file watcher and the
//! socket proxies share only a coalescing check-request channel consumed
//! by the single agent checker in [`gpg`].

pub mod devices;
pub mod gpg;
pub mod hid;
pub mod hmac;
pub mod proxy;
pub mod u2f;
