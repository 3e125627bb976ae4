//! Passive notification sinks.
//!
//! Every sink registers one consumer channel on the event bus and turns
//! incoming [`yktouch_core::Message`] tokens into some externally visible
//! form.  Sinks hold no detector state; a sink failing to start never
//! affects detection.

pub mod dbus;
pub mod debug;
pub mod desktop;
pub mod stdout;
pub mod unix_socket;
