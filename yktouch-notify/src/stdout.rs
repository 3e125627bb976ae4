//! Print each touch-state token to stdout, one per line — the scripting
//! interface for status bars that prefer a pipe over a socket.

use std::sync::Arc;

use yktouch_core::EventBus;

pub async fn run(bus: Arc<EventBus>) {
    let mut messages = bus.register("notifier/stdout");
    while let Some(message) = messages.recv().await {
        println!("{message}");
    }
}
