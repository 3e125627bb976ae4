//! Log every touch-state transition at debug level.

use std::sync::Arc;

use tracing::debug;

use yktouch_core::EventBus;

pub async fn run(bus: Arc<EventBus>) {
    let mut messages = bus.register("notifier/debug");
    while let Some(message) = messages.recv().await {
        debug!("[notifier/debug] {message}");
    }
}
