//! Desktop notifications via `notify-send` for every ON transition.

use std::sync::Arc;

use tracing::warn;

use yktouch_core::EventBus;

pub async fn run(bus: Arc<EventBus>) {
    let mut messages = bus.register("notifier/desktop");
    while let Some(message) = messages.recv().await {
        if !message.is_on() {
            continue;
        }
        match tokio::process::Command::new("notify-send")
            .arg("YubiKey is waiting for a touch")
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("notify-send exited with {status}"),
            Err(e) => warn!("cannot send desktop notification: {e}"),
        }
    }
}
