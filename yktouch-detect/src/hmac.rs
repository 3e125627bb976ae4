//! HMAC challenge-response presence detector.
//!
//! Watches device-node churn under `/dev`, keeps a live set of YubiKey
//! hidraw nodes (classified by the vendor marker in the kernel uevent),
//! and publishes the debounced aggregate presence as `MAC_1` / `MAC_0`.
//! Removals are debounced because a physical reconnect or a driver
//! re-enumeration shows up as a remove+create pair in quick succession.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error};

use yktouch_core::{EventBus, Message, TimingConfig};

use crate::devices::{self, DeviceEvent};

/// Live device set plus the last published aggregate state.
///
/// Mutated only by the owning detector task; transitions are computed
/// here so the debounce plumbing stays separate from the state rules.
struct PresenceState {
    devices: HashSet<PathBuf>,
    last_published: Message,
}

impl PresenceState {
    /// The starting state is whatever presence the initial enumeration
    /// found; only later changes are announced.
    fn new(devices: HashSet<PathBuf>) -> Self {
        let mut state = Self {
            devices,
            last_published: Message::HmacOff,
        };
        state.last_published = state.aggregate();
        state
    }

    fn aggregate(&self) -> Message {
        if self.devices.is_empty() {
            Message::HmacOff
        } else {
            Message::HmacOn
        }
    }

    /// The message to publish now, if the aggregate changed since the last
    /// publish.  Marks it published.
    fn transition(&mut self) -> Option<Message> {
        let current = self.aggregate();
        if current == self.last_published {
            return None;
        }
        self.last_published = current;
        Some(current)
    }
}

/// Run the HMAC presence detector until the device watcher dies.
pub async fn watch(bus: Arc<EventBus>, timing: TimingConfig) {
    let (_watcher, mut events) = match devices::watch(Path::new(devices::DEVICES_DIR)) {
        Ok(pair) => pair,
        Err(e) => {
            error!("cannot establish HMAC device watch: {e:#}");
            return;
        }
    };
    debug!("HMAC watcher on '{}' is established", devices::DEVICES_DIR);

    let mut state = PresenceState::new(enumerate(Path::new(devices::DEVICES_DIR)));

    // At most one pending removal debounce; created devices cancel it.
    let mut remove_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    DeviceEvent::Created(path) => {
                        remove_deadline = None;
                        if !devices::is_hidraw(&path) {
                            continue;
                        }
                        // Device metadata is not queryable immediately
                        // after the node appears.
                        sleep(timing.device_settle()).await;
                        if is_yubikey_hidraw(&path) {
                            state.devices.insert(path);
                        }
                        if let Some(message) = state.transition() {
                            bus.publish(message).await;
                        }
                    }
                    DeviceEvent::Removed(path) => {
                        if state.devices.remove(&path) {
                            remove_deadline =
                                Some(Instant::now() + timing.hmac_remove_debounce());
                        }
                    }
                }
            }
            _ = wait_for(remove_deadline) => {
                remove_deadline = None;
                if let Some(message) = state.transition() {
                    bus.publish(message).await;
                }
            }
        }
    }
    error!("HMAC device watch ended unexpectedly");
}

/// Sleep until `deadline`, or forever when there is no pending debounce.
async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn enumerate(dir: &Path) -> HashSet<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("cannot list '{}' to find connected YubiKeys: {e}", dir.display());
            return HashSet::new();
        }
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| devices::is_hidraw(path) && is_yubikey_hidraw(path))
        .collect()
}

/// Classify a hidraw node by the vendor marker in its kernel uevent.
/// Read failures classify as "not a match", never as an error.
fn is_yubikey_hidraw(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    match std::fs::read_to_string(format!("/sys/class/hidraw/{name}/device/uevent")) {
        Ok(info) => info.to_lowercase().contains("yubikey"),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "uevent not readable, skipping device");
            false
        }
    }
}
