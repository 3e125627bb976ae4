//! U2F/FIDO2 touch-wait detector.
//!
//! Phase one classifies every hidraw node by parsing its HID report
//! descriptor (see [`crate::hid`]); phase two runs one task per
//! qualifying device, decoding its raw CTAPHID report stream.  The OFF
//! debounce is asymmetric: a short window while idle keeps unrelated
//! traffic cheap, a long window while a touch is pending bridges the gap
//! between consecutive keep-alive frames.

use std::collections::HashSet;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use yktouch_core::{EventBus, Message, TimingConfig};

use crate::devices::{self, DeviceEvent};
use crate::hid;

type ActiveSet = Arc<Mutex<HashSet<PathBuf>>>;

/// Run the U2F detector until the device watcher dies.
pub async fn watch(bus: Arc<EventBus>, timing: TimingConfig) {
    let (_watcher, mut events) = match devices::watch(Path::new(devices::DEVICES_DIR)) {
        Ok(pair) => pair,
        Err(e) => {
            error!("cannot establish U2F device watch: {e:#}");
            return;
        }
    };
    debug!("U2F watcher on '{}' is established", devices::DEVICES_DIR);

    let active: ActiveSet = Arc::default();

    match std::fs::read_dir(devices::DEVICES_DIR) {
        Ok(entries) => {
            for entry in entries.filter_map(|entry| entry.ok()) {
                spawn_if_fido(entry.path(), &bus, timing, &active, false);
            }
        }
        Err(e) => {
            error!(
                "cannot list '{}' to find connected FIDO devices: {e}",
                devices::DEVICES_DIR
            );
        }
    }

    while let Some(event) = events.recv().await {
        // Removals need no handling: the per-device read fails and the
        // device task winds itself down.
        if let DeviceEvent::Created(path) = event {
            spawn_if_fido(path, &bus, timing, &active, true);
        }
    }
    error!("U2F device watch ended unexpectedly");
}

/// Classify `path` and, if it is a FIDO authenticator not yet tracked,
/// spawn its report-decoding task.  `settle` waits out the post-creation
/// grace period first.
fn spawn_if_fido(path: PathBuf, bus: &Arc<EventBus>, timing: TimingConfig, active: &ActiveSet, settle: bool) {
    if !devices::is_hidraw(&path) {
        return;
    }
    let bus = Arc::clone(bus);
    let active = Arc::clone(active);
    tokio::spawn(async move {
        if settle {
            sleep(timing.device_settle()).await;
        }
        if !hid::is_fido_device(&path) {
            return;
        }
        {
            let mut tracked = match active.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Already being decoded — classification is idempotent.
            if !tracked.insert(path.clone()) {
                return;
            }
        }
        debug!(path = %path.display(), "FIDO device attached, decoding reports");
        run_device(&path, bus, timing).await;
        let mut tracked = match active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracked.remove(&path);
    });
}

/// Decode one device's report stream until it is unplugged.
async fn run_device(path: &Path, bus: Arc<EventBus>, timing: TimingConfig) {
    let (tx, rx) = mpsc::channel::<bool>(8);

    // Reads on a hidraw node block until the device emits a report, so
    // the read loop lives on a blocking thread and feeds the async state
    // machine below.
    let reader_path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut device = match std::fs::File::open(&reader_path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %reader_path.display(), "cannot open FIDO device for reading: {e}");
                return;
            }
        };
        let mut report = [0u8; hid::REPORT_LEN];
        loop {
            match device.read(&mut report) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(hid::report_signals_touch(&report[..n])).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(path = %reader_path.display(), "FIDO device read failed (unplugged?): {e}");
                    break;
                }
            }
        }
    });

    debounce_reports(rx, &bus, timing).await;
    debug!(path = %path.display(), "FIDO device task finished");
}

/// The per-device debounce state machine.
///
/// Every received report restarts the OFF window; ON is published once on
/// the first triggering report after OFF; OFF is published when a window
/// expires with no further report, or immediately when the stream ends
/// while ON (device unplugged mid-wait).
async fn debounce_reports(mut reports: mpsc::Receiver<bool>, bus: &Arc<EventBus>, timing: TimingConfig) {
    let mut on = false;
    // Set while an OFF window is armed, i.e. a report arrived since the
    // last expiry.  Without it an idle device would wake us every window.
    let mut armed = false;

    loop {
        let received = if armed {
            let window = if on {
                timing.u2f_active_off()
            } else {
                timing.u2f_idle_off()
            };
            timeout(window, reports.recv()).await
        } else {
            Ok(reports.recv().await)
        };

        match received {
            Ok(Some(triggered)) => {
                armed = true;
                if triggered && !on {
                    on = true;
                    bus.publish(Message::U2fOn).await;
                }
            }
            Ok(None) => {
                if on {
                    bus.publish(Message::U2fOff).await;
                }
                return;
            }
            Err(_elapsed) => {
                armed = false;
                if on {
                    on = false;
                    bus.publish(Message::U2fOff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn test_timing() -> TimingConfig {
        TimingConfig {
            u2f_idle_off_ms: 200,
            u2f_active_off_ms: 2000,
            ..TimingConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn on_once_then_off_after_quiet_window() {
        let bus = EventBus::new();
        let mut consumer = bus.register("test");
        let (tx, rx) = mpsc::channel(8);
        let machine = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { debounce_reports(rx, &bus, test_timing()).await })
        };

        // A keep-alive with UP-needed arrives: ON exactly once.
        tx.send(true).await.expect("send");
        assert_eq!(consumer.recv().await, Some(Message::U2fOn));

        // Further triggering reports during the same wait stay silent.
        tx.send(true).await.expect("send");
        tx.send(true).await.expect("send");

        // 2.5 s of silence: the active window (2 s) expires, OFF follows.
        sleep(Duration::from_millis(2500)).await;
        assert_eq!(consumer.recv().await, Some(Message::U2fOff));

        drop(tx);
        machine.await.expect("machine task");
    }

    #[tokio::test(start_paused = true)]
    async fn non_triggering_traffic_stays_silent() {
        let bus = EventBus::new();
        let mut consumer = bus.register("test");
        let (tx, rx) = mpsc::channel(8);
        let machine = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { debounce_reports(rx, &bus, test_timing()).await })
        };

        tx.send(false).await.expect("send");
        tx.send(false).await.expect("send");
        sleep(Duration::from_secs(5)).await;
        drop(tx);
        machine.await.expect("machine task");

        // The machine exited from the OFF state without publishing.
        assert!(consumer.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_keeps_resetting_the_off_window() {
        let bus = EventBus::new();
        let mut consumer = bus.register("test");
        let (tx, rx) = mpsc::channel(8);
        {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { debounce_reports(rx, &bus, test_timing()).await });
        }

        tx.send(true).await.expect("send");
        assert_eq!(consumer.recv().await, Some(Message::U2fOn));

        // Keep-alives every second: each restarts the 2 s window, so no
        // OFF is published while they keep coming.
        for _ in 0..4 {
            sleep(Duration::from_secs(1)).await;
            tx.send(true).await.expect("send");
        }
        assert!(consumer.try_recv().is_err());

        sleep(Duration::from_millis(2100)).await;
        assert_eq!(consumer.recv().await, Some(Message::U2fOff));
    }

    #[tokio::test(start_paused = true)]
    async fn unplug_while_on_publishes_off_immediately() {
        let bus = EventBus::new();
        let mut consumer = bus.register("test");
        let (tx, rx) = mpsc::channel(8);
        let machine = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { debounce_reports(rx, &bus, test_timing()).await })
        };

        tx.send(true).await.expect("send");
        assert_eq!(consumer.recv().await, Some(Message::U2fOn));

        // Reader task ends (read error after unplug) — channel closes.
        drop(tx);
        machine.await.expect("machine task");
        assert_eq!(consumer.recv().await, Some(Message::U2fOff));
    }
}
