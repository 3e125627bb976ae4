//! Device-node churn watcher: bridges `notify` (inotify) events on a
//! devices directory into an async channel of create/remove events.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use notify::Watcher as _;
use tokio::sync::mpsc;
use tracing::warn;

/// Directory holding the hidraw character devices.
pub const DEVICES_DIR: &str = "/dev";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Created(PathBuf),
    Removed(PathBuf),
}

/// Start watching `dir` for device-node creation and removal.
///
/// The returned watcher must be kept alive for as long as events are
/// wanted; dropping it ends the stream.
pub fn watch(
    dir: &Path,
) -> anyhow::Result<(notify::RecommendedWatcher, mpsc::Receiver<DeviceEvent>)> {
    let (tx, rx) = mpsc::channel::<DeviceEvent>(64);

    // notify's callback is sync; blocking_send is fine on its thread and
    // device churn is far too slow to fill the channel.
    let mut watcher = notify::RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                for path in event.paths {
                    let mapped = match event.kind {
                        notify::EventKind::Create(_) => DeviceEvent::Created(path),
                        notify::EventKind::Remove(_) => DeviceEvent::Removed(path),
                        _ => continue,
                    };
                    if tx.blocking_send(mapped).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!("device watcher notify error: {e}"),
        },
        notify::Config::default(),
    )
    .context("create device watcher")?;

    watcher
        .watch(dir, notify::RecursiveMode::NonRecursive)
        .with_context(|| format!("watch {}", dir.display()))?;

    Ok((watcher, rx))
}

/// `true` when `path` names a hidraw character device.
pub fn is_hidraw(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("hidraw"))
}
