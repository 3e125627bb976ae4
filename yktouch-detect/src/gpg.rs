//! GPG touch-wait detector.
//!
//! Two cooperating pieces: a file watcher that turns "open" activity on
//! the shadowed key files into coalesced check requests, and a checker
//! that probes the running gpg-agent over its Assuan socket.  A probe
//! that has not answered within the configured window is taken as
//! evidence the agent is blocked on the token; fast card operations
//! answer well inside it and publish nothing.
//!
//! The watcher uses the raw `inotify` interface because open events are
//! not surfaced by higher-level watcher crates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, bail};
use futures_util::StreamExt as _;
use inotify::{EventMask, EventStream, Inotify, WatchMask};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use yktouch_core::{EventBus, Message, TimingConfig};

/// What the watcher loop observed before returning.
enum WatchOutcome {
    /// A watched file was deleted or moved (atomic replace); the watch
    /// must be re-established after a cool-down.
    Rearm,
    /// The event stream died; the detector stays disabled.
    Dead,
}

/// Watch the key-material files for open activity, feeding `check_tx`.
///
/// Failure to establish a watch disables this detector for the process
/// lifetime; a deletion or rename of a watched path tears the watch down
/// and re-establishes it after a short cool-down (this is what an atomic
/// replace of the backing file looks like).
pub async fn watch_files(files: Vec<PathBuf>, check_tx: mpsc::Sender<()>, timing: TimingConfig) {
    loop {
        let stream = match establish(&files) {
            Ok(stream) => stream,
            Err(e) => {
                error!("cannot establish a watch on GPG key files: {e:#}");
                return;
            }
        };
        debug!(files = files.len(), "GPG key file watch established");

        match run(stream, &check_tx).await {
            WatchOutcome::Rearm => sleep(timing.watch_rearm_delay()).await,
            WatchOutcome::Dead => return,
        }
    }
}

fn establish(files: &[PathBuf]) -> anyhow::Result<EventStream<[u8; 1024]>> {
    let inotify = Inotify::init().context("inotify init")?;
    for file in files {
        inotify
            .watches()
            .add(
                file,
                WatchMask::OPEN | WatchMask::DELETE_SELF | WatchMask::MOVE_SELF,
            )
            .with_context(|| format!("watch {}", file.display()))?;
    }
    inotify
        .into_event_stream([0u8; 1024])
        .context("inotify event stream")
}

async fn run(mut stream: EventStream<[u8; 1024]>, check_tx: &mpsc::Sender<()>) -> WatchOutcome {
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if event.mask.contains(EventMask::OPEN) {
                    // A full channel means a check is already pending;
                    // coalesce instead of queueing.
                    let _ = check_tx.try_send(());
                } else if event
                    .mask
                    .intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF | EventMask::IGNORED)
                {
                    debug!("watched GPG key file replaced, re-establishing watch");
                    return WatchOutcome::Rearm;
                }
            }
            Err(e) => {
                warn!("GPG key file watch error: {e}");
                return WatchOutcome::Dead;
            }
        }
    }
    WatchOutcome::Dead
}

/// Serve check requests: probe the agent and publish `GPG_1`/`GPG_0`
/// around probes that stall past the timeout.
///
/// Shared by the GPG file watcher and the socket proxies — both
/// ultimately ask the same token for a touch.
pub async fn check_on_request(
    mut check_rx: mpsc::Receiver<()>,
    bus: Arc<EventBus>,
    agent_socket: PathBuf,
    timing: TimingConfig,
) {
    while check_rx.recv().await.is_some() {
        // Give the backend a moment to actually start talking to the
        // token, otherwise the probe races ahead of the operation.
        sleep(timing.gpg_check_delay()).await;

        let probe = probe_agent(&agent_socket);
        tokio::pin!(probe);

        tokio::select! {
            outcome = &mut probe => {
                // Agent answered in time: no touch was required.
                if let Err(e) = outcome {
                    debug!("agent probe failed: {e:#}");
                }
            }
            _ = sleep(timing.gpg_probe_timeout()) => {
                bus.publish(Message::GpgOn).await;
                if let Err(e) = probe.await {
                    debug!("agent probe failed after touch wait: {e:#}");
                }
                bus.publish(Message::GpgOff).await;
            }
        }
    }
}

/// One Assuan round-trip against the agent: consume the greeting, send a
/// `GETINFO version`, wait for the `OK`.
///
/// The agent serves requests in order, so the reply stalls exactly while
/// a card operation is blocked on the user.
async fn probe_agent(socket: &Path) -> anyhow::Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connect agent socket {}", socket.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    read_status(&mut lines).await.context("agent greeting")?;
    write_half
        .write_all(b"GETINFO version\n")
        .await
        .context("send probe")?;
    read_status(&mut lines).await.context("probe response")?;
    Ok(())
}

/// Read Assuan lines until a terminal `OK` or `ERR` status.
async fn read_status(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
) -> anyhow::Result<()> {
    while let Some(line) = lines.next_line().await? {
        if line.starts_with("OK") {
            return Ok(());
        }
        if line.starts_with("ERR") {
            bail!("agent returned: {line}");
        }
        // S / D / # lines carry status data we don't care about.
    }
    bail!("agent closed the connection");
}
