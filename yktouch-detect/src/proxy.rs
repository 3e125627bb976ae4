//! Transparent Unix-socket proxy for agent sockets.
//!
//! The real socket is renamed aside to `<path>.original` and a listener
//! takes its place; every accepted connection is relayed byte-for-byte
//! to the real backend while the outbound direction is scanned for a
//! trigger.  The `.original` file doubles as the crash-recovery marker:
//! if it already exists at startup, a previous run died with the proxy
//! half-installed and the current socket is our own stale listener.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use yktouch_core::ShutdownRegistry;

const RELAY_BUFFER: usize = 8192;

/// What makes relayed outbound traffic count as a touch-check trigger.
#[derive(Debug, Clone, Copy)]
pub enum TriggerRule {
    /// Any traffic at all — SSH agent framing is opaque enough that every
    /// request may end in a key operation.
    AnyTraffic,
    /// A protocol operation marker must appear in the relayed bytes.
    Substring(&'static [u8]),
}

impl TriggerRule {
    fn matches(self, data: &[u8]) -> bool {
        match self {
            TriggerRule::AnyTraffic => true,
            TriggerRule::Substring(marker) => {
                data.windows(marker.len()).any(|window| window == marker)
            }
        }
    }
}

/// Install the proxy over `socket_path` and serve until shutdown.
///
/// `name` is the shutdown-registry key.  Every failure path here either
/// leaves the filesystem untouched or leaves the `.original` marker for
/// the next startup to recover from; it never leaves the path empty.
pub async fn watch(
    name: &'static str,
    socket_path: PathBuf,
    rule: TriggerRule,
    check_tx: mpsc::Sender<()>,
    shutdown: Arc<ShutdownRegistry>,
) {
    if !socket_path.exists() {
        error!(
            "cannot proxy '{}', the socket does not exist",
            socket_path.display()
        );
        return;
    }

    let original_path = original_path_for(&socket_path);
    if original_path.exists() {
        // A previous run crashed after the rename: the current socket is
        // our own dead listener, the `.original` is still the real one.
        warn!(
            "'{}' already exists, assuming it is the real socket and recovering",
            original_path.display()
        );
        if let Err(e) = std::fs::remove_file(&socket_path) {
            error!(
                "cannot remove '{}' to recover from a previous crash: {e}",
                socket_path.display()
            );
            return;
        }
    } else if let Err(e) = std::fs::rename(&socket_path, &original_path) {
        error!(
            "cannot move '{}' aside to set up a proxy: {e}",
            socket_path.display()
        );
        return;
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot establish a proxy socket at '{}': {e}", socket_path.display());
            restore(&original_path, &socket_path);
            return;
        }
    };
    debug!("{name} proxy on '{}' is established", socket_path.display());

    let mut handle = shutdown.register(name);

    loop {
        tokio::select! {
            ack = handle.requested() => {
                drop(listener);
                restore(&original_path, &socket_path);
                ack.done();
                return;
            }
            accepted = listener.accept() => {
                let (client, _) = match accepted {
                    Ok(connection) => connection,
                    Err(e) => {
                        error!("cannot accept incoming {name} proxy connection: {e}");
                        return;
                    }
                };
                let backend = match UnixStream::connect(&original_path).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("cannot connect to the original socket '{}': {e}", original_path.display());
                        return;
                    }
                };

                let (client_read, client_write) = client.into_split();
                let (backend_read, backend_write) = backend.into_split();
                // Only the outbound direction is scanned for triggers.
                tokio::spawn(relay(client_read, backend_write, Some((rule, check_tx.clone()))));
                tokio::spawn(relay(backend_read, client_write, None));
            }
        }
    }
}

fn original_path_for(socket_path: &Path) -> PathBuf {
    let mut path = socket_path.as_os_str().to_os_string();
    path.push(".original");
    PathBuf::from(path)
}

/// Put the real socket back.  Failure leaves the host degraded and needs
/// a manual fix, so it is logged loudly but never blocks exit.
fn restore(original_path: &Path, socket_path: &Path) {
    if let Err(e) = std::fs::rename(original_path, socket_path) {
        error!(
            "cannot restore original socket '{}' from '{}': {e} — restore it manually",
            socket_path.display(),
            original_path.display()
        );
    }
}

/// Copy bytes in one direction until EOF or an error, then shut the
/// write side down so the peer sees EOF and the whole session unwinds.
async fn relay(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    scan: Option<(TriggerRule, mpsc::Sender<()>)>,
) {
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if let Some((rule, check_tx)) = &scan
            && rule.matches(&buf[..n])
        {
            // Full channel: a check is already pending, coalesce.
            let _ = check_tx.try_send(());
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_traffic_always_matches() {
        assert!(TriggerRule::AnyTraffic.matches(b"x"));
        assert!(TriggerRule::AnyTraffic.matches(b"\x00\x00"));
    }

    #[test]
    fn substring_rule_needs_the_marker() {
        let rule = TriggerRule::Substring(b"PKDECRYPT");
        assert!(rule.matches(b"D 12 PKDECRYPT --something\n"));
        assert!(rule.matches(b"PKDECRYPT"));
        assert!(!rule.matches(b"KEYINFO --list\n"));
        assert!(!rule.matches(b"PKDECRYP"));
        assert!(!rule.matches(b""));
    }

    #[test]
    fn original_path_appends_suffix() {
        assert_eq!(
            original_path_for(Path::new("/run/user/1000/gnupg/S.gpg-agent.ssh")),
            PathBuf::from("/run/user/1000/gnupg/S.gpg-agent.ssh.original")
        );
    }
}
