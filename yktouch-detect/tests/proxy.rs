//! Socket-proxy behavior against real Unix sockets in a temp directory:
//! install protocol, relay fidelity, crash recovery, shutdown restore.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::sleep;

use yktouch_core::ShutdownRegistry;
use yktouch_detect::proxy::{self, TriggerRule};

/// Accept connections and echo everything back, like a very polite agent.
fn spawn_echo_backend(listener: UnixListener) {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn round_trip(socket: &Path, payload: &[u8]) -> Vec<u8> {
    let mut client = UnixStream::connect(socket).await.expect("connect proxy");
    client.write_all(payload).await.expect("write");
    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).await.expect("read echo");
    echoed
}

#[tokio::test]
async fn install_relay_and_restore() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("agent.sock");
    let original_path = dir.path().join("agent.sock.original");

    // The "real" agent binds first; the proxy renames it aside.
    let backend = UnixListener::bind(&socket_path).expect("bind backend");
    spawn_echo_backend(backend);

    let (check_tx, mut check_rx) = mpsc::channel(1);
    let shutdown = ShutdownRegistry::new();
    tokio::spawn(proxy::watch(
        "detector/test-ssh",
        socket_path.clone(),
        TriggerRule::AnyTraffic,
        check_tx,
        shutdown.clone(),
    ));

    wait_until("proxy install", || original_path.exists()).await;
    assert!(socket_path.exists(), "proxy listener must replace the socket");

    // Bytes must come back verbatim — the echo proves both relay
    // directions are byte-identical and order-preserving.
    let payload = b"\x00\x00\x00\x01\x0bsign-please";
    assert_eq!(round_trip(&socket_path, payload).await, payload);

    // Any traffic on an SSH-style proxy is a check trigger.
    wait_until("check trigger", || check_rx.try_recv().is_ok()).await;

    // Coordinated shutdown puts the original socket back.
    shutdown.drain().await;
    assert!(!original_path.exists(), "marker must be consumed on shutdown");
    assert!(socket_path.exists(), "original socket must be restored");

    // And the restored socket is the real backend again.
    assert_eq!(round_trip(&socket_path, b"hello").await, b"hello");
}

#[tokio::test]
async fn substring_rule_only_triggers_on_marker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("gpg-agent.sock");
    let original_path = dir.path().join("gpg-agent.sock.original");

    let backend = UnixListener::bind(&socket_path).expect("bind backend");
    spawn_echo_backend(backend);

    let (check_tx, mut check_rx) = mpsc::channel(1);
    let shutdown = ShutdownRegistry::new();
    tokio::spawn(proxy::watch(
        "detector/test-gpg-agent",
        socket_path.clone(),
        TriggerRule::Substring(b"PKDECRYPT"),
        check_tx,
        shutdown.clone(),
    ));
    wait_until("proxy install", || original_path.exists()).await;

    round_trip(&socket_path, b"KEYINFO --list\n").await;
    sleep(Duration::from_millis(50)).await;
    assert!(check_rx.try_recv().is_err(), "no trigger without the marker");

    round_trip(&socket_path, b"PKDECRYPT --inquire\n").await;
    wait_until("check trigger", || check_rx.try_recv().is_ok()).await;

    shutdown.drain().await;
}

#[tokio::test]
async fn stale_marker_recovers_without_re_renaming() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("agent.sock");
    let original_path = dir.path().join("agent.sock.original");

    // Crash aftermath: the real agent lives at `.original`, the plain
    // path holds the dead listener of the crashed run.
    let backend = UnixListener::bind(&original_path).expect("bind backend at marker");
    spawn_echo_backend(backend);
    drop(UnixListener::bind(&socket_path).expect("bind stale listener"));
    assert!(socket_path.exists(), "stale socket file left behind");

    let (check_tx, _check_rx) = mpsc::channel(1);
    let shutdown = ShutdownRegistry::new();
    tokio::spawn(proxy::watch(
        "detector/test-recover",
        socket_path.clone(),
        TriggerRule::AnyTraffic,
        check_tx,
        shutdown.clone(),
    ));

    // The recovered proxy must relay to the backend behind the marker.
    wait_until("proxy recovery", || socket_path.exists()).await;
    let mut echoed = Vec::new();
    for _ in 0..100 {
        // The stale listener is replaced asynchronously; retry until the
        // new proxy answers.
        if let Ok(mut client) = UnixStream::connect(&socket_path).await {
            if client.write_all(b"ping").await.is_ok() {
                let mut buf = vec![0u8; 4];
                if client.read_exact(&mut buf).await.is_ok() {
                    echoed = buf;
                    break;
                }
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(echoed, b"ping");
    assert!(original_path.exists(), "marker must not be re-renamed");

    shutdown.drain().await;
    assert!(!original_path.exists());
    assert!(socket_path.exists());
}

#[tokio::test]
async fn missing_socket_disables_the_proxy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path: PathBuf = dir.path().join("no-such.sock");

    let (check_tx, _check_rx) = mpsc::channel(1);
    let shutdown = ShutdownRegistry::new();
    let task = tokio::spawn(proxy::watch(
        "detector/test-missing",
        socket_path.clone(),
        TriggerRule::AnyTraffic,
        check_tx,
        shutdown.clone(),
    ));

    // The task must give up on its own and leave nothing behind.
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("proxy task must exit")
        .expect("proxy task must not panic");
    assert!(!socket_path.exists());
    assert!(!dir.path().join("no-such.sock.original").exists());

    // And the drain must not hang on an owner that never registered.
    tokio::time::timeout(Duration::from_secs(1), shutdown.drain())
        .await
        .expect("drain must complete");
}
