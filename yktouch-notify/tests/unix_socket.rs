//! Wire behavior of the external broadcast socket.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt as _;
use tokio::net::UnixStream;
use tokio::time::sleep;

use yktouch_core::{EventBus, Message, ShutdownRegistry};
use yktouch_notify::unix_socket;

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn clients_receive_fixed_width_tokens() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("yktouch.socket");

    let bus = EventBus::new();
    let shutdown = ShutdownRegistry::new();
    tokio::spawn(unix_socket::run_at(
        socket_path.clone(),
        Arc::clone(&bus),
        shutdown.clone(),
    ));
    wait_until("listener", || socket_path.exists()).await;

    let mut client = UnixStream::connect(&socket_path).await.expect("connect");
    // Connection handling is asynchronous; let the writer task register
    // before publishing.
    sleep(Duration::from_millis(50)).await;

    bus.publish(Message::U2fOn).await;
    bus.publish(Message::U2fOff).await;

    // Two transitions arrive as exactly two 5-byte tokens, no framing.
    let mut wire = [0u8; 2 * Message::WIRE_LEN];
    client.read_exact(&mut wire).await.expect("read tokens");
    assert_eq!(&wire[..5], b"U2F_1");
    assert_eq!(&wire[5..], b"U2F_0");

    shutdown.drain().await;
    assert!(!socket_path.exists(), "socket must be unlinked on shutdown");
}

#[tokio::test]
async fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("yktouch.socket");

    // Leftover from a crashed run.
    drop(tokio::net::UnixListener::bind(&socket_path).expect("stale listener"));
    assert!(socket_path.exists());

    let bus = EventBus::new();
    let shutdown = ShutdownRegistry::new();
    tokio::spawn(unix_socket::run_at(
        socket_path.clone(),
        Arc::clone(&bus),
        shutdown.clone(),
    ));

    // The sink must replace the stale file and serve.
    let mut received = Vec::new();
    for _ in 0..100 {
        if let Ok(mut client) = UnixStream::connect(&socket_path).await {
            sleep(Duration::from_millis(50)).await;
            bus.publish(Message::HmacOn).await;
            let mut token = [0u8; Message::WIRE_LEN];
            if client.read_exact(&mut token).await.is_ok() {
                received = token.to_vec();
                break;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(received, b"MAC_1");

    shutdown.drain().await;
}
