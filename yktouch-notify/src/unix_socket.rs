//! External broadcast socket.
//!
//! Third-party clients connect to `$XDG_RUNTIME_DIR/yktouch.socket` and
//! receive one raw 5-byte token per state transition — no framing beyond
//! the fixed width.  The socket is unlinked during coordinated shutdown;
//! a stale file left by a crashed predecessor is removed at startup.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::AsyncWriteExt as _;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use yktouch_core::{EventBus, Message, ShutdownRegistry};

pub const SOCKET_NAME: &str = "yktouch.socket";

/// Per-client channel depth; a client that stops reading is disconnected
/// by its writer task rather than ever stalling the broadcast.
const CLIENT_BUFFER: usize = 10;

type ClientMap = HashMap<u64, mpsc::Sender<Message>>;

/// Resolve the socket path and serve until shutdown.
pub async fn run(bus: Arc<EventBus>, shutdown: Arc<ShutdownRegistry>) {
    let runtime_dir = match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            error!("cannot set up the socket notifier, $XDG_RUNTIME_DIR is not defined");
            return;
        }
    };
    run_at(runtime_dir.join(SOCKET_NAME), bus, shutdown).await;
}

/// Serve the broadcast socket at an explicit path.
pub async fn run_at(socket_path: PathBuf, bus: Arc<EventBus>, shutdown: Arc<ShutdownRegistry>) {
    if socket_path.exists() {
        warn!(
            "'{}' already exists, assuming it is stale and removing it",
            socket_path.display()
        );
        if let Err(e) = std::fs::remove_file(&socket_path) {
            error!(
                "cannot remove '{}' to recover from a previous crash: {e}",
                socket_path.display()
            );
            return;
        }
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot establish the notifier socket '{}': {e}", socket_path.display());
            return;
        }
    };
    if let Err(e) =
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
    {
        warn!("cannot chmod 0600 '{}': {e}", socket_path.display());
    }
    debug!("socket notifier on '{}' is established", socket_path.display());

    let clients: Arc<Mutex<ClientMap>> = Arc::default();

    // Broadcast task.  Client buffers absorb slowness; a client whose
    // buffer is full has stopped reading and gets disconnected rather
    // than ever stalling the broadcast.
    {
        let clients = Arc::clone(&clients);
        let mut messages = bus.register("notifier/unix_socket");
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let targets: Vec<(u64, mpsc::Sender<Message>)> = lock(&clients)
                    .iter()
                    .map(|(id, tx)| (*id, tx.clone()))
                    .collect();
                for (id, tx) in targets {
                    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(message) {
                        warn!(client = id, "client is not reading, disconnecting it");
                        lock(&clients).remove(&id);
                    }
                }
            }
        });
    }

    let mut handle = shutdown.register("notifier/unix_socket");
    let mut next_client_id: u64 = 0;

    loop {
        tokio::select! {
            ack = handle.requested() => {
                drop(listener);
                if let Err(e) = std::fs::remove_file(&socket_path) {
                    error!("cannot clean up notifier socket '{}': {e}", socket_path.display());
                }
                ack.done();
                return;
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(connection) => connection,
                    Err(e) => {
                        error!("cannot accept incoming notifier connection: {e}");
                        return;
                    }
                };
                let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
                let id = next_client_id;
                next_client_id += 1;
                lock(&clients).insert(id, tx);
                tokio::spawn(serve_client(id, stream, rx, Arc::clone(&clients)));
            }
        }
    }
}

/// Write tokens to one client until it goes away.
async fn serve_client(
    id: u64,
    mut stream: UnixStream,
    mut messages: mpsc::Receiver<Message>,
    clients: Arc<Mutex<ClientMap>>,
) {
    while let Some(message) = messages.recv().await {
        if stream.write_all(message.as_bytes()).await.is_err() {
            break;
        }
    }
    lock(&clients).remove(&id);
}

fn lock(clients: &Mutex<ClientMap>) -> MutexGuard<'_, ClientMap> {
    match clients.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
