//! Coordinated-shutdown registry.
//!
//! Detectors that hold exclusive OS resources (a hijacked agent socket, a
//! listener that must be unlinked) register here and receive a stop signal
//! before the process exits.  The drain waits for an acknowledgement from
//! every owner so no resource is abandoned mid-teardown; an owner whose
//! task already died is skipped — its leftovers are the crash-recovery
//! marker the next startup consumes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type StopSender = mpsc::Sender<oneshot::Sender<()>>;

pub struct ShutdownRegistry {
    owners: Mutex<HashMap<String, StopSender>>,
}

/// Held by a resource owner; resolves once shutdown is requested.
pub struct ShutdownHandle {
    rx: mpsc::Receiver<oneshot::Sender<()>>,
}

/// Proof that a stop signal was received; call [`ShutdownAck::done`] once
/// teardown is finished to unblock the drain.
pub struct ShutdownAck {
    tx: oneshot::Sender<()>,
}

impl ShutdownRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            owners: Mutex::new(HashMap::new()),
        })
    }

    /// Register a resource owner under `name`.
    ///
    /// The returned handle must be polled (see [`ShutdownHandle::requested`])
    /// for the lifetime of the resource; dropping it marks the owner dead
    /// and the drain will skip it.
    pub fn register(&self, name: &str) -> ShutdownHandle {
        let (tx, rx) = mpsc::channel(1);
        lock(&self.owners).insert(name.to_string(), tx);
        ShutdownHandle { rx }
    }

    /// Stop every registered owner and wait for each acknowledgement.
    ///
    /// Owners are drained sequentially; an owner that already exited is
    /// logged and skipped so a crashed detector cannot wedge process exit.
    pub async fn drain(&self) {
        let owners: Vec<(String, StopSender)> = lock(&self.owners).drain().collect();

        for (name, stop) in owners {
            let (ack_tx, ack_rx) = oneshot::channel();
            if stop.send(ack_tx).await.is_err() {
                warn!(owner = %name, "owner task already gone, skipping teardown");
                continue;
            }
            match ack_rx.await {
                Ok(()) => debug!(owner = %name, "teardown acknowledged"),
                Err(_) => warn!(owner = %name, "owner dropped without acknowledging teardown"),
            }
        }
    }
}

impl ShutdownHandle {
    /// Wait until coordinated shutdown is requested.
    ///
    /// Pends forever if the registry is dropped without draining, which
    /// only happens when the process is exiting anyway.
    pub async fn requested(&mut self) -> ShutdownAck {
        match self.rx.recv().await {
            Some(tx) => ShutdownAck { tx },
            None => std::future::pending().await,
        }
    }
}

impl ShutdownAck {
    /// Signal the drain that teardown is complete.
    pub fn done(self) {
        let _ = self.tx.send(());
    }
}

fn lock(owners: &Mutex<HashMap<String, StopSender>>) -> MutexGuard<'_, HashMap<String, StopSender>> {
    match owners.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
