//! The event bus: a registry of named consumer channels with
//! broadcast-on-publish semantics.
//!
//! Detectors call [`EventBus::publish`], which enqueues the message on a
//! bounded inbox.  A dedicated fan-out task drains the inbox and forwards
//! each message to every registered consumer with an awaited send, so a
//! slow consumer can never stall a detector's device-facing loop — at
//! worst it stalls the fan-out task while the inbox absorbs the burst.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::warn;

use crate::Message;

/// Depth of each consumer's channel.
const CONSUMER_BUFFER: usize = 10;

/// Depth of the publish inbox drained by the fan-out task.
const INBOX_BUFFER: usize = 32;

type ConsumerMap = HashMap<String, mpsc::Sender<Message>>;

pub struct EventBus {
    inbox: mpsc::Sender<Message>,
    consumers: Arc<Mutex<ConsumerMap>>,
}

impl EventBus {
    /// Create the bus and spawn its fan-out task on the current runtime.
    pub fn new() -> Arc<Self> {
        let (inbox, mut rx) = mpsc::channel(INBOX_BUFFER);
        let consumers: Arc<Mutex<ConsumerMap>> = Arc::default();

        let fanout = Arc::clone(&consumers);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                // Snapshot the senders so the lock is not held across awaits.
                let targets: Vec<(String, mpsc::Sender<Message>)> = lock(&fanout)
                    .iter()
                    .map(|(name, tx)| (name.clone(), tx.clone()))
                    .collect();

                for (name, tx) in targets {
                    if tx.send(message).await.is_err() {
                        warn!(consumer = %name, "consumer channel closed, dropping message");
                    }
                }
            }
        });

        Arc::new(Self { inbox, consumers })
    }

    /// Register a consumer under `name` and return its receive channel.
    ///
    /// Registering the same name twice replaces the previous channel; the
    /// old receiver stops seeing messages.
    pub fn register(&self, name: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        lock(&self.consumers).insert(name.to_string(), tx);
        rx
    }

    /// Queue `message` for delivery to every registered consumer.
    ///
    /// Per-consumer delivery order matches publish order.  This awaits only
    /// when the inbox is full, which means the fan-out task itself is
    /// stalled behind a consumer.
    pub async fn publish(&self, message: Message) {
        if self.inbox.send(message).await.is_err() {
            // Only reachable if the fan-out task panicked.
            warn!(%message, "event bus fan-out task is gone, message lost");
        }
    }
}

/// Lock the consumer map, recovering from a poisoned lock — the map itself
/// is always left in a consistent state by the operations above.
fn lock(consumers: &Mutex<ConsumerMap>) -> MutexGuard<'_, ConsumerMap> {
    match consumers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
