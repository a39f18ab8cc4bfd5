//! Async message bus — decouples channels from the agent loop.
//!
//! Two FIFO queues (`inbound`, `outbound`), per-channel subscriber lists for
//! outbound fan-out, and one-shot response waiters for the synchronous
//! request/response pattern used by the HTTP API channel.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use crate::types::Envelope;
use crate::utils::gen_hex_id;

/// An async outbound subscriber. Errors are logged by the dispatch loop and
/// never propagate.
pub type Subscriber =
    Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// Bus failure — only possible when a queue has been closed.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("message queue closed")]
    Closed,
}

// A queue endpoint pair that is bounded or unbounded depending on config.
enum Tx {
    Bounded(mpsc::Sender<Envelope>),
    Unbounded(mpsc::UnboundedSender<Envelope>),
}

enum Rx {
    Bounded(mpsc::Receiver<Envelope>),
    Unbounded(mpsc::UnboundedReceiver<Envelope>),
}

impl Tx {
    async fn send(&self, envelope: Envelope) -> Result<(), BusError> {
        match self {
            // Bounded senders suspend when full, transmitting backpressure
            // to the producing channel.
            Tx::Bounded(tx) => tx.send(envelope).await.map_err(|_| BusError::Closed),
            Tx::Unbounded(tx) => tx.send(envelope).map_err(|_| BusError::Closed),
        }
    }
}

impl Rx {
    async fn recv(&mut self) -> Option<Envelope> {
        match self {
            Rx::Bounded(rx) => rx.recv().await,
            Rx::Unbounded(rx) => rx.recv().await,
        }
    }
}

fn make_queue(maxsize: usize) -> (Tx, Rx) {
    if maxsize == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (Tx::Unbounded(tx), Rx::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(maxsize);
        (Tx::Bounded(tx), Rx::Bounded(rx))
    }
}

/// The message bus connecting channels ↔ agent loop.
///
/// - Channels and the scheduler publish to `inbound`
/// - The agent loop consumes `inbound` and publishes replies to `outbound`
/// - `dispatch_outbound` fans outbound envelopes to per-channel subscribers,
///   short-circuiting envelopes claimed by a response waiter
pub struct MessageBus {
    inbound_tx: Tx,
    inbound_rx: Mutex<Rx>,
    outbound_tx: Tx,
    outbound_rx: Mutex<Rx>,
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    response_waiters: Arc<StdMutex<HashMap<String, oneshot::Sender<Envelope>>>>,
    running: AtomicBool,
}

impl MessageBus {
    /// Create a bus. `maxsize == 0` means unbounded queues.
    pub fn new(maxsize: usize) -> Self {
        let (inbound_tx, inbound_rx) = make_queue(maxsize);
        let (outbound_tx, outbound_rx) = make_queue(maxsize);
        MessageBus {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            subscribers: RwLock::new(HashMap::new()),
            response_waiters: Arc::new(StdMutex::new(HashMap::new())),
            running: AtomicBool::new(false),
        }
    }

    pub async fn publish_inbound(&self, envelope: Envelope) -> Result<(), BusError> {
        self.inbound_tx.send(envelope).await
    }

    /// Dequeue the next inbound envelope, suspending until one is available.
    /// Returns `None` only if the queue is closed.
    pub async fn consume_inbound(&self) -> Option<Envelope> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }

    pub async fn publish_outbound(&self, envelope: Envelope) -> Result<(), BusError> {
        self.outbound_tx.send(envelope).await
    }

    /// Dequeue the next outbound envelope directly, bypassing subscriber
    /// dispatch. Only one consumer may drain the outbound queue — either
    /// this or `dispatch_outbound`, not both.
    pub async fn consume_outbound(&self) -> Option<Envelope> {
        let mut rx = self.outbound_rx.lock().await;
        rx.recv().await
    }

    /// Register an outbound subscriber for a channel. Multiple subscribers
    /// per channel are invoked in registration order.
    pub fn subscribe_outbound(&self, channel: impl Into<String>, callback: Subscriber) {
        let mut subs = self.subscribers.write().unwrap();
        subs.entry(channel.into()).or_default().push(callback);
    }

    /// Allocate a response waiter. Returns `(key, receiver)`; the publisher
    /// of the matching request sets `metadata.response_key = key`. If no
    /// response arrives within `timeout` the sender is dropped, which fails
    /// the receiver with a recv error — the waiting caller reads that as a
    /// timeout.
    pub fn create_response_waiter(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> (String, oneshot::Receiver<Envelope>) {
        let key = format!("_response_{}", gen_hex_id(8));
        let (tx, rx) = oneshot::channel();
        self.response_waiters.lock().unwrap().insert(key.clone(), tx);

        let waiters = Arc::clone(&self.response_waiters);
        let cleanup_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if waiters.lock().unwrap().remove(&cleanup_key).is_some() {
                debug!(key = %cleanup_key, "response waiter timed out");
            }
        });

        (key, rx)
    }

    /// Complete and remove a waiter. Idempotent; returns whether a live
    /// waiter existed.
    pub fn resolve_response(&self, key: &str, envelope: Envelope) -> bool {
        let sender = self.response_waiters.lock().unwrap().remove(key);
        match sender {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    /// The dispatch loop: drain the outbound queue and fan out to
    /// subscribers. Polls with a 1-second bounded wait so `stop()` is
    /// observed promptly.
    pub async fn dispatch_outbound(&self) {
        self.running.store(true, Ordering::SeqCst);
        while self.running.load(Ordering::SeqCst) {
            let msg = {
                let mut rx = self.outbound_rx.lock().await;
                match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(_) => continue,
                }
            };

            // A pending waiter owns the message: deliver directly, skip
            // subscriber dispatch.
            let response_key = msg.meta_str("response_key").to_string();
            if !response_key.is_empty() && self.resolve_response(&response_key, msg.clone()) {
                continue;
            }

            let handlers: Vec<Subscriber> = {
                let subs = self.subscribers.read().unwrap();
                subs.get(&msg.channel).cloned().unwrap_or_default()
            };
            if handlers.is_empty() {
                warn!(channel = %msg.channel, "no subscriber for channel, message dropped");
                continue;
            }
            for cb in handlers {
                if let Err(e) = cb(msg.clone()).await {
                    error!(channel = %msg.channel, error = %e, "outbound dispatch error");
                }
            }
        }
    }

    /// Clear the running flag; the dispatch loop exits at its next poll
    /// boundary.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
