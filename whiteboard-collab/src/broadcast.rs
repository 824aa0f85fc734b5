//! Ordered, asynchronous fan-out to connected clients.
//!
//! ```text
//!  publish() ──► dispatch queue ──► dispatcher task ──┬──► worker(Alice) ──► channel
//!  send_to() ─┘   (unbounded)       (single consumer) ├──► worker(Bob)   ──► channel
//!  retire()  ─┘                                       └──► worker(Carol) ──► channel
//! ```
//!
//! The dispatcher is the only consumer of the dispatch queue, so the order
//! in which callers publish is the order in which fan-out begins. Each
//! recipient has its own FIFO delivery worker: if X is published before Y,
//! every recipient that gets both gets X first. A slow recipient only
//! stalls its own worker.
//!
//! Delivery failures are counted and logged, never reported to the
//! publisher. After `max_consecutive_failures` failures in a row the
//! recipient is reported on the eviction channel so the owner can drop it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::handle::{ClientEvent, ClientHandle};

/// Broadcast engine configuration.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Upper bound on a single delivery to one client
    pub delivery_timeout: Duration,
    /// Consecutive failures before a recipient is reported for eviction (0 = never)
    pub max_consecutive_failures: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_secs(5),
            max_consecutive_failures: 3,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub evicted: u64,
}

/// Lock-free counters shared by the dispatcher and every worker.
#[derive(Default)]
struct AtomicBroadcastStats {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    evicted: AtomicU64,
}

/// A recipient that stopped accepting deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub username: String,
    pub connection_id: Uuid,
}

enum Dispatch {
    Publish {
        recipients: Vec<ClientHandle>,
        exclude: Option<String>,
        event: Arc<ClientEvent>,
    },
    Retire(ClientHandle),
}

pub struct BroadcastEngine {
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    evictions_rx: Mutex<Option<mpsc::UnboundedReceiver<Eviction>>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastEngine {
    /// Create the engine and spawn its dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: BroadcastConfig) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (evictions_tx, evictions_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AtomicBroadcastStats::default());

        let dispatcher = Dispatcher {
            workers: HashMap::new(),
            config,
            stats: stats.clone(),
            evictions_tx,
        };
        tokio::spawn(dispatcher.run(dispatch_rx));

        Self {
            dispatch_tx,
            evictions_rx: Mutex::new(Some(evictions_rx)),
            stats,
        }
    }

    /// Fan `event` out to `recipients`, skipping the user named `exclude`.
    ///
    /// Returns immediately; delivery happens on the recipients' workers.
    pub fn publish(&self, recipients: &[ClientHandle], exclude: Option<&str>, event: ClientEvent) {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.enqueue(Dispatch::Publish {
            recipients: recipients.to_vec(),
            exclude: exclude.map(str::to_string),
            event: Arc::new(event),
        });
    }

    /// Send one event to one client, ordered with every other publish.
    pub fn send_to(&self, handle: &ClientHandle, event: ClientEvent) {
        self.publish(std::slice::from_ref(handle), None, event);
    }

    /// Stop delivering to `handle` once everything queued before this call
    /// has been delivered. Later publishes naming it are ignored.
    pub fn retire(&self, handle: &ClientHandle) {
        self.enqueue(Dispatch::Retire(handle.clone()));
    }

    /// Take the eviction receiver (can only be called once).
    pub fn take_evictions(&self) -> Option<mpsc::UnboundedReceiver<Eviction>> {
        self.evictions_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
        }
    }

    fn enqueue(&self, dispatch: Dispatch) {
        if self.dispatch_tx.send(dispatch).is_err() {
            log::error!("Broadcast dispatcher has stopped; event dropped");
        }
    }
}

struct Dispatcher {
    workers: HashMap<Uuid, mpsc::UnboundedSender<Arc<ClientEvent>>>,
    config: BroadcastConfig,
    stats: Arc<AtomicBroadcastStats>,
    evictions_tx: mpsc::UnboundedSender<Eviction>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
        while let Some(dispatch) = rx.recv().await {
            match dispatch {
                Dispatch::Publish {
                    recipients,
                    exclude,
                    event,
                } => {
                    for handle in recipients {
                        if exclude.as_deref() == Some(handle.username()) || handle.is_retired() {
                            continue;
                        }
                        self.push(handle, event.clone());
                    }
                }
                Dispatch::Retire(handle) => {
                    handle.mark_retired();
                    // Dropping the sender lets the worker drain and exit.
                    self.workers.remove(&handle.id());
                    log::debug!("Retired delivery worker for {}", handle.username());
                }
            }
        }
        log::debug!("Broadcast dispatcher stopped");
    }

    fn push(&mut self, handle: ClientHandle, event: Arc<ClientEvent>) {
        let id = handle.id();
        if let Some(worker) = self.workers.get(&id) {
            if worker.send(event.clone()).is_ok() {
                return;
            }
            // The worker gave up on this client after evicting it.
            if handle.is_retired() {
                return;
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(event);
        tokio::spawn(deliver_loop(
            handle,
            rx,
            self.config.clone(),
            self.stats.clone(),
            self.evictions_tx.clone(),
        ));
        self.workers.insert(id, tx);
    }
}

/// Per-recipient worker: delivers in FIFO order until retired.
///
/// Stops at the first failure once the client is retired or evicted, and
/// drops whatever is still queued for it.
async fn deliver_loop(
    handle: ClientHandle,
    mut rx: mpsc::UnboundedReceiver<Arc<ClientEvent>>,
    config: BroadcastConfig,
    stats: Arc<AtomicBroadcastStats>,
    evictions_tx: mpsc::UnboundedSender<Eviction>,
) {
    let mut consecutive_failures = 0u32;

    while let Some(event) = rx.recv().await {
        match handle.deliver(event, config.delivery_timeout).await {
            Ok(()) => {
                consecutive_failures = 0;
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                log::trace!("Delivered event to {}", handle.username());
            }
            Err(e) => {
                consecutive_failures += 1;
                stats.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("{e} ({consecutive_failures} in a row)");

                if handle.is_retired() {
                    break;
                }

                let limit = config.max_consecutive_failures;
                if limit > 0 && consecutive_failures >= limit {
                    stats.evicted.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Reporting unresponsive client {} for eviction", handle.username());
                    handle.mark_retired();
                    let _ = evictions_tx.send(Eviction {
                        username: handle.username().to_string(),
                        connection_id: handle.id(),
                    });
                    break;
                }
            }
        }
    }

    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        log::debug!("Dropped {dropped} undelivered events for {}", handle.username());
    }
}
