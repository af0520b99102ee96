//! Sequenced event fan-out to external observers.
//!
//! Every emitted event gets a globally increasing sequence number and is
//! pushed to each subscribed observer whose filter permits it. Observer
//! queues are bounded; an event that does not fit is dropped for that
//! observer and counted, never blocking the emitter. A heartbeat fires
//! on a fixed interval carrying the observer count and server time.

use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::EventsConfig;
use crate::domain::{EventKind, PlatformEvent};

struct ObserverEntry {
    tx: mpsc::Sender<PlatformEvent>,
    /// None delivers everything
    filter: Option<HashSet<EventKind>>,
    last_sequence: AtomicU64,
    dropped: AtomicU64,
}

/// Handle returned to a subscriber.
pub struct Observer {
    pub id: u64,
    pub rx: mpsc::Receiver<PlatformEvent>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ObserverStats {
    pub id: u64,
    pub last_sequence: u64,
    pub dropped: u64,
}

pub struct EventBroadcaster {
    config: EventsConfig,
    sequence: AtomicU64,
    next_observer_id: AtomicU64,
    observers: RwLock<HashMap<u64, Arc<ObserverEntry>>>,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventBroadcaster {
    pub fn new(config: EventsConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            sequence: AtomicU64::new(0),
            next_observer_id: AtomicU64::new(1),
            observers: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            heartbeat_task: Mutex::new(None),
        }
    }

    /// Start the heartbeat loop.
    pub fn start(self: &Arc<Self>) {
        let broadcaster = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = std::time::Duration::from_secs(self.config.heartbeat_secs.max(1));

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.reset();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = tick.tick() => broadcaster.emit_heartbeat(),
                }
            }
        });
        *self.heartbeat_task.lock().expect("lock poisoned") = Some(task);
    }

    /// Register an observer. An empty/None filter receives every kind.
    pub fn subscribe(&self, filter: Option<HashSet<EventKind>>) -> Observer {
        let id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.config.observer_buffer.max(1));

        self.observers.write().expect("lock poisoned").insert(
            id,
            Arc::new(ObserverEntry {
                tx,
                filter,
                last_sequence: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        );
        debug!(observer = id, "observer subscribed");
        Observer { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.observers.write().expect("lock poisoned").remove(&id);
        debug!(observer = id, "observer unsubscribed");
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().expect("lock poisoned").len()
    }

    /// Emit an event: stamp the next global sequence and fan out
    /// non-blocking. Emissions after stop are discarded.
    pub fn emit(&self, kind: EventKind, data: Value) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut event = PlatformEvent::new(kind, data);
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let observers = self.observers.read().expect("lock poisoned");
        for entry in observers.values() {
            if let Some(filter) = &entry.filter {
                if !filter.contains(&kind) {
                    continue;
                }
            }
            if entry.tx.try_send(event.clone()).is_ok() {
                entry.last_sequence.store(event.sequence, Ordering::Relaxed);
            } else {
                entry.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn emit_heartbeat(&self) {
        self.emit(
            EventKind::Heartbeat,
            serde_json::json!({
                "server_time": Utc::now(),
                "clients": self.observer_count(),
                "timestamp": Utc::now().timestamp_millis(),
            }),
        );
    }

    /// Stop: further emissions are discarded and every observer channel
    /// closes exactly once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.heartbeat_task.lock().expect("lock poisoned").take() {
            let _ = task.await;
        }

        // Dropping the senders closes each observer's channel.
        self.observers.write().expect("lock poisoned").clear();
        info!("event broadcaster stopped");
    }

    pub fn observer_stats(&self) -> Vec<ObserverStats> {
        self.observers
            .read()
            .expect("lock poisoned")
            .iter()
            .map(|(id, entry)| ObserverStats {
                id: *id,
                last_sequence: entry.last_sequence.load(Ordering::Relaxed),
                dropped: entry.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }
}
