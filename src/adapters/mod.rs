//! Venue adapters: streaming + polling price acquisition and order
//! submission for one market each.
//!
//! Every adapter owns its connection state, its own backoff and circuit
//! breaker per loop, and bounded out-channels that drop on overflow
//! rather than block ingestion. Loss counters are exposed per channel.

pub mod aemo;
pub mod jepx;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::domain::{VenueId, VenueOrder, VenuePrice};
use crate::error::Result;

pub use aemo::AemoAdapter;
pub use jepx::JepxAdapter;

/// Capability surface the grid manager programs against. The concrete
/// venue kinds stay private to this module.
#[async_trait]
pub trait MarketAdapter: Send + Sync {
    fn venue(&self) -> VenueId;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Bounded venue-price stream; only the first caller receives it.
    fn take_price_stream(&self) -> Option<mpsc::Receiver<VenuePrice>>;

    /// Latest observed price for a region.
    async fn latest_price(&self, region: &str) -> Result<VenuePrice>;

    /// Validate locally, dispatch, and return the venue's order id.
    async fn submit_order(&self, order: &VenueOrder) -> Result<String>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Drop counters per out-channel, keyed by channel name.
    fn loss_counters(&self) -> HashMap<String, u64>;
}

/// Bounded sender that drops on overflow and counts the losses.
/// Stale market data is preferable to a blocked ingestion loop.
pub(crate) struct LossySender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> LossySender<T> {
    pub fn new(name: &'static str, capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                name,
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn send(&self, value: T) {
        if self.tx.try_send(value).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(channel = self.name, "channel full, dropping message");
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
