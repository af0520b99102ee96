//! Unified price aggregation and cross-market arbitrage detection.
//!
//! The manager owns the (venue, region) → unified price map. Adapters
//! feed it venue prices; it normalizes them to USD/MWh, forwards them on
//! a lossy stream, and scans the fresh snapshot for opportunities.

pub mod fx;

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::MarketAdapter;
use crate::config::GridConfig;
use crate::domain::{
    ArbitrageOpportunity, ExchangeRates, MarketStatus, UnifiedPrice, VenueId, VenuePrice,
};
use crate::error::{GridError, Result};
use fx::RateSource;

/// Route key for the symmetric transfer-cost matrix.
type Route = (VenueId, VenueId);

/// Grid interconnection cost in USD/MWh for known routes. Routes absent
/// in both directions pay the unknown-route penalty.
fn default_transfer_costs() -> HashMap<Route, f64> {
    let mut costs = HashMap::new();
    // No physical interconnection between AEMO and JEPX; virtual trade.
    costs.insert((VenueId::Aemo, VenueId::Jepx), 15.0);
    // Cross-continental virtual power purchase agreements.
    costs.insert((VenueId::Pjm, VenueId::Aemo), 20.0);
    costs.insert((VenueId::Pjm, VenueId::Jepx), 18.0);
    costs.insert((VenueId::Epex, VenueId::Aemo), 22.0);
    costs.insert((VenueId::Pjm, VenueId::Epex), 8.0);
    costs
}

const UNKNOWN_ROUTE_PENALTY: f64 = 25.0;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GridCounters {
    pub prices_processed: u64,
    pub unified_dropped: u64,
    pub opportunities_dropped: u64,
}

pub struct GridManager {
    config: GridConfig,
    adapters: Mutex<HashMap<VenueId, Arc<dyn MarketAdapter>>>,
    latest: RwLock<HashMap<(VenueId, String), UnifiedPrice>>,
    rates: RwLock<ExchangeRates>,
    transfer_costs: RwLock<HashMap<Route, f64>>,
    rate_source: Option<Arc<dyn RateSource>>,

    unified_tx: mpsc::Sender<UnifiedPrice>,
    unified_rx: Mutex<Option<mpsc::Receiver<UnifiedPrice>>>,
    opp_tx: mpsc::Sender<ArbitrageOpportunity>,
    opp_rx: Mutex<Option<mpsc::Receiver<ArbitrageOpportunity>>>,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    prices_processed: AtomicU64,
    unified_dropped: AtomicU64,
    opportunities_dropped: AtomicU64,
}

impl GridManager {
    pub fn new(config: GridConfig, rate_source: Option<Arc<dyn RateSource>>) -> Self {
        let (unified_tx, unified_rx) = mpsc::channel(1000);
        let (opp_tx, opp_rx) = mpsc::channel(100);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            adapters: Mutex::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
            rates: RwLock::new(ExchangeRates::seeds()),
            transfer_costs: RwLock::new(default_transfer_costs()),
            rate_source,
            unified_tx,
            unified_rx: Mutex::new(Some(unified_rx)),
            opp_tx,
            opp_rx: Mutex::new(Some(opp_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            prices_processed: AtomicU64::new(0),
            unified_dropped: AtomicU64::new(0),
            opportunities_dropped: AtomicU64::new(0),
        }
    }

    /// Register a venue adapter. Fails on duplicate registration.
    pub fn register(&self, adapter: Arc<dyn MarketAdapter>) -> Result<()> {
        let venue = adapter.venue();
        let mut adapters = self.adapters.lock().expect("lock poisoned");
        if adapters.contains_key(&venue) {
            return Err(GridError::Internal(format!(
                "adapter for venue {venue} already registered"
            )));
        }
        adapters.insert(venue, adapter);
        info!(%venue, "registered market adapter");
        Ok(())
    }

    /// Start all adapters, the aggregation tasks, the arbitrage scan and
    /// the FX refresher.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let adapters: Vec<Arc<dyn MarketAdapter>> = {
            let guard = self.adapters.lock().expect("lock poisoned");
            guard.values().cloned().collect()
        };
        info!(
            adapters = adapters.len(),
            arbitrage = self.config.enable_arbitrage,
            "starting grid manager"
        );

        let mut tasks = Vec::new();

        for adapter in adapters {
            adapter.start().await?;
            let venue = adapter.venue();
            let Some(mut rx) = adapter.take_price_stream() else {
                return Err(GridError::Internal(format!(
                    "price stream for {venue} already taken"
                )));
            };

            let manager = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        price = rx.recv() => {
                            let Some(price) = price else { return };
                            manager.process_price(price);
                        }
                    }
                }
            }));
        }

        if self.config.enable_arbitrage {
            let manager = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = std::time::Duration::from_secs(self.config.arbitrage_interval_secs);
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = tick.tick() => manager.scan_once(),
                    }
                }
            }));
        }

        if let Some(source) = self.rate_source.clone() {
            let manager = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = std::time::Duration::from_secs(self.config.fx_refresh_secs.max(1));
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = tick.tick() => {
                            match source.fetch().await {
                                Ok(rates) => manager.set_rates(ExchangeRates::from_rates(rates)),
                                Err(err) => warn!(error = %err, "exchange rate refresh failed"),
                            }
                        }
                    }
                }
            }));
        }

        self.tasks.lock().expect("lock poisoned").extend(tasks);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        info!("stopping grid manager");
        let _ = self.shutdown_tx.send(true);

        let adapters: Vec<Arc<dyn MarketAdapter>> = {
            let guard = self.adapters.lock().expect("lock poisoned");
            guard.values().cloned().collect()
        };
        for adapter in adapters {
            if let Err(err) = adapter.stop().await {
                warn!(venue = %adapter.venue(), error = %err, "failed to stop adapter");
            }
        }

        let tasks = {
            let mut guard = self.tasks.lock().expect("lock poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("grid manager stopped");
        Ok(())
    }

    /// Unified price stream; taken once.
    pub fn unified_prices(&self) -> Option<mpsc::Receiver<UnifiedPrice>> {
        self.unified_rx.lock().expect("lock poisoned").take()
    }

    /// Opportunity stream; taken once.
    pub fn opportunities(&self) -> Option<mpsc::Receiver<ArbitrageOpportunity>> {
        self.opp_rx.lock().expect("lock poisoned").take()
    }

    /// Normalize, store under (venue, region), and forward. Lossy on a
    /// full downstream buffer.
    pub fn process_price(&self, price: VenuePrice) {
        self.prices_processed.fetch_add(1, Ordering::Relaxed);

        let usd_price = {
            let rates = self.rates.read().expect("lock poisoned");
            rates.to_usd(price.local_price, &price.currency)
        };

        let unified = UnifiedPrice {
            venue: price.venue,
            region: price.region.clone(),
            price: usd_price,
            currency: "USD".to_string(),
            local_price: price.local_price,
            local_currency: price.currency,
            volume: price.volume,
            status: price.status,
            produced_at: price.produced_at,
            latency_ms: price.latency_ms,
        };

        {
            let mut latest = self.latest.write().expect("lock poisoned");
            latest.insert((unified.venue, unified.region.clone()), unified.clone());
        }

        if self.unified_tx.try_send(unified).is_err() {
            self.unified_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("unified price channel full, dropping price");
        }
    }

    /// Latest valid price for a venue/region.
    pub fn latest_price(&self, venue: VenueId, region: &str) -> Result<UnifiedPrice> {
        let latest = self.latest.read().expect("lock poisoned");
        let key = (venue, region.to_string());
        let price = latest
            .get(&key)
            .ok_or_else(|| GridError::MarketDataUnavailable(format!("{venue}:{region}")))?;

        if !price.is_fresh(self.validity()) {
            return Err(GridError::StalePrice(format!("{venue}:{region}")));
        }
        Ok(price.clone())
    }

    /// All prices inside the validity window, ascending by USD price.
    pub fn all_prices(&self) -> Vec<UnifiedPrice> {
        let validity = self.validity();
        let latest = self.latest.read().expect("lock poisoned");
        let mut prices: Vec<UnifiedPrice> = latest
            .values()
            .filter(|p| p.is_fresh(validity))
            .cloned()
            .collect();
        prices.sort_by(|a, b| a.price.total_cmp(&b.price));
        prices
    }

    /// Operational status per registered venue, DISCONNECTED when no
    /// fresh price exists.
    pub fn venue_status(&self) -> HashMap<VenueId, String> {
        let validity = self.validity();
        let adapters = self.adapters.lock().expect("lock poisoned");
        let latest = self.latest.read().expect("lock poisoned");

        let mut status = HashMap::new();
        for venue in adapters.keys() {
            let fresh = latest
                .values()
                .find(|p| p.venue == *venue && p.is_fresh(validity));
            let label = match fresh {
                Some(price) => price.status.as_str().to_string(),
                None => "DISCONNECTED".to_string(),
            };
            status.insert(*venue, label);
        }
        status
    }

    pub fn set_rates(&self, rates: ExchangeRates) {
        *self.rates.write().expect("lock poisoned") = rates;
    }

    /// Override a transfer cost for a route (applies symmetrically).
    pub fn set_transfer_cost(&self, a: VenueId, b: VenueId, cost: f64) {
        self.transfer_costs
            .write()
            .expect("lock poisoned")
            .insert((a, b), cost);
    }

    pub fn counters(&self) -> GridCounters {
        GridCounters {
            prices_processed: self.prices_processed.load(Ordering::Relaxed),
            unified_dropped: self.unified_dropped.load(Ordering::Relaxed),
            opportunities_dropped: self.opportunities_dropped.load(Ordering::Relaxed),
        }
    }

    /// One arbitrage pass over the fresh snapshot.
    pub fn scan_once(&self) {
        let prices = self.all_prices();
        if prices.len() < 2 {
            return;
        }

        for i in 0..prices.len() {
            for j in (i + 1)..prices.len() {
                let low = &prices[i];
                let high = &prices[j];
                if let Some(opp) = self.evaluate_pair(low, high) {
                    debug!(
                        source = %opp.source_venue,
                        target = %opp.target_venue,
                        spread_percent = opp.spread_percent,
                        estimated_profit = opp.estimated_profit,
                        "arbitrage opportunity detected"
                    );
                    if self.opp_tx.try_send(opp).is_err() {
                        self.opportunities_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!("arbitrage channel full, dropping opportunity");
                    }
                }
            }
        }
    }

    /// Apply thresholds to one ordered (low, high) pair.
    fn evaluate_pair(&self, low: &UnifiedPrice, high: &UnifiedPrice) -> Option<ArbitrageOpportunity> {
        if low.price <= 0.0 {
            return None;
        }

        let spread = high.price - low.price;
        let spread_percent = spread / low.price * 100.0;
        // Equality with the minimum is rejected.
        if spread_percent <= self.config.min_spread_percent {
            return None;
        }

        let transfer_cost = self.transfer_cost(low.venue, high.venue);
        let net_spread = spread - transfer_cost;
        if net_spread < self.config.min_net_spread {
            return None;
        }

        let risk_score = risk_score(low, high);
        if risk_score > self.config.max_risk_score {
            return None;
        }

        let max_volume = low.volume.min(high.volume);
        if max_volume <= 0.0 {
            return None;
        }

        let now = Utc::now();
        Some(ArbitrageOpportunity {
            id: format!("ARB-{}", Uuid::new_v4().simple()),
            source_venue: low.venue,
            source_region: low.region.clone(),
            target_venue: high.venue,
            target_region: high.region.clone(),
            buy_price: low.price,
            sell_price: high.price,
            spread,
            spread_percent,
            transfer_cost,
            net_spread,
            max_volume,
            estimated_profit: net_spread * max_volume,
            risk_score,
            detected_at: now,
            valid_until: now + self.validity(),
        })
    }

    fn transfer_cost(&self, source: VenueId, target: VenueId) -> f64 {
        let costs = self.transfer_costs.read().expect("lock poisoned");
        costs
            .get(&(source, target))
            .or_else(|| costs.get(&(target, source)))
            .copied()
            .unwrap_or(UNKNOWN_ROUTE_PENALTY)
    }

    fn validity(&self) -> Duration {
        Duration::seconds(self.config.price_validity_secs as i64)
    }
}

/// Additive risk score with per-term caps, clamped to [0, 1].
fn risk_score(source: &UnifiedPrice, target: &UnifiedPrice) -> f64 {
    let max_latency = source.latency_ms.max(target.latency_ms) as f64;
    let latency_risk = (max_latency / 1000.0).min(0.3);

    let status_risk =
        if source.status != MarketStatus::Open || target.status != MarketStatus::Open {
            0.4
        } else {
            0.0
        };

    let cross_market_risk = if source.venue == target.venue { 0.1 } else { 0.2 };

    let min_volume = source.volume.min(target.volume);
    let volume_risk = if min_volume < 10.0 {
        0.3
    } else if min_volume < 50.0 {
        0.15
    } else {
        0.0
    };

    let max_age = source.age().max(target.age()).num_milliseconds() as f64 / 1000.0;
    let age_risk = (max_age / 30.0 * 0.2).min(0.2);

    (latency_risk + status_risk + cross_market_risk + volume_risk + age_risk).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue_price(
        venue: VenueId,
        region: &str,
        local_price: f64,
        currency: &str,
        volume: f64,
    ) -> VenuePrice {
        VenuePrice {
            venue,
            region: region.to_string(),
            local_price,
            currency: currency.to_string(),
            volume,
            status: MarketStatus::Open,
            produced_at: Utc::now(),
            latency_ms: 5,
        }
    }

    fn manager(config: GridConfig) -> Arc<GridManager> {
        Arc::new(GridManager::new(config, None))
    }

    #[tokio::test]
    async fn normalizes_currencies_to_usd() {
        let m = manager(GridConfig::default());
        let mut unified = m.unified_prices().unwrap();
        m.process_price(venue_price(VenueId::Aemo, "NSW1", 100.0, "AUD", 50.0));
        m.process_price(venue_price(VenueId::Jepx, "TOKYO", 1000.0, "JPY", 50.0));
        m.process_price(venue_price(VenueId::Pjm, "PJM-W", 50.0, "USD", 50.0));

        let aud = m.latest_price(VenueId::Aemo, "NSW1").unwrap();
        assert!((aud.price - 65.0).abs() < 1e-9);
        assert_eq!(aud.local_currency, "AUD");
        let jpy = m.latest_price(VenueId::Jepx, "TOKYO").unwrap();
        assert!((jpy.price - 6.7).abs() < 1e-9);
        let usd = m.latest_price(VenueId::Pjm, "PJM-W").unwrap();
        assert_eq!(usd.price, 50.0);

        // Everything delivered downstream is in the reference currency.
        for _ in 0..3 {
            assert_eq!(unified.try_recv().unwrap().currency, "USD");
        }
    }

    #[tokio::test]
    async fn newest_write_wins_per_region() {
        let m = manager(GridConfig::default());
        m.process_price(venue_price(VenueId::Aemo, "NSW1", 40.0, "USD", 10.0));
        m.process_price(venue_price(VenueId::Aemo, "NSW1", 45.0, "USD", 10.0));
        let latest = m.latest_price(VenueId::Aemo, "NSW1").unwrap();
        assert_eq!(latest.price, 45.0);
    }

    #[tokio::test]
    async fn stale_prices_are_rejected_and_filtered() {
        let m = manager(GridConfig::default());
        let mut price = venue_price(VenueId::Aemo, "NSW1", 50.0, "USD", 10.0);
        price.produced_at = Utc::now() - Duration::seconds(60);
        m.process_price(price);

        assert!(matches!(
            m.latest_price(VenueId::Aemo, "NSW1"),
            Err(GridError::StalePrice(_))
        ));
        assert!(m.all_prices().is_empty());
    }

    #[tokio::test]
    async fn detects_opportunity_above_thresholds() {
        let config = GridConfig {
            min_net_spread: 1.0,
            ..GridConfig::default()
        };
        let m = manager(config);
        let mut opps = m.opportunities().unwrap();

        m.set_transfer_cost(VenueId::Aemo, VenueId::Jepx, 1.0);
        m.process_price(venue_price(VenueId::Aemo, "R1", 50.0, "USD", 100.0));
        m.process_price(venue_price(VenueId::Jepx, "R2", 55.0, "USD", 100.0));
        m.scan_once();

        let opp = opps.try_recv().unwrap();
        assert_eq!(opp.source_venue, VenueId::Aemo);
        assert_eq!(opp.target_venue, VenueId::Jepx);
        assert!((opp.spread - 5.0).abs() < 1e-9);
        assert!((opp.spread_percent - 10.0).abs() < 1e-9);
        assert!((opp.net_spread - 4.0).abs() < 1e-9);
        assert_eq!(opp.max_volume, 100.0);
        assert!((opp.estimated_profit - 400.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejects_when_net_spread_below_minimum() {
        let config = GridConfig {
            min_net_spread: 5.0,
            ..GridConfig::default()
        };
        let m = manager(config);
        let mut opps = m.opportunities().unwrap();

        m.set_transfer_cost(VenueId::Aemo, VenueId::Jepx, 1.0);
        m.process_price(venue_price(VenueId::Aemo, "R1", 50.0, "USD", 100.0));
        m.process_price(venue_price(VenueId::Jepx, "R2", 55.0, "USD", 100.0));
        m.scan_once();

        assert!(opps.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejects_spread_percent_at_exact_minimum() {
        // min 10%: a pair at exactly 10% must not emit.
        let config = GridConfig {
            min_spread_percent: 10.0,
            min_net_spread: 0.0,
            ..GridConfig::default()
        };
        let m = manager(config);
        let mut opps = m.opportunities().unwrap();

        m.set_transfer_cost(VenueId::Aemo, VenueId::Jepx, 0.0);
        m.process_price(venue_price(VenueId::Aemo, "R1", 50.0, "USD", 100.0));
        m.process_price(venue_price(VenueId::Jepx, "R2", 55.0, "USD", 100.0));
        m.scan_once();
        assert!(opps.try_recv().is_err());

        // Just above the line emits.
        m.process_price(venue_price(VenueId::Jepx, "R2", 55.01, "USD", 100.0));
        m.scan_once();
        assert!(opps.try_recv().is_ok());
    }

    #[tokio::test]
    async fn rejects_zero_volume_pairs() {
        let config = GridConfig {
            min_net_spread: 0.0,
            ..GridConfig::default()
        };
        let m = manager(config);
        let mut opps = m.opportunities().unwrap();

        m.set_transfer_cost(VenueId::Aemo, VenueId::Jepx, 0.0);
        m.process_price(venue_price(VenueId::Aemo, "R1", 50.0, "USD", 0.0));
        m.process_price(venue_price(VenueId::Jepx, "R2", 60.0, "USD", 100.0));
        m.scan_once();
        assert!(opps.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_route_pays_default_penalty() {
        let m = manager(GridConfig::default());
        assert_eq!(
            m.transfer_cost(VenueId::Epex, VenueId::Jepx),
            UNKNOWN_ROUTE_PENALTY
        );
        // Known route is symmetric.
        assert_eq!(m.transfer_cost(VenueId::Jepx, VenueId::Aemo), 15.0);
    }

    #[test]
    fn risk_score_terms_are_capped() {
        let mut low = UnifiedPrice {
            venue: VenueId::Aemo,
            region: "R1".to_string(),
            price: 50.0,
            currency: "USD".to_string(),
            local_price: 50.0,
            local_currency: "USD".to_string(),
            volume: 100.0,
            status: MarketStatus::Open,
            produced_at: Utc::now(),
            latency_ms: 5_000,
        };
        let high = UnifiedPrice {
            venue: VenueId::Jepx,
            region: "R2".to_string(),
            price: 60.0,
            ..low.clone()
        };

        // Latency capped at 0.3, cross-market 0.2, everything else small.
        let score = risk_score(&low, &high);
        assert!((score - 0.5).abs() < 0.05, "score {score}");

        // Closed market adds the 0.4 status term; total clamps at 1.0.
        low.status = MarketStatus::Closed;
        low.volume = 1.0;
        let score = risk_score(&low, &high);
        assert_eq!(score, 1.0);
    }

    #[tokio::test]
    async fn risk_score_threshold_filters_pairs() {
        let config = GridConfig {
            min_net_spread: 0.0,
            max_risk_score: 0.2,
            ..GridConfig::default()
        };
        let m = manager(config);
        let mut opps = m.opportunities().unwrap();

        // Cross-venue risk alone (0.2 + latency) exceeds a 0.2 budget.
        m.set_transfer_cost(VenueId::Aemo, VenueId::Jepx, 0.0);
        m.process_price(venue_price(VenueId::Aemo, "R1", 50.0, "USD", 100.0));
        m.process_price(venue_price(VenueId::Jepx, "R2", 60.0, "USD", 100.0));
        m.scan_once();
        assert!(opps.try_recv().is_err());
    }
}
