//! JEPX (Japan Electric Power Exchange) market adapter.
//!
//! The stream carries intraday/balancing prices plus order updates and
//! fill notifications; pollers refresh spot auction results, intraday
//! books, balancing prices, area demand, and forward contracts. JEPX
//! quotes JPY/kWh; prices are scaled to JPY/MWh before leaving the
//! adapter so the manager normalizes a consistent unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{LossySender, MarketAdapter};
use crate::config::JepxConfig;
use crate::domain::{MarketStatus, OrderStatus, VenueId, VenueOrder, VenuePrice};
use crate::error::{GridError, Result};
use crate::resilience::{Backoff, BackoffConfig, CircuitBreaker, CircuitBreakerConfig};
use crate::secrets::SecretCache;

/// JEPX order price bounds, JPY/kWh.
const PRICE_FLOOR: rust_decimal::Decimal = dec!(0.01);
const PRICE_CAP: rust_decimal::Decimal = dec!(999);
/// 30-minute trading periods per day.
const MAX_PERIOD: u32 = 48;

const KWH_PER_MWH: f64 = 1000.0;
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Spot auction result for one area and trading period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotPrice {
    pub area: String,
    /// 1-48
    pub period: u32,
    /// JPY/kWh (system price if no split)
    pub price: f64,
    /// Contracted volume, MWh
    pub volume: f64,
    #[serde(default)]
    pub sell_volume: f64,
    #[serde(default)]
    pub buy_volume: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntradayPrice {
    pub area: String,
    pub period: u32,
    /// JPY/kWh
    pub last_price: f64,
    #[serde(default)]
    pub best_bid: f64,
    #[serde(default)]
    pub best_ask: f64,
    /// MWh
    pub volume: f64,
    #[serde(default)]
    pub session_open: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancingPrice {
    pub area: String,
    /// JPY/kWh
    pub imbalance_price: f64,
    #[serde(default)]
    pub shortage_price: f64,
    #[serde(default)]
    pub surplus_price: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaDemand {
    pub area: String,
    /// MW
    pub demand: f64,
    pub supply_capacity: f64,
    #[serde(default)]
    pub reserve_margin_pct: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardContract {
    pub product: String,
    pub delivery_start: DateTime<Utc>,
    pub delivery_end: DateTime<Utc>,
    /// JPY/kWh
    pub price: f64,
    pub volume: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub filled_quantity: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillNotification {
    pub order_id: String,
    pub area: String,
    pub period: u32,
    /// JPY/kWh
    pub price: f64,
    pub quantity: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamMessage {
    Intraday(IntradayPrice),
    Balancing(BalancingPrice),
    Forward(ForwardContract),
    OrderUpdate(OrderUpdate),
    Fill(FillNotification),
}

#[derive(Debug, Deserialize)]
struct OrderAck {
    order_id: String,
}

struct Inner {
    config: JepxConfig,
    secrets: Arc<SecretCache>,
    client: reqwest::Client,

    prices: LossySender<VenuePrice>,
    balancing: LossySender<BalancingPrice>,
    demand: LossySender<AreaDemand>,
    forwards: LossySender<ForwardContract>,
    fills: LossySender<FillNotification>,

    latest: RwLock<HashMap<String, VenuePrice>>,
    latest_demand: RwLock<HashMap<String, AreaDemand>>,
    active_orders: RwLock<HashMap<String, OrderStatus>>,

    poll_breaker: CircuitBreaker,
    shutdown_tx: watch::Sender<bool>,
}

pub struct JepxAdapter {
    inner: Arc<Inner>,
    price_rx: Mutex<Option<mpsc::Receiver<VenuePrice>>>,
    balancing_rx: Mutex<Option<mpsc::Receiver<BalancingPrice>>>,
    demand_rx: Mutex<Option<mpsc::Receiver<AreaDemand>>>,
    forward_rx: Mutex<Option<mpsc::Receiver<ForwardContract>>>,
    fill_rx: Mutex<Option<mpsc::Receiver<FillNotification>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JepxAdapter {
    pub fn new(config: JepxConfig, secrets: Arc<SecretCache>) -> Self {
        let (prices, price_rx) = LossySender::new("jepx.prices", config.price_buffer);
        let (balancing, balancing_rx) = LossySender::new("jepx.balancing", config.price_buffer);
        let (demand, demand_rx) = LossySender::new("jepx.demand", 50);
        let (forwards, forward_rx) = LossySender::new("jepx.forwards", 50);
        let (fills, fill_rx) = LossySender::new("jepx.fills", 100);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                secrets,
                client: reqwest::Client::new(),
                prices,
                balancing,
                demand,
                forwards,
                fills,
                latest: RwLock::new(HashMap::new()),
                latest_demand: RwLock::new(HashMap::new()),
                active_orders: RwLock::new(HashMap::new()),
                poll_breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
                shutdown_tx,
            }),
            price_rx: Mutex::new(Some(price_rx)),
            balancing_rx: Mutex::new(Some(balancing_rx)),
            demand_rx: Mutex::new(Some(demand_rx)),
            forward_rx: Mutex::new(Some(forward_rx)),
            fill_rx: Mutex::new(Some(fill_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn take_balancing_stream(&self) -> Option<mpsc::Receiver<BalancingPrice>> {
        self.balancing_rx.lock().expect("lock poisoned").take()
    }

    pub fn take_demand_stream(&self) -> Option<mpsc::Receiver<AreaDemand>> {
        self.demand_rx.lock().expect("lock poisoned").take()
    }

    pub fn take_forward_stream(&self) -> Option<mpsc::Receiver<ForwardContract>> {
        self.forward_rx.lock().expect("lock poisoned").take()
    }

    pub fn take_fill_stream(&self) -> Option<mpsc::Receiver<FillNotification>> {
        self.fill_rx.lock().expect("lock poisoned").take()
    }

    pub fn area_demand(&self, area: &str) -> Option<AreaDemand> {
        self.inner
            .latest_demand
            .read()
            .expect("lock poisoned")
            .get(area)
            .cloned()
    }

    pub fn order_status(&self, order_id: &str) -> Option<OrderStatus> {
        self.inner
            .active_orders
            .read()
            .expect("lock poisoned")
            .get(order_id)
            .copied()
    }

    async fn run_stream(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
        let backoff = Backoff::new(BackoffConfig {
            max_retries: 0,
            ..BackoffConfig::default()
        });

        loop {
            if *shutdown.borrow() {
                return;
            }
            match Self::connect_and_stream(&inner, &mut shutdown).await {
                Ok(()) => {
                    info!("JEPX stream closed normally");
                    backoff.reset();
                }
                Err(err) => warn!(error = %err, "JEPX stream error"),
            }
            if *shutdown.borrow() {
                return;
            }
            let delay = backoff.next();
            debug!(?delay, "reconnecting to JEPX stream");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn connect_and_stream(
        inner: &Arc<Inner>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let creds = inner.secrets.venue_credentials("jepx").await?;

        let mut request = inner.config.ws_endpoint.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "X-API-Key",
            HeaderValue::from_str(&creds.api_key)
                .map_err(|e| GridError::Internal(format!("invalid api key header: {e}")))?,
        );
        headers.insert(
            "X-Participant-Id",
            HeaderValue::from_str(&creds.participant_id)
                .map_err(|e| GridError::Internal(format!("invalid participant header: {e}")))?,
        );

        let (ws, _) = connect_async(request).await?;
        info!("connected to JEPX stream");
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({
            "action": "subscribe",
            "areas": inner.config.areas,
            "channels": ["intraday", "balancing", "forward", "order_update", "fill"],
        });
        write.send(Message::Text(subscribe.to_string())).await?;

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.reset();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                _ = ping.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => inner.handle_message(&text),
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(GridError::WebSocket(err)),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn run_spot_poller(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(inner.config.spot_poll_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    if let Err(err) = inner.poll_breaker.call(|| inner.fetch_spot()).await {
                        debug!(error = %err, "spot poll skipped");
                    }
                }
            }
        }
    }

    async fn run_intraday_poller(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(inner.config.intraday_poll_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    if let Err(err) = inner.poll_breaker.call(|| inner.fetch_intraday()).await {
                        debug!(error = %err, "intraday poll skipped");
                    }
                }
            }
        }
    }

    async fn run_balancing_poller(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(inner.config.balancing_poll_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    if let Err(err) = inner.fetch_balancing().await {
                        debug!(error = %err, "balancing poll failed");
                    }
                    if let Err(err) = inner.fetch_demand().await {
                        debug!(error = %err, "demand poll failed");
                    }
                }
            }
        }
    }

    async fn run_forward_fetcher(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(60 * 60));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    if let Err(err) = inner.fetch_forwards().await {
                        warn!(error = %err, "forward contract fetch failed");
                    }
                }
            }
        }
    }
}

impl Inner {
    fn handle_message(&self, text: &str) {
        match serde_json::from_str::<StreamMessage>(text) {
            Ok(StreamMessage::Intraday(price)) => self.ingest_intraday(price),
            Ok(StreamMessage::Balancing(price)) => self.balancing.send(price),
            Ok(StreamMessage::Forward(contract)) => self.forwards.send(contract),
            Ok(StreamMessage::OrderUpdate(update)) => {
                let mut orders = self.active_orders.write().expect("lock poisoned");
                match update.status {
                    OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected => {
                        orders.remove(&update.order_id);
                    }
                    status => {
                        orders.insert(update.order_id.clone(), status);
                    }
                }
                debug!(order_id = %update.order_id, status = ?update.status, "order update");
            }
            Ok(StreamMessage::Fill(fill)) => {
                info!(order_id = %fill.order_id, price = fill.price, qty = fill.quantity, "fill");
                self.fills.send(fill);
            }
            Err(err) => {
                debug!(error = %err, raw = &text[..text.len().min(120)], "unrecognized JEPX message");
            }
        }
    }

    fn ingest_intraday(&self, intraday: IntradayPrice) {
        let status = if intraday.session_open {
            MarketStatus::Open
        } else {
            MarketStatus::Closed
        };
        let latency_ms = (Utc::now() - intraday.timestamp).num_milliseconds().max(0);

        let price = VenuePrice {
            venue: VenueId::Jepx,
            region: intraday.area.clone(),
            // JPY/kWh on the wire; JPY/MWh downstream.
            local_price: intraday.last_price * KWH_PER_MWH,
            currency: "JPY".to_string(),
            volume: intraday.volume,
            status,
            produced_at: intraday.timestamp,
            latency_ms,
        };

        self.latest
            .write()
            .expect("lock poisoned")
            .insert(price.region.clone(), price.clone());
        self.prices.send(price);
    }

    fn ingest_spot(&self, spot: SpotPrice) {
        let latency_ms = (Utc::now() - spot.timestamp).num_milliseconds().max(0);
        let price = VenuePrice {
            venue: VenueId::Jepx,
            region: spot.area.clone(),
            local_price: spot.price * KWH_PER_MWH,
            currency: "JPY".to_string(),
            volume: spot.volume,
            // The day-ahead auction has cleared; treat as pre-open data.
            status: MarketStatus::PreOpen,
            produced_at: spot.timestamp,
            latency_ms,
        };

        // Spot results only seed regions the intraday stream has not
        // covered yet; intraday data is always fresher.
        let mut latest = self.latest.write().expect("lock poisoned");
        let entry = latest.get(&spot.area);
        if entry.map_or(true, |existing| existing.produced_at < price.produced_at) {
            latest.insert(spot.area.clone(), price.clone());
            drop(latest);
            self.prices.send(price);
        }
    }

    async fn authorized_get(&self, url: &str) -> Result<reqwest::Response> {
        let creds = self.secrets.venue_credentials("jepx").await?;
        let resp = self
            .client
            .get(url)
            .header("X-API-Key", &creds.api_key)
            .header("X-Participant-Id", &creds.participant_id)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GridError::MarketDataUnavailable(format!(
                "{url} returned {}",
                resp.status()
            )));
        }
        Ok(resp)
    }

    async fn fetch_spot(&self) -> Result<()> {
        for area in &self.config.areas {
            let url = format!("{}/spot/prices?area={area}", self.config.api_endpoint);
            let prices: Vec<SpotPrice> = self.authorized_get(&url).await?.json().await?;
            for spot in prices {
                self.ingest_spot(spot);
            }
        }
        Ok(())
    }

    async fn fetch_intraday(&self) -> Result<()> {
        for area in &self.config.areas {
            let url = format!("{}/intraday/book?area={area}", self.config.api_endpoint);
            let prices: Vec<IntradayPrice> = self.authorized_get(&url).await?.json().await?;
            for intraday in prices {
                self.ingest_intraday(intraday);
            }
        }
        Ok(())
    }

    async fn fetch_balancing(&self) -> Result<()> {
        let url = format!("{}/balancing/prices", self.config.api_endpoint);
        let prices: Vec<BalancingPrice> = self.authorized_get(&url).await?.json().await?;
        for price in prices {
            self.balancing.send(price);
        }
        Ok(())
    }

    async fn fetch_demand(&self) -> Result<()> {
        let url = format!("{}/demand/areas", self.config.api_endpoint);
        let areas: Vec<AreaDemand> = self.authorized_get(&url).await?.json().await?;
        let mut latest = self.latest_demand.write().expect("lock poisoned");
        for area in areas {
            latest.insert(area.area.clone(), area.clone());
            self.demand.send(area);
        }
        Ok(())
    }

    async fn fetch_forwards(&self) -> Result<()> {
        let url = format!("{}/forward/contracts", self.config.api_endpoint);
        let contracts: Vec<ForwardContract> = self.authorized_get(&url).await?.json().await?;
        for contract in contracts {
            self.forwards.send(contract);
        }
        Ok(())
    }
}

#[async_trait]
impl MarketAdapter for JepxAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Jepx
    }

    async fn start(&self) -> Result<()> {
        info!(areas = ?self.inner.config.areas, "starting JEPX adapter");

        let mut tasks = self.tasks.lock().expect("lock poisoned");
        tasks.push(tokio::spawn(Self::run_stream(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(Self::run_spot_poller(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(Self::run_intraday_poller(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(Self::run_balancing_poller(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));
        if self.inner.config.enable_forward {
            tasks.push(tokio::spawn(Self::run_forward_fetcher(
                self.inner.clone(),
                self.inner.shutdown_tx.subscribe(),
            )));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("stopping JEPX adapter");
        let _ = self.inner.shutdown_tx.send(true);
        let tasks = {
            let mut guard = self.tasks.lock().expect("lock poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    fn take_price_stream(&self) -> Option<mpsc::Receiver<VenuePrice>> {
        self.price_rx.lock().expect("lock poisoned").take()
    }

    async fn latest_price(&self, region: &str) -> Result<VenuePrice> {
        self.inner
            .latest
            .read()
            .expect("lock poisoned")
            .get(region)
            .cloned()
            .ok_or_else(|| GridError::MarketDataUnavailable(format!("JEPX:{region}")))
    }

    async fn submit_order(&self, order: &VenueOrder) -> Result<String> {
        order.validate(PRICE_FLOOR, PRICE_CAP, MAX_PERIOD)?;

        let creds = self.inner.secrets.venue_credentials("jepx").await?;
        let url = format!("{}/orders", self.inner.config.api_endpoint);
        let resp = self
            .inner
            .client
            .post(&url)
            .header("X-API-Key", &creds.api_key)
            .header("X-Participant-Id", &creds.participant_id)
            .json(order)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GridError::OrderSubmission(format!(
                "JEPX rejected order ({status}): {body}"
            )));
        }

        let ack: OrderAck = resp.json().await?;
        self.inner
            .active_orders
            .write()
            .expect("lock poisoned")
            .insert(ack.order_id.clone(), OrderStatus::Accepted);
        info!(order_id = %ack.order_id, area = %order.region, "JEPX order accepted");
        Ok(ack.order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let creds = self.inner.secrets.venue_credentials("jepx").await?;
        let url = format!("{}/orders/{order_id}", self.inner.config.api_endpoint);
        let resp = self
            .inner
            .client
            .delete(&url)
            .header("X-API-Key", &creds.api_key)
            .header("X-Participant-Id", &creds.participant_id)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => {
                self.inner
                    .active_orders
                    .write()
                    .expect("lock poisoned")
                    .remove(order_id);
                Ok(())
            }
            reqwest::StatusCode::NOT_FOUND => Err(GridError::OrderNotFound(order_id.to_string())),
            s => Err(GridError::OrderSubmission(format!(
                "JEPX cancel failed: {s}"
            ))),
        }
    }

    fn loss_counters(&self) -> HashMap<String, u64> {
        let inner = &self.inner;
        [
            (inner.prices.name(), inner.prices.dropped()),
            (inner.balancing.name(), inner.balancing.dropped()),
            (inner.demand.name(), inner.demand.dropped()),
            (inner.forwards.name(), inner.forwards.dropped()),
            (inner.fills.name(), inner.fills.dropped()),
        ]
        .into_iter()
        .map(|(name, dropped)| (name.to_string(), dropped))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::EnvSecretProvider;

    fn adapter() -> JepxAdapter {
        let secrets = Arc::new(SecretCache::new(
            Box::new(EnvSecretProvider),
            Duration::from_secs(60),
        ));
        JepxAdapter::new(JepxConfig::default(), secrets)
    }

    #[tokio::test]
    async fn intraday_message_scales_to_mwh() {
        let adapter = adapter();
        let mut prices = adapter.take_price_stream().unwrap();

        adapter.inner.handle_message(
            r#"{"type":"intraday","area":"TOKYO","period":24,"last_price":12.5,"volume":80.0,"session_open":true}"#,
        );

        let price = prices.recv().await.unwrap();
        assert_eq!(price.venue, VenueId::Jepx);
        assert_eq!(price.currency, "JPY");
        // 12.5 JPY/kWh = 12,500 JPY/MWh
        assert_eq!(price.local_price, 12_500.0);
        assert_eq!(price.status, MarketStatus::Open);
    }

    #[tokio::test]
    async fn closed_session_maps_to_closed() {
        let adapter = adapter();
        adapter.inner.handle_message(
            r#"{"type":"intraday","area":"KANSAI","period":1,"last_price":9.0,"volume":10.0,"session_open":false}"#,
        );
        let latest = adapter.latest_price("KANSAI").await.unwrap();
        assert_eq!(latest.status, MarketStatus::Closed);
    }

    #[tokio::test]
    async fn spot_does_not_overwrite_fresher_intraday() {
        let adapter = adapter();

        adapter.inner.handle_message(
            r#"{"type":"intraday","area":"TOKYO","period":24,"last_price":12.5,"volume":80.0,"session_open":true}"#,
        );
        // Older spot result for the same area.
        adapter.inner.ingest_spot(SpotPrice {
            area: "TOKYO".to_string(),
            period: 24,
            price: 10.0,
            volume: 500.0,
            sell_volume: 0.0,
            buy_volume: 0.0,
            timestamp: Utc::now() - chrono::Duration::minutes(10),
        });

        let latest = adapter.latest_price("TOKYO").await.unwrap();
        assert_eq!(latest.local_price, 12_500.0);
    }

    #[tokio::test]
    async fn order_lifecycle_updates_active_set() {
        let adapter = adapter();
        adapter.inner.handle_message(
            r#"{"type":"order_update","order_id":"J-77","status":"ACCEPTED"}"#,
        );
        assert_eq!(adapter.order_status("J-77"), Some(OrderStatus::Accepted));

        adapter.inner.handle_message(
            r#"{"type":"order_update","order_id":"J-77","status":"FILLED","filled_quantity":10.0}"#,
        );
        assert_eq!(adapter.order_status("J-77"), None);
    }

    #[tokio::test]
    async fn fill_notifications_reach_stream() {
        let adapter = adapter();
        let mut fills = adapter.take_fill_stream().unwrap();
        adapter.inner.handle_message(
            r#"{"type":"fill","order_id":"J-9","area":"TOKYO","period":12,"price":11.2,"quantity":5.0}"#,
        );
        let fill = fills.recv().await.unwrap();
        assert_eq!(fill.order_id, "J-9");
        assert_eq!(fill.quantity, 5.0);
    }

    #[tokio::test]
    async fn order_validation_enforces_jepx_bounds() {
        let adapter = adapter();
        let order = VenueOrder {
            client_order_id: "c2".to_string(),
            venue: VenueId::Jepx,
            region: "TOKYO".to_string(),
            participant_id: "JP-MEMBER-1".to_string(),
            side: crate::domain::OrderSide::Buy,
            price: dec!(10),
            quantity: dec!(5),
            period: 49, // beyond the 48 trading periods
            submitted_at: Utc::now(),
        };
        let result = adapter.submit_order(&order).await;
        assert!(matches!(result, Err(GridError::OrderValidation(_))));
    }
}
