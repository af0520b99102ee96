//! AEMO (Australian NEM) market adapter.
//!
//! One streaming loop subscribes to dispatch/FCAS/predispatch/constraint
//! messages; REST pollers backfill dispatch and FCAS prices, fetch
//! predispatch forecasts every 30 minutes, and track binding network
//! constraints every minute. Bids are validated locally before dispatch.

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
use crate::config::AemoConfig;
use crate::domain::{MarketStatus, VenueId, VenueOrder, VenuePrice};
use crate::error::{GridError, Result};
use crate::resilience::{Backoff, BackoffConfig, CircuitBreaker, CircuitBreakerConfig};
use crate::secrets::SecretCache;

/// NEM price floor and market price cap, AUD/MWh.
const PRICE_FLOOR: rust_decimal::Decimal = dec!(-1000);
const PRICE_CAP: rust_decimal::Decimal = dec!(16600);
/// 5-minute dispatch intervals per trading day.
const MAX_DISPATCH_INTERVAL: u32 = 288;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Frequency Control Ancillary Services markets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FcasService {
    RaiseReg,
    LowerReg,
    Raise6Sec,
    Raise60Sec,
    Raise5Min,
    Lower6Sec,
    Lower60Sec,
    Lower5Min,
}

/// Real-time dispatch price for one region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPrice {
    pub region: String,
    /// Regional Reference Price, AUD/MWh
    pub rrp: f64,
    /// MW
    pub total_demand: f64,
    pub available_gen: f64,
    /// Positive = import
    #[serde(default)]
    pub net_interchange: f64,
    /// 1-288
    #[serde(default)]
    pub dispatch_interval: u32,
    #[serde(default)]
    pub market_suspended: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcasPrice {
    pub region: String,
    pub service: FcasService,
    /// AUD/MW
    pub price: f64,
    pub availability: f64,
    pub requirement: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredispatchForecast {
    pub region: String,
    pub forecast_time: DateTime<Utc>,
    pub predicted_rrp: f64,
    #[serde(default)]
    pub lower_bound: f64,
    #[serde(default)]
    pub upper_bound: f64,
    /// 0-1
    #[serde(default)]
    pub confidence: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintBinding {
    pub constraint_id: String,
    /// THERMAL, VOLTAGE, STABILITY
    pub constraint_type: String,
    pub limit_value: f64,
    /// AUD/MW
    pub marginal_value: f64,
    #[serde(default)]
    pub affected_regions: Vec<String>,
    pub binding: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Typed stream messages, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamMessage {
    Dispatch(DispatchPrice),
    Fcas(FcasPrice),
    Predispatch(PredispatchForecast),
    Constraint(ConstraintBinding),
}

#[derive(Debug, Deserialize)]
struct OrderAck {
    order_id: String,
}

struct Inner {
    config: AemoConfig,
    secrets: Arc<SecretCache>,
    client: reqwest::Client,

    prices: LossySender<VenuePrice>,
    fcas: LossySender<FcasPrice>,
    predispatch: LossySender<PredispatchForecast>,
    constraints: LossySender<ConstraintBinding>,

    latest: RwLock<HashMap<String, VenuePrice>>,
    latest_fcas: RwLock<HashMap<(String, FcasService), FcasPrice>>,
    binding_constraints: RwLock<Vec<ConstraintBinding>>,

    poll_breaker: CircuitBreaker,
    shutdown_tx: watch::Sender<bool>,
}

pub struct AemoAdapter {
    inner: Arc<Inner>,
    price_rx: Mutex<Option<mpsc::Receiver<VenuePrice>>>,
    fcas_rx: Mutex<Option<mpsc::Receiver<FcasPrice>>>,
    predispatch_rx: Mutex<Option<mpsc::Receiver<PredispatchForecast>>>,
    constraint_rx: Mutex<Option<mpsc::Receiver<ConstraintBinding>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AemoAdapter {
    pub fn new(config: AemoConfig, secrets: Arc<SecretCache>) -> Self {
        let (prices, price_rx) = LossySender::new("aemo.prices", config.price_buffer);
        let (fcas, fcas_rx) = LossySender::new("aemo.fcas", config.price_buffer);
        let (predispatch, predispatch_rx) = LossySender::new("aemo.predispatch", 100);
        let (constraints, constraint_rx) = LossySender::new("aemo.constraints", 50);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                secrets,
                client: reqwest::Client::new(),
                prices,
                fcas,
                predispatch,
                constraints,
                latest: RwLock::new(HashMap::new()),
                latest_fcas: RwLock::new(HashMap::new()),
                binding_constraints: RwLock::new(Vec::new()),
                poll_breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
                shutdown_tx,
            }),
            price_rx: Mutex::new(Some(price_rx)),
            fcas_rx: Mutex::new(Some(fcas_rx)),
            predispatch_rx: Mutex::new(Some(predispatch_rx)),
            constraint_rx: Mutex::new(Some(constraint_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// FCAS price stream; taken once.
    pub fn take_fcas_stream(&self) -> Option<mpsc::Receiver<FcasPrice>> {
        self.fcas_rx.lock().expect("lock poisoned").take()
    }

    /// Predispatch forecast stream; taken once.
    pub fn take_predispatch_stream(&self) -> Option<mpsc::Receiver<PredispatchForecast>> {
        self.predispatch_rx.lock().expect("lock poisoned").take()
    }

    /// Constraint stream; taken once.
    pub fn take_constraint_stream(&self) -> Option<mpsc::Receiver<ConstraintBinding>> {
        self.constraint_rx.lock().expect("lock poisoned").take()
    }

    pub fn latest_fcas(&self, region: &str, service: FcasService) -> Option<FcasPrice> {
        self.inner
            .latest_fcas
            .read()
            .expect("lock poisoned")
            .get(&(region.to_string(), service))
            .cloned()
    }

    pub fn binding_constraints(&self) -> Vec<ConstraintBinding> {
        self.inner
            .binding_constraints
            .read()
            .expect("lock poisoned")
            .clone()
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
                    info!("AEMO stream closed normally");
                    backoff.reset();
                }
                Err(err) => warn!(error = %err, "AEMO stream error"),
            }

            if *shutdown.borrow() {
                return;
            }
            let delay = backoff.next();
            debug!(?delay, attempt = backoff.attempts(), "reconnecting to AEMO stream");
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
        let creds = inner.secrets.venue_credentials("aemo").await?;

        let mut request = inner.config.ws_endpoint.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", creds.api_key))
            .map_err(|e| GridError::Internal(format!("invalid api key header: {e}")))?;
        request.headers_mut().insert("Authorization", bearer);

        let (ws, _) = connect_async(request).await?;
        info!("connected to AEMO stream");
        let (mut write, mut read) = ws.split();

        let mut types = vec!["dispatch", "predispatch", "constraint"];
        if inner.config.enable_fcas {
            types.push("fcas");
        }
        let subscribe = serde_json::json!({
            "action": "subscribe",
            "regions": inner.config.regions,
            "types": types,
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

    async fn run_poller(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(inner.config.poll_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    if let Err(err) = inner
                        .poll_breaker
                        .call(|| inner.fetch_dispatch())
                        .await
                    {
                        debug!(error = %err, "dispatch poll skipped");
                    }
                    if inner.config.enable_fcas {
                        if let Err(err) = inner.poll_breaker.call(|| inner.fetch_fcas()).await {
                            debug!(error = %err, "fcas poll skipped");
                        }
                    }
                }
            }
        }
    }

    async fn run_predispatch(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(30 * 60));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    if let Err(err) = inner.fetch_predispatch().await {
                        warn!(error = %err, "predispatch fetch failed");
                    }
                }
            }
        }
    }

    async fn run_constraints(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    if let Err(err) = inner.fetch_constraints().await {
                        warn!(error = %err, "constraint fetch failed");
                    }
                }
            }
        }
    }
}

impl Inner {
    fn handle_message(&self, text: &str) {
        match serde_json::from_str::<StreamMessage>(text) {
            Ok(StreamMessage::Dispatch(price)) => self.ingest_dispatch(price),
            Ok(StreamMessage::Fcas(price)) => self.ingest_fcas(price),
            Ok(StreamMessage::Predispatch(forecast)) => self.predispatch.send(forecast),
            Ok(StreamMessage::Constraint(constraint)) => {
                if constraint.binding {
                    let mut binding = self.binding_constraints.write().expect("lock poisoned");
                    binding.retain(|c| c.constraint_id != constraint.constraint_id);
                    binding.push(constraint.clone());
                }
                self.constraints.send(constraint);
            }
            Err(err) => {
                debug!(error = %err, raw = &text[..text.len().min(120)], "unrecognized AEMO message");
            }
        }
    }

    fn ingest_dispatch(&self, dispatch: DispatchPrice) {
        let status = if dispatch.market_suspended {
            MarketStatus::Closed
        } else {
            MarketStatus::Open
        };
        let latency_ms = (Utc::now() - dispatch.timestamp).num_milliseconds().max(0);

        let price = VenuePrice {
            venue: VenueId::Aemo,
            region: dispatch.region.clone(),
            local_price: dispatch.rrp,
            currency: "AUD".to_string(),
            volume: dispatch.available_gen,
            status,
            produced_at: dispatch.timestamp,
            latency_ms,
        };

        self.latest
            .write()
            .expect("lock poisoned")
            .insert(price.region.clone(), price.clone());
        self.prices.send(price);
    }

    fn ingest_fcas(&self, price: FcasPrice) {
        self.latest_fcas
            .write()
            .expect("lock poisoned")
            .insert((price.region.clone(), price.service), price.clone());
        self.fcas.send(price);
    }

    async fn authorized_get(&self, url: &str) -> Result<reqwest::Response> {
        let creds = self.secrets.venue_credentials("aemo").await?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(&creds.api_key)
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

    async fn fetch_dispatch(&self) -> Result<()> {
        for region in &self.config.regions {
            let url = format!(
                "{}/dispatch/price?region={region}",
                self.config.api_endpoint
            );
            let dispatch: DispatchPrice = self.authorized_get(&url).await?.json().await?;
            self.ingest_dispatch(dispatch);
        }
        Ok(())
    }

    async fn fetch_fcas(&self) -> Result<()> {
        for region in &self.config.regions {
            let url = format!("{}/fcas/prices?region={region}", self.config.api_endpoint);
            let prices: Vec<FcasPrice> = self.authorized_get(&url).await?.json().await?;
            for price in prices {
                self.ingest_fcas(price);
            }
        }
        Ok(())
    }

    async fn fetch_predispatch(&self) -> Result<()> {
        let url = format!("{}/predispatch/prices", self.config.api_endpoint);
        let forecasts: Vec<PredispatchForecast> = self.authorized_get(&url).await?.json().await?;
        let count = forecasts.len();
        for forecast in forecasts {
            self.predispatch.send(forecast);
        }
        debug!(count, "predispatch forecasts updated");
        Ok(())
    }

    async fn fetch_constraints(&self) -> Result<()> {
        let url = format!("{}/constraints/binding", self.config.api_endpoint);
        let constraints: Vec<ConstraintBinding> = self.authorized_get(&url).await?.json().await?;

        {
            let mut binding = self.binding_constraints.write().expect("lock poisoned");
            *binding = constraints.iter().filter(|c| c.binding).cloned().collect();
        }
        for constraint in constraints {
            self.constraints.send(constraint);
        }
        Ok(())
    }
}

#[async_trait]
impl MarketAdapter for AemoAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Aemo
    }

    async fn start(&self) -> Result<()> {
        info!(
            regions = ?self.inner.config.regions,
            fcas = self.inner.config.enable_fcas,
            "starting AEMO adapter"
        );

        let mut tasks = self.tasks.lock().expect("lock poisoned");
        tasks.push(tokio::spawn(Self::run_stream(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(Self::run_poller(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));
        if self.inner.config.enable_predispatch {
            tasks.push(tokio::spawn(Self::run_predispatch(
                self.inner.clone(),
                self.inner.shutdown_tx.subscribe(),
            )));
        }
        tasks.push(tokio::spawn(Self::run_constraints(
            self.inner.clone(),
            self.inner.shutdown_tx.subscribe(),
        )));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("stopping AEMO adapter");
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
            .ok_or_else(|| GridError::MarketDataUnavailable(format!("AEMO:{region}")))
    }

    async fn submit_order(&self, order: &VenueOrder) -> Result<String> {
        order.validate(PRICE_FLOOR, PRICE_CAP, MAX_DISPATCH_INTERVAL)?;

        let creds = self.inner.secrets.venue_credentials("aemo").await?;
        let url = format!("{}/bidding/submit", self.inner.config.api_endpoint);
        let resp = self
            .inner
            .client
            .post(&url)
            .bearer_auth(&creds.api_key)
            .json(order)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GridError::OrderSubmission(format!(
                "AEMO rejected bid ({status}): {body}"
            )));
        }

        let ack: OrderAck = resp.json().await?;
        info!(order_id = %ack.order_id, region = %order.region, "AEMO bid accepted");
        Ok(ack.order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let creds = self.inner.secrets.venue_credentials("aemo").await?;
        let url = format!(
            "{}/bidding/orders/{order_id}",
            self.inner.config.api_endpoint
        );
        let resp = self
            .inner
            .client
            .delete(&url)
            .bearer_auth(&creds.api_key)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::NOT_FOUND => {
                Err(GridError::OrderNotFound(order_id.to_string()))
            }
            s => Err(GridError::OrderSubmission(format!(
                "AEMO cancel failed: {s}"
            ))),
        }
    }

    fn loss_counters(&self) -> HashMap<String, u64> {
        let inner = &self.inner;
        [
            (inner.prices.name(), inner.prices.dropped()),
            (inner.fcas.name(), inner.fcas.dropped()),
            (inner.predispatch.name(), inner.predispatch.dropped()),
            (inner.constraints.name(), inner.constraints.dropped()),
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

    fn adapter() -> AemoAdapter {
        let secrets = Arc::new(SecretCache::new(
            Box::new(EnvSecretProvider),
            Duration::from_secs(60),
        ));
        AemoAdapter::new(AemoConfig::default(), secrets)
    }

    #[tokio::test]
    async fn dispatch_message_becomes_venue_price() {
        let adapter = adapter();
        let mut prices = adapter.take_price_stream().unwrap();

        adapter.inner.handle_message(
            r#"{"type":"dispatch","region":"NSW1","rrp":87.45,"total_demand":7421.0,"available_gen":8100.0,"dispatch_interval":101}"#,
        );

        let price = prices.recv().await.unwrap();
        assert_eq!(price.venue, VenueId::Aemo);
        assert_eq!(price.region, "NSW1");
        assert_eq!(price.currency, "AUD");
        assert_eq!(price.local_price, 87.45);
        assert_eq!(price.volume, 8100.0);
        assert_eq!(price.status, MarketStatus::Open);

        let latest = adapter.latest_price("NSW1").await.unwrap();
        assert_eq!(latest.local_price, 87.45);
    }

    #[tokio::test]
    async fn suspended_market_maps_to_closed() {
        let adapter = adapter();
        adapter.inner.handle_message(
            r#"{"type":"dispatch","region":"SA1","rrp":-12.0,"total_demand":1200.0,"available_gen":1500.0,"market_suspended":true}"#,
        );
        let latest = adapter.latest_price("SA1").await.unwrap();
        assert_eq!(latest.status, MarketStatus::Closed);
    }

    #[tokio::test]
    async fn fcas_message_updates_latest() {
        let adapter = adapter();
        adapter.inner.handle_message(
            r#"{"type":"fcas","region":"VIC1","service":"RAISE_REG","price":14.2,"availability":220.0,"requirement":180.0}"#,
        );
        let fcas = adapter.latest_fcas("VIC1", FcasService::RaiseReg).unwrap();
        assert_eq!(fcas.price, 14.2);
    }

    #[tokio::test]
    async fn binding_constraints_are_tracked() {
        let adapter = adapter();
        adapter.inner.handle_message(
            r#"{"type":"constraint","constraint_id":"N>>V-1","constraint_type":"THERMAL","limit_value":500.0,"marginal_value":42.0,"affected_regions":["NSW1","VIC1"],"binding":true}"#,
        );
        adapter.inner.handle_message(
            r#"{"type":"constraint","constraint_id":"Q-2","constraint_type":"VOLTAGE","limit_value":100.0,"marginal_value":0.0,"affected_regions":["QLD1"],"binding":false}"#,
        );
        let binding = adapter.binding_constraints();
        assert_eq!(binding.len(), 1);
        assert_eq!(binding[0].constraint_id, "N>>V-1");
    }

    #[tokio::test]
    async fn garbage_messages_are_ignored() {
        let adapter = adapter();
        adapter.inner.handle_message("not json at all");
        adapter.inner.handle_message(r#"{"type":"unknown_kind"}"#);
        assert!(adapter.latest_price("NSW1").await.is_err());
    }

    #[tokio::test]
    async fn order_validation_enforces_nem_bounds() {
        let adapter = adapter();
        let order = VenueOrder {
            client_order_id: "c1".to_string(),
            venue: VenueId::Aemo,
            region: "NSW1".to_string(),
            participant_id: "DUID42".to_string(),
            side: crate::domain::OrderSide::Sell,
            price: dec!(17000), // above the market price cap
            quantity: dec!(50),
            period: 10,
            submitted_at: Utc::now(),
        };
        let result = adapter.submit_order(&order).await;
        assert!(matches!(result, Err(GridError::OrderValidation(_))));
    }
}
