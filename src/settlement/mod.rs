//! Asynchronous settlement submission and confirmation tracking.
//!
//! Trade results are turned into settlement records, submitted to an
//! external chain through the [`ChainClient`] contract with bounded
//! retries, and promoted to CONFIRMED once enough blocks build on top.
//! Records live in the tracker's own maps until confirmed or failed;
//! this path is never lossy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SettlementConfig;
use crate::domain::{Settlement, SettlementStatus, SettlementType, TradeResult};
use crate::error::{GridError, Result};

/// External chain access: submission and confirmation counting only.
/// No assumptions about chain identity beyond ordered confirmations.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Submit a settlement; returns the transaction reference.
    async fn submit(&self, settlement: &Settlement) -> Result<String>;

    /// Confirmation count and block number for a submitted transaction.
    async fn confirmations(&self, tx_ref: &str) -> Result<(u32, u64)>;
}

#[derive(Debug, serde::Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, serde::Deserialize)]
struct TxReceipt {
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
}

/// JSON-RPC chain client (eth-compatible endpoint).
pub struct HttpChainClient {
    client: reqwest::Client,
    rpc_url: String,
    wallet_address: String,
}

impl HttpChainClient {
    pub fn new(rpc_url: String, wallet_address: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            rpc_url,
            wallet_address,
        }
    }

    /// One JSON-RPC round-trip. `Ok(None)` is a null result (e.g. an
    /// unmined transaction receipt).
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp: JsonRpcResponse<T> = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = resp.error {
            return Err(GridError::ChainClient(format!("{method} failed: {err}")));
        }
        Ok(resp.result)
    }
}

fn parse_hex_u64(raw: &str) -> Result<u64> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| GridError::ChainClient(format!("bad hex quantity {raw}: {e}")))
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn submit(&self, settlement: &Settlement) -> Result<String> {
        let params = serde_json::json!([{
            "from": self.wallet_address,
            "to": settlement.to_address,
            "data": format!("0x{}", hex::encode(settlement.id.as_bytes())),
            "value": format!("{:#x}", amount_to_wei(settlement.amount)),
        }]);
        self.call::<String>("eth_sendTransaction", params)
            .await?
            .ok_or_else(|| GridError::ChainClient("eth_sendTransaction returned no hash".to_string()))
    }

    async fn confirmations(&self, tx_ref: &str) -> Result<(u32, u64)> {
        let receipt: Option<TxReceipt> = self
            .call("eth_getTransactionReceipt", serde_json::json!([tx_ref]))
            .await?;
        let Some(block_hex) = receipt.and_then(|r| r.block_number) else {
            // Not yet mined.
            return Ok((0, 0));
        };
        let tx_block = parse_hex_u64(&block_hex)?;

        let head_hex: String = self
            .call("eth_blockNumber", serde_json::json!([]))
            .await?
            .ok_or_else(|| GridError::ChainClient("eth_blockNumber returned no result".to_string()))?;
        let head = parse_hex_u64(&head_hex)?;

        let confirmations = head.saturating_sub(tx_block).min(u32::MAX as u64) as u32;
        Ok((confirmations, tx_block))
    }
}

/// Settlement amounts carry 6 decimal places on chain.
fn amount_to_wei(amount: Decimal) -> u64 {
    use rust_decimal::prelude::ToPrimitive;
    (amount.abs() * Decimal::from(1_000_000u64))
        .trunc()
        .to_u64()
        .unwrap_or(0)
}

/// In-memory chain for development and tests.
pub struct SimulatedChainClient {
    submissions: AtomicU64,
    confirmations_per_query: u32,
}

impl SimulatedChainClient {
    pub fn new(confirmations_per_query: u32) -> Self {
        Self {
            submissions: AtomicU64::new(0),
            confirmations_per_query,
        }
    }
}

#[async_trait]
impl ChainClient for SimulatedChainClient {
    async fn submit(&self, settlement: &Settlement) -> Result<String> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst);
        Ok(format!("0xsim{n:08x}{}", &settlement.id[7..15.min(settlement.id.len())]))
    }

    async fn confirmations(&self, _tx_ref: &str) -> Result<(u32, u64)> {
        Ok((self.confirmations_per_query, 50_000_000))
    }
}

/// Outcome notifications for the event fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementEvent {
    pub settlement: Settlement,
    pub success: bool,
}

pub struct SettlementTracker {
    config: SettlementConfig,
    chain: Arc<dyn ChainClient>,

    pending: Mutex<HashMap<String, Settlement>>,
    confirmed: Mutex<HashMap<String, Settlement>>,

    submit_tx: mpsc::Sender<Settlement>,
    submit_rx: Mutex<Option<mpsc::Receiver<Settlement>>>,
    event_tx: mpsc::Sender<SettlementEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SettlementEvent>>>,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementSystemStatus {
    pub chain_id: u64,
    pub wallet_address: String,
    pub pending_count: usize,
    pub confirmed_count: usize,
    pub total_pending: Decimal,
    pub total_confirmed: Decimal,
    pub confirmation_blocks: u32,
    pub last_update: DateTime<Utc>,
}

impl SettlementTracker {
    pub fn new(config: SettlementConfig, chain: Arc<dyn ChainClient>) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(100);
        let (event_tx, event_rx) = mpsc::channel(100);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            chain,
            pending: Mutex::new(HashMap::new()),
            confirmed: Mutex::new(HashMap::new()),
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Outcome stream; taken once.
    pub fn events(&self) -> Option<mpsc::Receiver<SettlementEvent>> {
        self.event_rx.lock().expect("lock poisoned").take()
    }

    /// Build a settlement for a filled trade and queue it for submission.
    pub fn track_trade(&self, trade: &TradeResult) -> Result<Settlement> {
        let settlement = Settlement::new(
            trade.id.clone(),
            SettlementType::Trade,
            trade.notional(),
            self.config.wallet_address.clone(),
            self.config.settlement_address.clone(),
        );
        self.enqueue(settlement)
    }

    /// Direct settlement creation (deposits, withdrawals, fees).
    pub fn create_settlement(
        &self,
        kind: SettlementType,
        amount: Decimal,
        to_address: String,
    ) -> Result<Settlement> {
        let settlement = Settlement::new(
            String::new(),
            kind,
            amount,
            self.config.wallet_address.clone(),
            to_address,
        );
        self.enqueue(settlement)
    }

    fn enqueue(&self, settlement: Settlement) -> Result<Settlement> {
        self.pending
            .lock()
            .expect("lock poisoned")
            .insert(settlement.id.clone(), settlement.clone());

        self.submit_tx
            .try_send(settlement.clone())
            .map_err(|_| GridError::SettlementSubmission("submission queue full".to_string()))?;
        Ok(settlement)
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("lock poisoned");

        {
            let tracker = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let Some(mut rx) = self.submit_rx.lock().expect("lock poisoned").take() else {
                return Err(GridError::Internal(
                    "settlement tracker already started".to_string(),
                ));
            };
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        settlement = rx.recv() => {
                            let Some(settlement) = settlement else { return };
                            tracker.attempt_submission(settlement.id.clone()).await;
                        }
                    }
                }
            }));
        }

        {
            let tracker = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = Duration::from_secs(self.config.confirm_interval_secs.max(1));
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = tick.tick() => tracker.scan_confirmations().await,
                    }
                }
            }));
        }

        info!(
            confirmation_blocks = self.config.confirmation_blocks,
            "settlement tracker started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let tasks = {
            let mut guard = self.tasks.lock().expect("lock poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    /// Submit one pending settlement, retrying up to max_retries with a
    /// fixed delay between attempts.
    pub async fn attempt_submission(&self, id: String) {
        let Some(mut settlement) = self
            .pending
            .lock()
            .expect("lock poisoned")
            .get(&id)
            .cloned()
        else {
            return;
        };

        settlement.status = SettlementStatus::Submitted;
        let mut last_err: Option<GridError> = None;

        for attempt in 0..self.config.max_retries.max(1) {
            match self.chain.submit(&settlement).await {
                Ok(tx_ref) => {
                    debug!(id = %settlement.id, tx = %tx_ref, "settlement submitted");
                    settlement.tx_ref = Some(tx_ref);
                    settlement.status = SettlementStatus::Confirming;
                    self.pending
                        .lock()
                        .expect("lock poisoned")
                        .insert(settlement.id.clone(), settlement);
                    return;
                }
                Err(err) => {
                    warn!(id = %settlement.id, attempt, error = %err, "settlement submission failed");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
                }
            }
        }

        settlement.status = SettlementStatus::Failed;
        settlement.error = last_err.map(|e| e.to_string());
        self.pending
            .lock()
            .expect("lock poisoned")
            .insert(settlement.id.clone(), settlement.clone());

        if self
            .event_tx
            .try_send(SettlementEvent {
                settlement,
                success: false,
            })
            .is_err()
        {
            warn!("settlement event channel full, dropping failure event");
        }
    }

    /// One pass over CONFIRMING records.
    pub async fn scan_confirmations(&self) {
        let confirming: Vec<Settlement> = {
            let pending = self.pending.lock().expect("lock poisoned");
            pending
                .values()
                .filter(|s| s.status == SettlementStatus::Confirming)
                .cloned()
                .collect()
        };

        for mut settlement in confirming {
            let Some(tx_ref) = settlement.tx_ref.clone() else {
                continue;
            };
            let (confirmations, block) = match self.chain.confirmations(&tx_ref).await {
                Ok(result) => result,
                Err(err) => {
                    debug!(tx = %tx_ref, error = %err, "confirmation query failed");
                    continue;
                }
            };

            settlement.confirmations = confirmations;
            if block > 0 {
                settlement.block_number = Some(block);
            }

            if confirmations >= self.config.confirmation_blocks {
                settlement.status = SettlementStatus::Confirmed;
                settlement.confirmed_at = Some(Utc::now());

                {
                    let mut pending = self.pending.lock().expect("lock poisoned");
                    pending.remove(&settlement.id);
                }
                self.confirmed
                    .lock()
                    .expect("lock poisoned")
                    .insert(settlement.id.clone(), settlement.clone());

                info!(
                    id = %settlement.id,
                    tx = %tx_ref,
                    block,
                    confirmations,
                    "settlement confirmed"
                );

                if self
                    .event_tx
                    .try_send(SettlementEvent {
                        settlement,
                        success: true,
                    })
                    .is_err()
                {
                    warn!("settlement event channel full, dropping success event");
                }
            } else {
                self.pending
                    .lock()
                    .expect("lock poisoned")
                    .insert(settlement.id.clone(), settlement);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Settlement> {
        if let Some(s) = self.pending.lock().expect("lock poisoned").get(id) {
            return Some(s.clone());
        }
        self.confirmed.lock().expect("lock poisoned").get(id).cloned()
    }

    pub fn pending(&self) -> Vec<Settlement> {
        self.pending
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn confirmed_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Settlement> {
        self.confirmed
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|s| {
                s.confirmed_at
                    .is_some_and(|at| at >= start && at <= end)
            })
            .cloned()
            .collect()
    }

    pub fn status(&self) -> SettlementSystemStatus {
        let pending = self.pending.lock().expect("lock poisoned");
        let confirmed = self.confirmed.lock().expect("lock poisoned");

        let total_pending = pending.values().map(|s| s.amount).sum();
        let total_confirmed = confirmed.values().map(|s| s.amount).sum();

        SettlementSystemStatus {
            chain_id: self.config.chain_id,
            wallet_address: self.config.wallet_address.clone(),
            pending_count: pending.len(),
            confirmed_count: confirmed.len(),
            total_pending,
            total_confirmed,
            confirmation_blocks: self.config.confirmation_blocks,
            last_update: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;

    /// Chain double that fails the first `fail_submits` submissions and
    /// advances confirmations on every query.
    struct ScriptedChain {
        fail_submits: AtomicU32,
        confirmations: AtomicU32,
        step: u32,
    }

    impl ScriptedChain {
        fn new(fail_submits: u32, step: u32) -> Self {
            Self {
                fail_submits: AtomicU32::new(fail_submits),
                confirmations: AtomicU32::new(0),
                step,
            }
        }
    }

    #[async_trait]
    impl ChainClient for ScriptedChain {
        async fn submit(&self, settlement: &Settlement) -> Result<String> {
            let remaining = self.fail_submits.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_submits.store(remaining - 1, Ordering::SeqCst);
                return Err(GridError::ChainClient("nonce too low".to_string()));
            }
            Ok(format!("0xtx-{}", settlement.id))
        }

        async fn confirmations(&self, _tx_ref: &str) -> Result<(u32, u64)> {
            let c = self.confirmations.fetch_add(self.step, Ordering::SeqCst) + self.step;
            Ok((c, 1000 + c as u64))
        }
    }

    fn tracker(chain: Arc<dyn ChainClient>) -> Arc<SettlementTracker> {
        let config = SettlementConfig {
            confirmation_blocks: 2,
            max_retries: 3,
            retry_delay_secs: 0,
            wallet_address: "0xwallet".to_string(),
            ..SettlementConfig::default()
        };
        Arc::new(SettlementTracker::new(config, chain))
    }

    fn settlement_for(tracker: &SettlementTracker) -> Settlement {
        tracker
            .create_settlement(SettlementType::Deposit, dec!(250), "0xvault".to_string())
            .unwrap()
    }

    #[tokio::test]
    async fn settles_through_confirming_to_confirmed() {
        let t = tracker(Arc::new(ScriptedChain::new(0, 1)));
        let mut events = t.events().unwrap();
        let s = settlement_for(&t);
        assert_eq!(s.status, SettlementStatus::Pending);

        t.attempt_submission(s.id.clone()).await;
        let after_submit = t.get(&s.id).unwrap();
        assert_eq!(after_submit.status, SettlementStatus::Confirming);
        assert!(after_submit.tx_ref.is_some());

        // First scan: 1 confirmation, still confirming.
        t.scan_confirmations().await;
        assert_eq!(t.get(&s.id).unwrap().status, SettlementStatus::Confirming);

        // Second scan reaches the 2-block requirement.
        t.scan_confirmations().await;
        let done = t.get(&s.id).unwrap();
        assert_eq!(done.status, SettlementStatus::Confirmed);
        assert!(done.confirmed_at.is_some());
        assert!(done.block_number.is_some());
        assert!(t.pending().is_empty());

        let event = events.try_recv().unwrap();
        assert!(event.success);
    }

    #[tokio::test]
    async fn retries_transient_submission_failures() {
        let t = tracker(Arc::new(ScriptedChain::new(2, 5)));
        let s = settlement_for(&t);

        t.attempt_submission(s.id.clone()).await;
        // Two failures then success within the 3 allowed attempts.
        assert_eq!(t.get(&s.id).unwrap().status, SettlementStatus::Confirming);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_failed_and_emit() {
        let t = tracker(Arc::new(ScriptedChain::new(10, 1)));
        let mut events = t.events().unwrap();
        let s = settlement_for(&t);

        t.attempt_submission(s.id.clone()).await;
        let failed = t.get(&s.id).unwrap();
        assert_eq!(failed.status, SettlementStatus::Failed);
        assert!(failed.error.is_some());

        let event = events.try_recv().unwrap();
        assert!(!event.success);
        // Failed records are retained, never silently dropped.
        assert_eq!(t.pending().len(), 1);
    }

    #[tokio::test]
    async fn track_trade_builds_trade_settlement() {
        use crate::domain::{
            ArbitrageOpportunity, SignalKind, TradeSignal, TradeStatus, VenueId,
        };
        let t = tracker(Arc::new(ScriptedChain::new(0, 5)));

        let signal = TradeSignal {
            kind: SignalKind::Arbitrage,
            venue: VenueId::Aemo,
            opportunity: ArbitrageOpportunity {
                id: "opp".to_string(),
                source_venue: VenueId::Aemo,
                source_region: "NSW1".to_string(),
                target_venue: VenueId::Jepx,
                target_region: "TOKYO".to_string(),
                buy_price: 50.0,
                sell_price: 55.0,
                spread: 5.0,
                spread_percent: 10.0,
                transfer_cost: 1.0,
                net_spread: 4.0,
                max_volume: 100.0,
                estimated_profit: 400.0,
                risk_score: 0.2,
                detected_at: Utc::now(),
                valid_until: Utc::now(),
            },
            created_at: Utc::now(),
        };
        let trade = TradeResult {
            id: "TRD-1".to_string(),
            signal,
            status: TradeStatus::Filled,
            executed_at: Utc::now(),
            entry_price: dec!(50),
            exit_price: dec!(55),
            quantity: dec!(2),
            gross_pnl: dec!(10),
            fees: dec!(0.5),
            net_pnl: dec!(9.5),
            settlement_ref: None,
        };

        let s = t.track_trade(&trade).unwrap();
        assert_eq!(s.trade_id, "TRD-1");
        assert_eq!(s.kind, SettlementType::Trade);
        assert_eq!(s.amount, dec!(100));
    }

    #[tokio::test]
    async fn confirmed_between_filters_by_window() {
        let t = tracker(Arc::new(ScriptedChain::new(0, 5)));
        let s = settlement_for(&t);
        t.attempt_submission(s.id.clone()).await;
        t.scan_confirmations().await;

        let now = Utc::now();
        let hits = t.confirmed_between(now - chrono::Duration::minutes(1), now);
        assert_eq!(hits.len(), 1);
        let none = t.confirmed_between(now - chrono::Duration::hours(2), now - chrono::Duration::hours(1));
        assert!(none.is_empty());
    }

    #[test]
    fn hex_parsing_and_amount_scaling() {
        assert_eq!(parse_hex_u64("0x2fa8").unwrap(), 12200);
        assert!(parse_hex_u64("zz").is_err());
        assert_eq!(amount_to_wei(dec!(1.5)), 1_500_000);
    }
}
