//! Trading engine pipeline: signal intake → kill-switch gate → risk
//! shield → execution → PnL update → settlement dispatch → event emit.
//!
//! Signal→execute→log runs single-threaded in the processor loop; PnL
//! and the high-water-mark are updated under one lock so drawdown reads
//! are always consistent.

pub mod risk;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alerts::{AlertDispatcher, AlertLevel};
use crate::config::EngineConfig;
use crate::domain::{
    ArbitrageOpportunity, EventKind, TradeResult, TradeSignal, TradeStatus, VenueId,
};
use crate::error::{GridError, Result};
use crate::events::EventBroadcaster;
use crate::killswitch::{Capability, KillSwitch};
use crate::settlement::SettlementTracker;
pub use risk::{RiskShield, RiskShieldStatus, RiskStatus, RiskWarning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineStatus {
    Initializing,
    Ready,
    Running,
    SafetyLock,
    Stopped,
    Emergency,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Initializing => "INITIALIZING",
            EngineStatus::Ready => "READY",
            EngineStatus::Running => "RUNNING",
            EngineStatus::SafetyLock => "SAFETY_LOCK",
            EngineStatus::Stopped => "STOPPED",
            EngineStatus::Emergency => "EMERGENCY",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatusReport {
    pub status: EngineStatus,
    pub runtime_secs: i64,
    pub initial_capital: Decimal,
    pub current_equity: Decimal,
    pub cumulative_pnl: Decimal,
    pub roi_pct: f64,
    pub current_mdd: f64,
    pub max_mdd: f64,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub win_rate: f64,
    pub rejected_by_killswitch: u64,
    pub rejected_by_risk: u64,
    pub enabled_venues: Vec<String>,
    pub last_update: DateTime<Utc>,
}

struct EngineCore {
    status: EngineStatus,
    cumulative_pnl: Decimal,
    high_water_mark: Decimal,
    current_mdd: f64,
    started_at: DateTime<Utc>,
}

pub struct TradingEngine {
    config: EngineConfig,
    killswitch: Arc<KillSwitch>,
    risk: Arc<RiskShield>,
    settlement: Arc<SettlementTracker>,
    broadcaster: Arc<EventBroadcaster>,
    alerts: Arc<AlertDispatcher>,

    core: Mutex<EngineCore>,
    total_trades: AtomicU64,
    winning_trades: AtomicU64,
    losing_trades: AtomicU64,
    killswitch_rejections: AtomicU64,
    risk_rejections: AtomicU64,

    signal_tx: mpsc::Sender<TradeSignal>,
    signal_rx: Mutex<Option<mpsc::Receiver<TradeSignal>>>,
    trade_log: Mutex<Vec<TradeResult>>,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TradingEngine {
    pub fn new(
        config: EngineConfig,
        killswitch: Arc<KillSwitch>,
        risk: Arc<RiskShield>,
        settlement: Arc<SettlementTracker>,
        broadcaster: Arc<EventBroadcaster>,
        alerts: Arc<AlertDispatcher>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(100);
        let (shutdown_tx, _) = watch::channel(false);
        let initial = config.initial_capital;

        Self {
            config,
            killswitch,
            risk,
            settlement,
            broadcaster,
            alerts,
            core: Mutex::new(EngineCore {
                status: EngineStatus::Initializing,
                cumulative_pnl: Decimal::ZERO,
                high_water_mark: initial,
                current_mdd: 0.0,
                started_at: Utc::now(),
            }),
            total_trades: AtomicU64::new(0),
            winning_trades: AtomicU64::new(0),
            losing_trades: AtomicU64::new(0),
            killswitch_rejections: AtomicU64::new(0),
            risk_rejections: AtomicU64::new(0),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            trade_log: Mutex::new(Vec::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Startup validation. Any failure here is unrecoverable.
    pub async fn preflight(&self) -> Result<()> {
        if self.config.initial_capital <= Decimal::ZERO {
            return Err(GridError::InvalidConfig(
                "initial capital must be positive".to_string(),
            ));
        }
        if self.config.enabled_venues.is_empty() {
            return Err(GridError::InvalidConfig("no venues enabled".to_string()));
        }
        if !self.config.safety_lock_enabled {
            return Err(GridError::InvalidConfig(
                "safety lock must be enabled".to_string(),
            ));
        }
        // Collaborator health: the alert sink must accept a probe and the
        // settlement tracker must answer a status query.
        self.alerts
            .send(
                AlertLevel::Info,
                "Engine preflight",
                format!("capital ${}", self.config.initial_capital),
                HashMap::new(),
            )
            .await?;
        let _ = self.settlement.status();
        Ok(())
    }

    pub async fn start(
        self: &Arc<Self>,
        mut opportunities: mpsc::Receiver<ArbitrageOpportunity>,
    ) -> Result<()> {
        {
            let core = self.core.lock().expect("lock poisoned");
            if core.status == EngineStatus::Running {
                return Err(GridError::InvalidStateTransition {
                    from: "RUNNING".to_string(),
                    to: "RUNNING".to_string(),
                });
            }
        }

        self.preflight().await?;

        {
            let mut core = self.core.lock().expect("lock poisoned");
            core.status = EngineStatus::Running;
            core.started_at = Utc::now();
        }
        info!(
            capital = %self.config.initial_capital,
            venues = ?self.config.enabled_venues,
            "trading engine started"
        );

        let mut tasks = self.tasks.lock().expect("lock poisoned");

        // Opportunity intake: promote qualifying opportunities to signals.
        {
            let engine = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        opp = opportunities.recv() => {
                            let Some(opp) = opp else { return };
                            engine.intake_opportunity(opp);
                        }
                    }
                }
            }));
        }

        // Processor: drains the signal queue single-threaded.
        {
            let engine = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let Some(mut signals) = self.signal_rx.lock().expect("lock poisoned").take() else {
                return Err(GridError::Internal("engine already started".to_string()));
            };
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        signal = signals.recv() => {
                            let Some(signal) = signal else { return };
                            engine.process_signal(signal).await;
                        }
                    }
                }
            }));
        }

        // Risk warning subscription: mirror shield events outward instead
        // of the shield calling back into the engine.
        if let Some(mut warnings) = self.risk.warnings() {
            let engine = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        warning = warnings.recv() => {
                            let Some(warning) = warning else { return };
                            engine.handle_risk_warning(warning).await;
                        }
                    }
                }
            }));
        }

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        {
            let mut core = self.core.lock().expect("lock poisoned");
            if core.status != EngineStatus::Running && core.status != EngineStatus::SafetyLock {
                return Err(GridError::InvalidStateTransition {
                    from: core.status.as_str().to_string(),
                    to: "STOPPED".to_string(),
                });
            }
            core.status = EngineStatus::Stopped;
        }

        let _ = self.shutdown_tx.send(true);
        let tasks = {
            let mut guard = self.tasks.lock().expect("lock poisoned");
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }

        info!(
            total_trades = self.total_trades.load(Ordering::Relaxed),
            "trading engine stopped"
        );
        Ok(())
    }

    /// Promote an opportunity to a trade signal when it clears the scan
    /// preconditions: both venues enabled and spread at margin.
    pub fn intake_opportunity(&self, opp: ArbitrageOpportunity) {
        if !self.venue_enabled(opp.source_venue) || !self.venue_enabled(opp.target_venue) {
            return;
        }
        if opp.spread_percent < self.config.min_profit_margin {
            return;
        }

        self.broadcaster.emit(
            EventKind::Arbitrage,
            serde_json::to_value(&opp).unwrap_or_default(),
        );

        let signal = TradeSignal::arbitrage(opp.target_venue, opp);
        if self.signal_tx.try_send(signal).is_err() {
            warn!("signal queue full, dropping trade signal");
        }
    }

    fn venue_enabled(&self, venue: VenueId) -> bool {
        self.config
            .enabled_venues
            .iter()
            .any(|v| VenueId::parse(v) == Some(venue))
    }

    /// One full pipeline pass for a signal. A signal ends in exactly one
    /// of: executed, kill-switch-rejected, risk-rejected.
    pub async fn process_signal(&self, signal: TradeSignal) {
        if !self.killswitch.check(Capability::NewTrade) {
            self.killswitch_rejections.fetch_add(1, Ordering::Relaxed);
            warn!(
                level = %self.killswitch.level(),
                opportunity = %signal.opportunity.id,
                "trade rejected by kill switch"
            );
            return;
        }

        if let Err(rejection) = self.risk.allow_trade(&signal) {
            self.risk_rejections.fetch_add(1, Ordering::Relaxed);
            warn!(reason = %rejection, opportunity = %signal.opportunity.id, "trade rejected by risk shield");
            self.broadcaster.emit(
                EventKind::RiskAlert,
                serde_json::json!({
                    "kind": "TRADE_BLOCKED",
                    "reason": rejection.to_string(),
                    "opportunity": signal.opportunity.id,
                }),
            );
            return;
        }

        let result = self.execute_trade(signal);
        self.apply_result(&result).await;
    }

    /// Build the trade result for a signal. Execution is atomic from the
    /// engine's perspective: nothing is shared until apply_result.
    fn execute_trade(&self, signal: TradeSignal) -> TradeResult {
        let entry = Decimal::from_f64(signal.opportunity.buy_price).unwrap_or(Decimal::ZERO);
        let exit = Decimal::from_f64(signal.opportunity.sell_price).unwrap_or(Decimal::ZERO);

        // Conservative sizing: at most 10% of capital per trade, capped
        // by the configured maximum and the opportunity's volume.
        let notional = (self.config.initial_capital * dec!(0.1)).min(self.config.max_position_size);
        let mut quantity = if entry > Decimal::ZERO {
            notional / entry
        } else {
            Decimal::ZERO
        };
        let max_volume = Decimal::from_f64(signal.opportunity.max_volume).unwrap_or(Decimal::ZERO);
        quantity = quantity.min(max_volume).round_dp(4);

        let gross = (exit - entry) * quantity;
        let fees = self.config.trade_fee;

        TradeResult {
            id: format!("TRD-{}", Uuid::new_v4().simple()),
            signal,
            status: TradeStatus::Filled,
            executed_at: Utc::now(),
            entry_price: entry,
            exit_price: exit,
            quantity,
            gross_pnl: gross,
            fees,
            net_pnl: gross - fees,
            settlement_ref: None,
        }
    }

    /// Fold a result into PnL, counters, the shield, settlement, and the
    /// event stream.
    async fn apply_result(&self, result: &TradeResult) {
        let mut result = result.clone();

        let (equity, hwm, mdd, locked) = {
            let mut core = self.core.lock().expect("lock poisoned");
            core.cumulative_pnl += result.net_pnl;
            let equity = self.config.initial_capital + core.cumulative_pnl;
            if equity > core.high_water_mark {
                core.high_water_mark = equity;
            }
            let hwm = core.high_water_mark;
            core.current_mdd = if hwm > Decimal::ZERO {
                (((hwm - equity) / hwm) * Decimal::ONE_HUNDRED)
                    .to_f64()
                    .unwrap_or(0.0)
                    .max(0.0)
            } else {
                0.0
            };
            let locked = core.current_mdd >= self.config.max_drawdown_pct;
            if locked && core.status == EngineStatus::Running {
                core.status = EngineStatus::SafetyLock;
            }
            (equity, hwm, core.current_mdd, locked)
        };

        self.total_trades.fetch_add(1, Ordering::Relaxed);
        if result.net_pnl > Decimal::ZERO {
            self.winning_trades.fetch_add(1, Ordering::Relaxed);
        } else if result.net_pnl < Decimal::ZERO {
            self.losing_trades.fetch_add(1, Ordering::Relaxed);
        }

        self.risk.record_trade(&result);
        self.risk.update_equity(equity, hwm);

        if locked {
            warn!(mdd, "SAFETY LOCK: drawdown limit reached");
            let _ = self
                .alerts
                .send(
                    AlertLevel::Critical,
                    "Safety lock activated",
                    format!("drawdown {:.2}% reached the configured limit", mdd),
                    HashMap::new(),
                )
                .await;
        }

        if result.status == TradeStatus::Filled {
            match self.settlement.track_trade(&result) {
                Ok(settlement) => result.settlement_ref = Some(settlement.id),
                Err(err) => warn!(error = %err, "settlement dispatch failed"),
            }
        }

        {
            let mut log = self.trade_log.lock().expect("lock poisoned");
            log.push(result.clone());
            if log.len() > 1000 {
                let excess = log.len() - 1000;
                log.drain(..excess);
            }
        }

        self.broadcaster.emit(
            EventKind::Trade,
            serde_json::to_value(&result).unwrap_or_default(),
        );
        self.broadcaster.emit(
            EventKind::NetProfit,
            serde_json::json!({
                "cumulative_pnl": self.core.lock().expect("lock poisoned").cumulative_pnl,
                "equity": equity,
                "mdd": mdd,
            }),
        );
    }

    async fn handle_risk_warning(&self, warning: RiskWarning) {
        self.broadcaster.emit(
            EventKind::RiskAlert,
            serde_json::to_value(&warning).unwrap_or_default(),
        );

        if warning.kind == "SAFETY_LOCK" {
            let mut core = self.core.lock().expect("lock poisoned");
            if core.status == EngineStatus::Running {
                core.status = EngineStatus::SafetyLock;
            }
        } else {
            let _ = self
                .alerts
                .send(
                    AlertLevel::Warning,
                    warning.kind.clone(),
                    warning.message.clone(),
                    HashMap::new(),
                )
                .await;
        }
    }

    /// Operator reset out of SAFETY_LOCK back to RUNNING.
    pub fn release_safety_lock(&self, operator: &str) -> Result<()> {
        let mut core = self.core.lock().expect("lock poisoned");
        if core.status != EngineStatus::SafetyLock {
            return Err(GridError::InvalidStateTransition {
                from: core.status.as_str().to_string(),
                to: "RUNNING".to_string(),
            });
        }
        self.risk.unlock(operator);
        core.status = EngineStatus::Running;
        info!(operator, "safety lock released, engine resumed");
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        self.core.lock().expect("lock poisoned").status
    }

    pub fn trade_log(&self) -> Vec<TradeResult> {
        self.trade_log.lock().expect("lock poisoned").clone()
    }

    pub fn report(&self) -> EngineStatusReport {
        let core = self.core.lock().expect("lock poisoned");
        let total = self.total_trades.load(Ordering::Relaxed);
        let winning = self.winning_trades.load(Ordering::Relaxed);
        let equity = self.config.initial_capital + core.cumulative_pnl;
        let roi_pct = if self.config.initial_capital > Decimal::ZERO {
            ((core.cumulative_pnl / self.config.initial_capital) * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        EngineStatusReport {
            status: core.status,
            runtime_secs: (Utc::now() - core.started_at).num_seconds(),
            initial_capital: self.config.initial_capital,
            current_equity: equity,
            cumulative_pnl: core.cumulative_pnl,
            roi_pct,
            current_mdd: core.current_mdd,
            max_mdd: self.config.max_drawdown_pct,
            total_trades: total,
            winning_trades: winning,
            losing_trades: self.losing_trades.load(Ordering::Relaxed),
            win_rate: if total > 0 {
                winning as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            rejected_by_killswitch: self.killswitch_rejections.load(Ordering::Relaxed),
            rejected_by_risk: self.risk_rejections.load(Ordering::Relaxed),
            enabled_venues: self.config.enabled_venues.clone(),
            last_update: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MemoryAlerter;
    use crate::config::{KillSwitchConfig, RiskConfig, SettlementConfig};
    use crate::domain::SignalKind;
    use crate::killswitch::{LockdownLevel, Role};
    use crate::settlement::SimulatedChainClient;

    fn opportunity(buy: f64, sell: f64) -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            id: format!("ARB-{}", Uuid::new_v4().simple()),
            source_venue: VenueId::Aemo,
            source_region: "NSW1".to_string(),
            target_venue: VenueId::Jepx,
            target_region: "TOKYO".to_string(),
            buy_price: buy,
            sell_price: sell,
            spread: sell - buy,
            spread_percent: (sell - buy) / buy * 100.0,
            transfer_cost: 1.0,
            net_spread: sell - buy - 1.0,
            max_volume: 100.0,
            estimated_profit: (sell - buy - 1.0) * 100.0,
            risk_score: 0.2,
            detected_at: Utc::now(),
            valid_until: Utc::now() + chrono::Duration::seconds(30),
        }
    }

    fn signal(buy: f64, sell: f64) -> TradeSignal {
        TradeSignal {
            kind: SignalKind::Arbitrage,
            venue: VenueId::Jepx,
            opportunity: opportunity(buy, sell),
            created_at: Utc::now(),
        }
    }

    fn engine() -> Arc<TradingEngine> {
        engine_with(EngineConfig {
            initial_capital: dec!(1000),
            max_drawdown_pct: 2.0,
            enabled_venues: vec!["AEMO".to_string(), "JEPX".to_string()],
            max_position_size: dec!(100),
            max_open_positions: 5,
            min_profit_margin: 0.5,
            safety_lock_enabled: true,
            trade_fee: dec!(0.5),
        })
    }

    fn engine_with(config: EngineConfig) -> Arc<TradingEngine> {
        let killswitch = Arc::new(KillSwitch::new(KillSwitchConfig::default()));
        let risk = Arc::new(RiskShield::new(
            RiskConfig {
                block_weekends: false,
                ..RiskConfig::default()
            },
            config.initial_capital,
        ));
        let settlement = Arc::new(SettlementTracker::new(
            SettlementConfig::default(),
            Arc::new(SimulatedChainClient::new(13)),
        ));
        let broadcaster = Arc::new(EventBroadcaster::new(
            crate::config::EventsConfig::default(),
        ));
        let alerts = AlertDispatcher::new(Arc::new(MemoryAlerter::default()), 60);

        Arc::new(TradingEngine::new(
            config, killswitch, risk, settlement, broadcaster, alerts,
        ))
    }

    #[tokio::test]
    async fn executes_profitable_signal_and_updates_pnl() {
        let e = engine();
        e.process_signal(signal(50.0, 55.0)).await;

        let report = e.report();
        assert_eq!(report.total_trades, 1);
        assert_eq!(report.winning_trades, 1);
        // notional 100 at entry 50 => quantity 2; (55-50)*2 - 0.5 = 9.5
        assert_eq!(report.cumulative_pnl, dec!(9.5));
        assert_eq!(report.current_equity, dec!(1009.5));
        // Equity above initial capital raises the high-water-mark.
        assert_eq!(report.current_mdd, 0.0);

        let log = e.trade_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].settlement_ref.is_some());
    }

    #[tokio::test]
    async fn killswitch_gate_rejects_before_risk() {
        let e = engine();
        e.killswitch
            .set_level(LockdownLevel::Warning, "ops", Role::Admin, "test")
            .unwrap();

        e.process_signal(signal(50.0, 55.0)).await;

        let report = e.report();
        assert_eq!(report.total_trades, 0);
        assert_eq!(report.rejected_by_killswitch, 1);
        assert_eq!(report.rejected_by_risk, 0);
    }

    #[tokio::test]
    async fn drawdown_sequence_locks_engine_and_rejects_signals() {
        let e = engine();

        // Losing trades: drive equity down past the 2% drawdown limit.
        // Each: quantity 2 at entry 50, exit 45 => -10.5 net.
        e.process_signal(signal(50.0, 45.0)).await;
        e.process_signal(signal(50.0, 45.0)).await;

        let report = e.report();
        assert!(report.current_mdd >= 2.0, "mdd {}", report.current_mdd);
        assert_eq!(report.status, EngineStatus::SafetyLock);

        // Subsequent signals are risk-rejected, not executed.
        e.process_signal(signal(50.0, 55.0)).await;
        assert_eq!(e.report().total_trades, 2);
        assert_eq!(e.report().rejected_by_risk, 1);
    }

    #[tokio::test]
    async fn release_safety_lock_resumes_trading() {
        let e = engine();
        e.process_signal(signal(50.0, 45.0)).await;
        e.process_signal(signal(50.0, 45.0)).await;
        assert_eq!(e.status(), EngineStatus::SafetyLock);

        e.release_safety_lock("ceo").unwrap();
        assert_eq!(e.status(), EngineStatus::Running);
    }

    #[tokio::test]
    async fn intake_filters_disabled_venues_and_thin_spreads() {
        let e = engine_with(EngineConfig {
            initial_capital: dec!(1000),
            max_drawdown_pct: 2.0,
            enabled_venues: vec!["AEMO".to_string()],
            max_position_size: dec!(100),
            max_open_positions: 5,
            min_profit_margin: 0.5,
            safety_lock_enabled: true,
            trade_fee: dec!(0.5),
        });

        // Target venue JEPX is not enabled.
        e.intake_opportunity(opportunity(50.0, 55.0));

        // Both enabled but spread below margin.
        let e2 = engine();
        let mut thin = opportunity(50.0, 55.0);
        thin.spread_percent = 0.4;
        e2.intake_opportunity(thin);

        // Queue should be empty in both engines: nothing to process.
        assert_eq!(e.report().total_trades, 0);
        assert_eq!(e2.report().total_trades, 0);
    }

    #[tokio::test]
    async fn preflight_rejects_bad_configs() {
        let mut bad_capital = engine().config.clone();
        bad_capital.initial_capital = Decimal::ZERO;
        let e = engine_with(bad_capital);
        assert!(matches!(
            e.preflight().await,
            Err(GridError::InvalidConfig(_))
        ));

        let mut no_lock = engine().config.clone();
        no_lock.safety_lock_enabled = false;
        let e = engine_with(no_lock);
        assert!(matches!(
            e.preflight().await,
            Err(GridError::InvalidConfig(_))
        ));

        let mut no_venues = engine().config.clone();
        no_venues.enabled_venues.clear();
        let e = engine_with(no_venues);
        assert!(e.preflight().await.is_err());
    }

    #[tokio::test]
    async fn quantity_capped_by_opportunity_volume() {
        let e = engine();
        let mut small = signal(50.0, 55.0);
        small.opportunity.max_volume = 1.0;
        e.process_signal(small).await;

        let log = e.trade_log();
        assert_eq!(log[0].quantity, dec!(1));
    }

    #[tokio::test]
    async fn win_rate_reflects_outcomes() {
        let e = engine();
        e.process_signal(signal(50.0, 55.0)).await;
        e.process_signal(signal(50.0, 55.0)).await;
        // Loser: small enough not to trip the drawdown lock.
        e.process_signal(signal(50.0, 49.9)).await;

        let report = e.report();
        assert_eq!(report.total_trades, 3);
        assert_eq!(report.winning_trades, 2);
        assert_eq!(report.losing_trades, 1);
        assert!((report.win_rate - 66.666).abs() < 0.1);
    }
}
