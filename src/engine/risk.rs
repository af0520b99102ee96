//! Per-trade admission control, orthogonal to the kill switch.
//!
//! The shield owns drawdown tracking and the daily/weekly counters. Once
//! the critical drawdown threshold is crossed the lock latches; only an
//! operator reset releases it.

use chrono::{DateTime, Datelike, Utc, Weekday};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::domain::{TradeResult, TradeSignal, TradeStatus, VenueId};
use crate::error::RiskRejection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskStatus {
    Normal,
    Caution,
    Danger,
    Locked,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskWarning {
    pub kind: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskShieldStatus {
    pub status: RiskStatus,
    pub current_mdd: f64,
    pub mdd_warning: f64,
    pub mdd_critical: f64,
    pub daily_pnl: Decimal,
    pub weekly_pnl: Decimal,
    pub max_daily_loss: Decimal,
    pub max_weekly_loss: Decimal,
    pub open_positions: usize,
    pub max_open_positions: usize,
    pub daily_trades: u32,
    pub max_daily_trades: u32,
    pub high_water_mark: Decimal,
    pub last_update: DateTime<Utc>,
}

struct ShieldState {
    status: RiskStatus,
    current_mdd: f64,
    daily_pnl: Decimal,
    weekly_pnl: Decimal,
    open_positions: usize,
    daily_trades: u32,
    venue_exposure: HashMap<VenueId, Decimal>,
    high_water_mark: Decimal,
    last_reset_daily: DateTime<Utc>,
    last_reset_weekly: DateTime<Utc>,
}

pub struct RiskShield {
    config: RiskConfig,
    initial_capital: Decimal,
    state: Mutex<ShieldState>,
    warning_tx: mpsc::Sender<RiskWarning>,
    warning_rx: Mutex<Option<mpsc::Receiver<RiskWarning>>>,
}

impl RiskShield {
    pub fn new(config: RiskConfig, initial_capital: Decimal) -> Self {
        let (warning_tx, warning_rx) = mpsc::channel(100);
        Self {
            config,
            initial_capital,
            state: Mutex::new(ShieldState {
                status: RiskStatus::Normal,
                current_mdd: 0.0,
                daily_pnl: Decimal::ZERO,
                weekly_pnl: Decimal::ZERO,
                open_positions: 0,
                daily_trades: 0,
                venue_exposure: HashMap::new(),
                high_water_mark: initial_capital,
                last_reset_daily: Utc::now(),
                last_reset_weekly: Utc::now(),
            }),
            warning_tx,
            warning_rx: Mutex::new(Some(warning_rx)),
        }
    }

    /// Warning stream; taken once by the engine's subscription.
    pub fn warnings(&self) -> Option<mpsc::Receiver<RiskWarning>> {
        self.warning_rx.lock().expect("lock poisoned").take()
    }

    /// Run every check in order; the first failure rejects the trade.
    pub fn allow_trade(&self, signal: &TradeSignal) -> Result<(), RiskRejection> {
        let state = self.state.lock().expect("lock poisoned");

        if state.status == RiskStatus::Locked {
            return Err(RiskRejection::SafetyLocked);
        }

        if state.current_mdd >= self.config.mdd_critical_pct {
            return Err(RiskRejection::DrawdownLimit {
                current: state.current_mdd,
                limit: self.config.mdd_critical_pct,
            });
        }

        if state.daily_pnl.is_sign_negative()
            && state.daily_pnl.abs() >= self.config.max_daily_loss
        {
            return Err(RiskRejection::DailyLossLimit {
                loss: state.daily_pnl.abs(),
            });
        }

        if state.weekly_pnl.is_sign_negative()
            && state.weekly_pnl.abs() >= self.config.max_weekly_loss
        {
            return Err(RiskRejection::WeeklyLossLimit {
                loss: state.weekly_pnl.abs(),
            });
        }

        if state.open_positions >= self.config.max_open_positions {
            return Err(RiskRejection::PositionLimit {
                open: state.open_positions,
                max: self.config.max_open_positions,
            });
        }

        if state.daily_trades >= self.config.max_daily_trades {
            return Err(RiskRejection::DailyTradeLimit {
                count: state.daily_trades,
                max: self.config.max_daily_trades,
            });
        }

        let exposure = state
            .venue_exposure
            .get(&signal.venue)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let exposure_pct = pct_of(exposure, self.initial_capital);
        if exposure_pct >= self.config.max_venue_exposure_pct {
            return Err(RiskRejection::VenueExposure {
                venue: signal.venue.to_string(),
                exposure_pct,
            });
        }

        if self.config.block_weekends {
            let weekday = Utc::now().weekday();
            if weekday == Weekday::Sat || weekday == Weekday::Sun {
                return Err(RiskRejection::WeekendBlocked);
            }
        }

        Ok(())
    }

    /// Recompute drawdown from equity; emits warnings on threshold
    /// crossings and latches the lock at critical.
    pub fn update_equity(&self, current_equity: Decimal, high_water_mark: Decimal) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.high_water_mark = high_water_mark;

        if high_water_mark > Decimal::ZERO {
            let drawdown = high_water_mark - current_equity;
            state.current_mdd = pct_of(drawdown, high_water_mark).max(0.0);
        }

        let prev = state.status;
        let mdd = state.current_mdd;

        if mdd >= self.config.mdd_critical_pct {
            if prev != RiskStatus::Locked {
                state.status = RiskStatus::Locked;
                warn!(
                    mdd,
                    limit = self.config.mdd_critical_pct,
                    "SAFETY LOCK ACTIVATED"
                );
                self.emit_warning(RiskWarning {
                    kind: "SAFETY_LOCK".to_string(),
                    message: format!(
                        "drawdown {:.2}% exceeded limit {:.2}%",
                        mdd, self.config.mdd_critical_pct
                    ),
                    value: mdd,
                    threshold: self.config.mdd_critical_pct,
                    timestamp: Utc::now(),
                });
            }
        } else if state.status == RiskStatus::Locked {
            // Latched: recovery of equity alone never unlocks.
        } else if mdd >= self.config.mdd_warning_pct {
            state.status = RiskStatus::Danger;
            if prev != RiskStatus::Danger {
                self.emit_warning(RiskWarning {
                    kind: "MDD_WARNING".to_string(),
                    message: "approaching drawdown limit".to_string(),
                    value: mdd,
                    threshold: self.config.mdd_critical_pct,
                    timestamp: Utc::now(),
                });
            }
        } else if mdd >= self.config.mdd_warning_pct * 0.75 {
            state.status = RiskStatus::Caution;
        } else {
            state.status = RiskStatus::Normal;
        }
    }

    /// Fold a completed trade into the counters.
    pub fn record_trade(&self, result: &TradeResult) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.daily_pnl += result.net_pnl;
        state.weekly_pnl += result.net_pnl;
        state.daily_trades += 1;

        if result.status == TradeStatus::Filled {
            let exposure = state
                .venue_exposure
                .entry(result.signal.venue)
                .or_insert(Decimal::ZERO);
            *exposure += result.notional();
        }
    }

    pub fn position_opened(&self) {
        self.state.lock().expect("lock poisoned").open_positions += 1;
    }

    pub fn position_closed(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.open_positions = state.open_positions.saturating_sub(1);
    }

    /// Operator reset of the latched safety lock.
    pub fn unlock(&self, operator: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.status == RiskStatus::Locked {
            state.status = RiskStatus::Normal;
            info!(operator, "safety lock released");
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().expect("lock poisoned").status == RiskStatus::Locked
    }

    pub fn reset_daily(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.daily_pnl = Decimal::ZERO;
        state.daily_trades = 0;
        state.last_reset_daily = Utc::now();
    }

    pub fn reset_weekly(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.weekly_pnl = Decimal::ZERO;
        state.last_reset_weekly = Utc::now();
    }

    /// Counter reset loop: daily at midnight, weekly on Monday.
    pub async fn run_reset_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    let now = Utc::now();
                    let (daily, weekly) = {
                        let state = self.state.lock().expect("lock poisoned");
                        (
                            now.date_naive() != state.last_reset_daily.date_naive(),
                            now.weekday() == Weekday::Mon
                                && state.last_reset_weekly.weekday() != Weekday::Mon,
                        )
                    };
                    if daily {
                        self.reset_daily();
                    }
                    if weekly {
                        self.reset_weekly();
                    }
                }
            }
        }
    }

    pub fn status(&self) -> RiskShieldStatus {
        let state = self.state.lock().expect("lock poisoned");
        RiskShieldStatus {
            status: state.status,
            current_mdd: state.current_mdd,
            mdd_warning: self.config.mdd_warning_pct,
            mdd_critical: self.config.mdd_critical_pct,
            daily_pnl: state.daily_pnl,
            weekly_pnl: state.weekly_pnl,
            max_daily_loss: self.config.max_daily_loss,
            max_weekly_loss: self.config.max_weekly_loss,
            open_positions: state.open_positions,
            max_open_positions: self.config.max_open_positions,
            daily_trades: state.daily_trades,
            max_daily_trades: self.config.max_daily_trades,
            high_water_mark: state.high_water_mark,
            last_update: Utc::now(),
        }
    }

    fn emit_warning(&self, warning: RiskWarning) {
        if self.warning_tx.try_send(warning).is_err() {
            warn!("risk warning channel full, dropping warning");
        }
    }
}

fn pct_of(part: Decimal, whole: Decimal) -> f64 {
    if whole.is_zero() {
        return 0.0;
    }
    ((part / whole) * Decimal::ONE_HUNDRED)
        .to_f64()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArbitrageOpportunity, SignalKind};
    use rust_decimal_macros::dec;

    fn config() -> RiskConfig {
        RiskConfig {
            block_weekends: false,
            ..RiskConfig::default()
        }
    }

    fn signal(venue: VenueId) -> TradeSignal {
        let opportunity = ArbitrageOpportunity {
            id: "opp-1".to_string(),
            source_venue: VenueId::Aemo,
            source_region: "NSW1".to_string(),
            target_venue: venue,
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
            valid_until: Utc::now() + chrono::Duration::seconds(30),
        };
        TradeSignal {
            kind: SignalKind::Arbitrage,
            venue,
            opportunity,
            created_at: Utc::now(),
        }
    }

    fn filled_trade(venue: VenueId, net_pnl: Decimal) -> TradeResult {
        TradeResult {
            id: "t-1".to_string(),
            signal: signal(venue),
            status: TradeStatus::Filled,
            executed_at: Utc::now(),
            entry_price: dec!(50),
            exit_price: dec!(55),
            quantity: dec!(2),
            gross_pnl: net_pnl + dec!(0.5),
            fees: dec!(0.5),
            net_pnl,
            settlement_ref: None,
        }
    }

    #[test]
    fn allows_trade_in_normal_state() {
        let shield = RiskShield::new(config(), dec!(1000));
        assert!(shield.allow_trade(&signal(VenueId::Jepx)).is_ok());
    }

    #[test]
    fn drawdown_sequence_latches_safety_lock() {
        // Start equity 1000, critical drawdown 2%. PnL -5, -10, -10
        // leaves equity 975: drawdown 2.5% => locked.
        let shield = RiskShield::new(config(), dec!(1000));
        let mut equity = dec!(1000);
        for pnl in [dec!(-5), dec!(-10), dec!(-10)] {
            equity += pnl;
            shield.update_equity(equity, dec!(1000));
        }

        assert!(shield.is_locked());
        let status = shield.status();
        assert!((status.current_mdd - 2.5).abs() < 1e-9);
        assert!(matches!(
            shield.allow_trade(&signal(VenueId::Jepx)),
            Err(RiskRejection::SafetyLocked)
        ));

        // Equity recovery alone must not unlock.
        shield.update_equity(dec!(1000), dec!(1000));
        assert!(shield.is_locked());

        shield.unlock("ceo");
        assert!(!shield.is_locked());
    }

    #[test]
    fn warning_emitted_on_threshold_cross() {
        let shield = RiskShield::new(config(), dec!(1000));
        let mut warnings = shield.warnings().unwrap();

        // 1.6% drawdown crosses the 1.5% warning threshold.
        shield.update_equity(dec!(984), dec!(1000));
        let warning = warnings.try_recv().unwrap();
        assert_eq!(warning.kind, "MDD_WARNING");
    }

    #[test]
    fn daily_loss_limit_rejects() {
        let shield = RiskShield::new(config(), dec!(1000));
        shield.record_trade(&filled_trade(VenueId::Jepx, dec!(-20)));
        assert!(matches!(
            shield.allow_trade(&signal(VenueId::Jepx)),
            Err(RiskRejection::DailyLossLimit { .. })
        ));

        shield.reset_daily();
        // Weekly still carries the loss but is under its own limit.
        assert!(shield.allow_trade(&signal(VenueId::Jepx)).is_ok());
    }

    #[test]
    fn weekly_loss_limit_rejects_after_daily_reset() {
        let shield = RiskShield::new(config(), dec!(1000));
        for _ in 0..3 {
            shield.record_trade(&filled_trade(VenueId::Jepx, dec!(-17)));
            shield.reset_daily();
        }
        assert!(matches!(
            shield.allow_trade(&signal(VenueId::Jepx)),
            Err(RiskRejection::WeeklyLossLimit { .. })
        ));
    }

    #[test]
    fn position_limit_rejects() {
        let shield = RiskShield::new(config(), dec!(1000));
        for _ in 0..5 {
            shield.position_opened();
        }
        assert!(matches!(
            shield.allow_trade(&signal(VenueId::Jepx)),
            Err(RiskRejection::PositionLimit { open: 5, max: 5 })
        ));
    }

    #[test]
    fn venue_exposure_limit_rejects() {
        let shield = RiskShield::new(config(), dec!(1000));
        // One filled trade of notional 100 at 50% limit on capital 1000
        // leaves room; push exposure past 500.
        for _ in 0..5 {
            shield.record_trade(&filled_trade(VenueId::Jepx, dec!(1)));
        }
        // 5 trades * 100 notional = 500 = 50% of capital.
        assert!(matches!(
            shield.allow_trade(&signal(VenueId::Jepx)),
            Err(RiskRejection::VenueExposure { .. })
        ));
        // Other venues are unaffected.
        assert!(shield.allow_trade(&signal(VenueId::Aemo)).is_ok());
    }

    #[test]
    fn daily_trade_limit_rejects() {
        let mut cfg = config();
        cfg.max_daily_trades = 2;
        let shield = RiskShield::new(cfg, dec!(1000));
        shield.record_trade(&filled_trade(VenueId::Aemo, dec!(0.1)));
        shield.record_trade(&filled_trade(VenueId::Aemo, dec!(0.1)));
        assert!(matches!(
            shield.allow_trade(&signal(VenueId::Aemo)),
            Err(RiskRejection::DailyTradeLimit { .. })
        ));
    }
}
