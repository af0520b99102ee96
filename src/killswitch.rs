//! Global lockdown state machine gating operations platform-wide.
//!
//! The level is a single process-wide atomic; every component that must
//! consult it holds an `Arc<KillSwitch>` and calls [`KillSwitch::check`].
//! Escalation is monotone except for operator-initiated de-escalation,
//! and auto-recovery applies only to auto-triggered escalations below
//! LOCKDOWN.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::KillSwitchConfig;
use crate::error::{GridError, Result};

/// Ordered lockdown levels, 0..5.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockdownLevel {
    Normal = 0,
    Caution = 1,
    Warning = 2,
    Critical = 3,
    Lockdown = 4,
    Emergency = 5,
}

impl LockdownLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LockdownLevel::Normal),
            1 => Some(LockdownLevel::Caution),
            2 => Some(LockdownLevel::Warning),
            3 => Some(LockdownLevel::Critical),
            4 => Some(LockdownLevel::Lockdown),
            5 => Some(LockdownLevel::Emergency),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockdownLevel::Normal => "NORMAL",
            LockdownLevel::Caution => "CAUTION",
            LockdownLevel::Warning => "WARNING",
            LockdownLevel::Critical => "CRITICAL",
            LockdownLevel::Lockdown => "LOCKDOWN",
            LockdownLevel::Emergency => "EMERGENCY",
        }
    }
}

impl std::fmt::Display for LockdownLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    Manual,
    DailyLoss,
    WeeklyLoss,
    SecurityBreach,
    ApiAnomaly,
    ZkpFraud,
    CircuitBreaker,
    PriceSpike,
    SystemOverload,
}

impl Trigger {
    /// Security-relevant triggers bypass the escalation rate limit.
    fn bypasses_rate_limit(&self) -> bool {
        matches!(self, Trigger::SecurityBreach | Trigger::ZkpFraud)
    }
}

/// Measurement accompanying an automatic trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerValue {
    Amount(Decimal),
    Percent(f64),
    Count(u32),
    Severity(u8),
}

/// Roles authorized to drive the kill switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Ceo,
    Admin,
    Trader,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Ceo => "CEO",
            Role::Admin => "ADMIN",
            Role::Trader => "TRADER",
            Role::System => "SYSTEM",
        }
    }
}

/// Operations gated by the capability matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    NewTrade,
    ModifyOrder,
    ClosePosition,
    Withdraw,
    ApiRead,
    Settle,
}

/// What each level permits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelCapabilities {
    pub allow_new_trades: bool,
    pub allow_order_modify: bool,
    pub allow_position_close: bool,
    pub allow_withdrawals: bool,
    pub allow_api_read: bool,
    pub allow_settlements: bool,
    /// 100 = full position limit, 0 = none
    pub position_limit_percent: f64,
    /// Maximum order size in MWh
    pub max_order_size: f64,
}

/// Fixed capability matrix; values are part of the platform contract.
pub fn capabilities_for(level: LockdownLevel) -> LevelCapabilities {
    match level {
        LockdownLevel::Normal => LevelCapabilities {
            allow_new_trades: true,
            allow_order_modify: true,
            allow_position_close: true,
            allow_withdrawals: true,
            allow_api_read: true,
            allow_settlements: true,
            position_limit_percent: 100.0,
            max_order_size: 1000.0,
        },
        LockdownLevel::Caution => LevelCapabilities {
            allow_new_trades: true,
            allow_order_modify: true,
            allow_position_close: true,
            allow_withdrawals: true,
            allow_api_read: true,
            allow_settlements: true,
            position_limit_percent: 50.0,
            max_order_size: 500.0,
        },
        LockdownLevel::Warning => LevelCapabilities {
            allow_new_trades: false,
            allow_order_modify: true,
            allow_position_close: true,
            allow_withdrawals: true,
            allow_api_read: true,
            allow_settlements: true,
            position_limit_percent: 25.0,
            max_order_size: 0.0,
        },
        LockdownLevel::Critical => LevelCapabilities {
            allow_new_trades: false,
            allow_order_modify: false,
            allow_position_close: true,
            allow_withdrawals: true,
            allow_api_read: true,
            allow_settlements: true,
            position_limit_percent: 0.0,
            max_order_size: 0.0,
        },
        LockdownLevel::Lockdown => LevelCapabilities {
            allow_new_trades: false,
            allow_order_modify: false,
            allow_position_close: false,
            allow_withdrawals: false,
            allow_api_read: true,
            allow_settlements: false,
            position_limit_percent: 0.0,
            max_order_size: 0.0,
        },
        LockdownLevel::Emergency => LevelCapabilities {
            allow_new_trades: false,
            allow_order_modify: false,
            allow_position_close: false,
            allow_withdrawals: false,
            allow_api_read: false,
            allow_settlements: false,
            position_limit_percent: 0.0,
            max_order_size: 0.0,
        },
    }
}

/// Record of a level change, appended to history and pushed to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockdownEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub prev_level: LockdownLevel,
    pub new_level: LockdownLevel,
    pub trigger: Trigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_value: Option<TriggerValue>,
    pub initiated_by: String,
    pub role: Role,
    pub reason: String,
    pub auto_recover: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recover_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchStatus {
    pub level: LockdownLevel,
    pub capabilities: LevelCapabilities,
    pub is_lockdown: bool,
    pub is_critical: bool,
    pub timestamp: DateTime<Utc>,
}

pub struct KillSwitch {
    config: KillSwitchConfig,
    level: AtomicU8,
    history: Mutex<VecDeque<LockdownEvent>>,
    event_tx: mpsc::Sender<LockdownEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<LockdownEvent>>>,
    last_escalation: Mutex<Option<DateTime<Utc>>>,
    recover_task: Mutex<Option<JoinHandle<()>>>,
    auto_recover_delay: Duration,
    dropped_events: AtomicU64,
}

impl KillSwitch {
    pub fn new(config: KillSwitchConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(16));
        let auto_recover_delay = Duration::from_secs(config.auto_recover_mins * 60);
        Self {
            config,
            level: AtomicU8::new(LockdownLevel::Normal as u8),
            history: Mutex::new(VecDeque::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            last_escalation: Mutex::new(None),
            recover_task: Mutex::new(None),
            auto_recover_delay,
            dropped_events: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    fn with_recover_delay(config: KillSwitchConfig, delay: Duration) -> Self {
        let mut ks = Self::new(config);
        ks.auto_recover_delay = delay;
        ks
    }

    pub fn level(&self) -> LockdownLevel {
        LockdownLevel::from_u8(self.level.load(Ordering::SeqCst))
            .unwrap_or(LockdownLevel::Emergency)
    }

    pub fn capabilities(&self) -> LevelCapabilities {
        capabilities_for(self.level())
    }

    /// Whether the given operation is currently permitted.
    pub fn check(&self, capability: Capability) -> bool {
        let caps = self.capabilities();
        match capability {
            Capability::NewTrade => caps.allow_new_trades,
            Capability::ModifyOrder => caps.allow_order_modify,
            Capability::ClosePosition => caps.allow_position_close,
            Capability::Withdraw => caps.allow_withdrawals,
            Capability::ApiRead => caps.allow_api_read,
            Capability::Settle => caps.allow_settlements,
        }
    }

    /// Operator-initiated level change, subject to the role matrix.
    pub fn set_level(
        self: &Arc<Self>,
        new_level: LockdownLevel,
        user: &str,
        role: Role,
        reason: &str,
    ) -> Result<()> {
        let current = self.level();

        if !can_set_level(role, current, new_level) {
            return Err(GridError::InsufficientPrivilege);
        }
        if current == new_level {
            return Err(GridError::AlreadyAtLevel);
        }

        self.execute_change(new_level, Trigger::Manual, None, user, role, reason, false);
        Ok(())
    }

    /// Automatic escalation. A no-op when the trigger maps at or below
    /// the current level, or when rate-limited.
    pub fn escalate(
        self: &Arc<Self>,
        trigger: Trigger,
        value: TriggerValue,
        reason: &str,
    ) -> Result<()> {
        let current = self.level();
        let Some(new_level) = self.escalation_target(trigger, &value) else {
            return Ok(());
        };
        if new_level <= current {
            return Ok(());
        }

        if !trigger.bypasses_rate_limit() {
            let last = self.last_escalation.lock().expect("lock poisoned");
            if let Some(at) = *last {
                if Utc::now() - at < chrono::Duration::minutes(1) {
                    return Ok(());
                }
            }
        }

        self.execute_change(
            new_level,
            trigger,
            Some(value),
            "SYSTEM",
            Role::System,
            reason,
            true,
        );
        Ok(())
    }

    /// Operator-initiated de-escalation. CRITICAL and above require CEO.
    pub fn deescalate(
        self: &Arc<Self>,
        target: LockdownLevel,
        user: &str,
        role: Role,
        reason: &str,
    ) -> Result<()> {
        let current = self.level();

        if target >= current {
            return Err(GridError::AlreadyAtLevel);
        }
        if current >= LockdownLevel::Critical && role != Role::Ceo {
            return Err(GridError::CannotDowngrade);
        }
        if !can_set_level(role, current, target) {
            return Err(GridError::InsufficientPrivilege);
        }

        self.execute_change(target, Trigger::Manual, None, user, role, reason, false);
        Ok(())
    }

    /// Immediate jump to EMERGENCY; CEO or SYSTEM only.
    pub fn emergency_shutdown(self: &Arc<Self>, user: &str, role: Role, reason: &str) -> Result<()> {
        if role != Role::Ceo && role != Role::System {
            return Err(GridError::InsufficientPrivilege);
        }
        self.execute_change(
            LockdownLevel::Emergency,
            Trigger::SecurityBreach,
            None,
            user,
            role,
            reason,
            false,
        );
        error!(initiated_by = user, reason, "EMERGENCY SHUTDOWN ACTIVATED");
        Ok(())
    }

    fn execute_change(
        self: &Arc<Self>,
        new_level: LockdownLevel,
        trigger: Trigger,
        trigger_value: Option<TriggerValue>,
        user: &str,
        role: Role,
        reason: &str,
        auto_recover: bool,
    ) {
        // History lock spans the atomic store so adjacent events always
        // chain: each event's prev_level equals the previous new_level.
        let mut history = self.history.lock().expect("lock poisoned");

        let prev = self.level();
        self.level.store(new_level as u8, Ordering::SeqCst);
        *self.last_escalation.lock().expect("lock poisoned") = Some(Utc::now());

        let recover_delay = chrono::Duration::from_std(self.auto_recover_delay)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let recover_at = if auto_recover && new_level < LockdownLevel::Lockdown {
            Some(Utc::now() + recover_delay)
        } else {
            None
        };

        let event = LockdownEvent {
            id: format!("LDE-{}", Uuid::new_v4().simple()),
            timestamp: Utc::now(),
            prev_level: prev,
            new_level,
            trigger,
            trigger_value,
            initiated_by: user.to_string(),
            role,
            reason: reason.to_string(),
            auto_recover,
            recover_at,
        };

        history.push_back(event.clone());
        while history.len() > self.config.event_buffer {
            history.pop_front();
        }
        drop(history);

        warn!(
            prev = %prev,
            new = %new_level,
            trigger = ?trigger,
            initiated_by = user,
            reason,
            "LOCKDOWN LEVEL CHANGED"
        );

        if self.event_tx.try_send(event).is_err() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            warn!("lockdown event channel full, dropping event");
        }

        if recover_at.is_some() {
            self.schedule_recover(prev, new_level);
        }
    }

    /// One-shot recovery back to `prior` after the configured delay, iff
    /// the level is still the one this escalation set.
    fn schedule_recover(self: &Arc<Self>, prior: LockdownLevel, escalated: LockdownLevel) {
        let ks = Arc::downgrade(self);
        let delay = self.auto_recover_delay;

        let mut task = self.recover_task.lock().expect("lock poisoned");
        if let Some(existing) = task.take() {
            existing.abort();
        }
        *task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(ks) = ks.upgrade() else { return };
            if ks.level() == escalated && escalated < LockdownLevel::Lockdown {
                ks.execute_change(
                    prior,
                    Trigger::Manual,
                    None,
                    "SYSTEM",
                    Role::System,
                    "Auto-recovery",
                    false,
                );
                info!(to = %prior, "auto-recovery executed");
            }
        }));
    }

    fn escalation_target(
        &self,
        trigger: Trigger,
        value: &TriggerValue,
    ) -> Option<LockdownLevel> {
        let cfg = &self.config;
        match (trigger, value) {
            (Trigger::DailyLoss, TriggerValue::Amount(loss)) => {
                if *loss >= cfg.daily_loss_lockdown {
                    Some(LockdownLevel::Lockdown)
                } else if *loss >= cfg.daily_loss_critical {
                    Some(LockdownLevel::Critical)
                } else if *loss >= cfg.daily_loss_warning {
                    Some(LockdownLevel::Warning)
                } else if *loss >= cfg.daily_loss_caution {
                    Some(LockdownLevel::Caution)
                } else {
                    None
                }
            }
            (Trigger::WeeklyLoss, TriggerValue::Amount(loss)) => {
                if *loss >= cfg.weekly_loss_emergency {
                    Some(LockdownLevel::Emergency)
                } else if *loss >= cfg.weekly_loss_lockdown {
                    Some(LockdownLevel::Lockdown)
                } else {
                    None
                }
            }
            (Trigger::SecurityBreach, _) => Some(LockdownLevel::Emergency),
            (Trigger::ZkpFraud, TriggerValue::Count(count)) => {
                if *count >= cfg.zkp_fraud_count {
                    Some(LockdownLevel::Lockdown)
                } else {
                    Some(LockdownLevel::Critical)
                }
            }
            (Trigger::ApiAnomaly, TriggerValue::Percent(rate)) => {
                if *rate >= cfg.api_error_rate {
                    Some(LockdownLevel::Warning)
                } else {
                    None
                }
            }
            (Trigger::PriceSpike, TriggerValue::Percent(spike)) => {
                if *spike >= cfg.price_spike_percent {
                    Some(LockdownLevel::Critical)
                } else if *spike >= 100.0 {
                    Some(LockdownLevel::Warning)
                } else {
                    None
                }
            }
            (Trigger::SystemOverload, TriggerValue::Percent(cpu)) => {
                if *cpu >= cfg.cpu_usage_percent {
                    Some(LockdownLevel::Warning)
                } else {
                    None
                }
            }
            (Trigger::CircuitBreaker, TriggerValue::Severity(severity)) => {
                LockdownLevel::from_u8((*severity).clamp(1, 3))
            }
            _ => None,
        }
    }

    /// Take the event stream; only the first caller receives it.
    pub fn events(&self) -> Option<mpsc::Receiver<LockdownEvent>> {
        self.event_rx.lock().expect("lock poisoned").take()
    }

    /// Most recent events, newest last.
    pub fn history(&self, limit: usize) -> Vec<LockdownEvent> {
        let history = self.history.lock().expect("lock poisoned");
        let skip = history.len().saturating_sub(limit.max(1));
        history.iter().skip(skip).cloned().collect()
    }

    pub fn status(&self) -> KillSwitchStatus {
        let level = self.level();
        KillSwitchStatus {
            level,
            capabilities: capabilities_for(level),
            is_lockdown: level >= LockdownLevel::Lockdown,
            is_critical: level >= LockdownLevel::Critical,
            timestamp: Utc::now(),
        }
    }
}

/// Authorization matrix for operator-initiated transitions.
fn can_set_level(role: Role, current: LockdownLevel, new_level: LockdownLevel) -> bool {
    match role {
        Role::Ceo => true,
        Role::Admin => {
            if new_level > current {
                new_level <= LockdownLevel::Critical
            } else {
                current <= LockdownLevel::Warning
            }
        }
        Role::Trader => new_level == LockdownLevel::Caution && new_level > current,
        Role::System => new_level > current,
    }
}
