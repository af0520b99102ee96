use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::engine::{RiskShield, TradingEngine};
use crate::events::EventBroadcaster;
use crate::grid::GridManager;
use crate::killswitch::KillSwitch;
use crate::settlement::SettlementTracker;
use crate::zkp::ZkpGuard;

/// Shared handles behind the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub killswitch: Arc<KillSwitch>,
    pub risk: Arc<RiskShield>,
    pub engine: Arc<TradingEngine>,
    pub grid: Arc<GridManager>,
    pub settlement: Arc<SettlementTracker>,
    pub zkp: Arc<ZkpGuard>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub auth_token: String,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
