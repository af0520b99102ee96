pub mod adapters;
pub mod alerts;
pub mod api;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod grid;
pub mod killswitch;
pub mod resilience;
pub mod secrets;
pub mod settlement;
pub mod worker;
pub mod zkp;

pub use crate::config::AppConfig;
pub use crate::engine::{RiskShield, TradingEngine};
pub use crate::error::{GridError, Result};
pub use crate::events::EventBroadcaster;
pub use crate::grid::GridManager;
pub use crate::killswitch::KillSwitch;
pub use crate::settlement::SettlementTracker;
pub use crate::worker::WorkerPool;
pub use crate::zkp::ZkpGuard;
