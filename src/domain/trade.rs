use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::opportunity::TradeSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Filled,
    Partial,
    Cancelled,
    Failed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "PENDING",
            TradeStatus::Filled => "FILLED",
            TradeStatus::Partial => "PARTIAL",
            TradeStatus::Cancelled => "CANCELLED",
            TradeStatus::Failed => "FAILED",
        }
    }
}

/// Outcome of an executed trade signal. Appended to the trade log and
/// drives the PnL update; filled trades are handed to settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub id: String,
    pub signal: TradeSignal,
    pub status: TradeStatus,
    pub executed_at: DateTime<Utc>,
    /// USD/MWh
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    /// MWh
    pub quantity: Decimal,
    pub gross_pnl: Decimal,
    pub fees: Decimal,
    pub net_pnl: Decimal,
    /// Settlement record id once dispatched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_ref: Option<String>,
}

impl TradeResult {
    /// Notional exposure this trade adds at entry.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }
}
