use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
    Submitted,
    Confirming,
    Confirmed,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Submitted => "SUBMITTED",
            SettlementStatus::Confirming => "CONFIRMING",
            SettlementStatus::Confirmed => "CONFIRMED",
            SettlementStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SettlementType {
    Trade,
    Deposit,
    Withdraw,
    Fee,
}

/// An on-chain settlement record. Retained in the tracker's pending map
/// until it reaches CONFIRMED or FAILED; never dropped silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub id: String,
    pub trade_id: String,
    pub kind: SettlementType,
    pub amount: Decimal,
    pub currency: String,
    pub from_address: String,
    pub to_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    pub confirmations: u32,
    pub status: SettlementStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Settlement {
    pub fn new(
        trade_id: String,
        kind: SettlementType,
        amount: Decimal,
        from_address: String,
        to_address: String,
    ) -> Self {
        Self {
            id: format!("SETTLE-{}", Uuid::new_v4().simple()),
            trade_id,
            kind,
            amount,
            currency: "NXUSD".to_string(),
            from_address,
            to_address,
            tx_ref: None,
            block_number: None,
            confirmations: 0,
            status: SettlementStatus::Pending,
            created_at: Utc::now(),
            confirmed_at: None,
            error: None,
        }
    }
}
