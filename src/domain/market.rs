use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of a regional electricity market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VenueId {
    /// Australian Energy Market Operator (NEM)
    Aemo,
    /// Japan Electric Power Exchange
    Jepx,
    /// PJM Interconnection (US east)
    Pjm,
    /// European Power Exchange
    Epex,
}

impl VenueId {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueId::Aemo => "AEMO",
            VenueId::Jepx => "JEPX",
            VenueId::Pjm => "PJM",
            VenueId::Epex => "EPEX",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AEMO" => Some(VenueId::Aemo),
            "JEPX" => Some(VenueId::Jepx),
            "PJM" => Some(VenueId::Pjm),
            "EPEX" => Some(VenueId::Epex),
            _ => None,
        }
    }
}

impl std::fmt::Display for VenueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Venue-local trading session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    Open,
    Closed,
    PreOpen,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "OPEN",
            MarketStatus::Closed => "CLOSED",
            MarketStatus::PreOpen => "PRE_OPEN",
        }
    }
}

/// A price observed at one venue, in that venue's local currency.
/// Created by an adapter on receipt and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePrice {
    pub venue: VenueId,
    pub region: String,
    /// Price in the venue's local currency, per MWh
    pub local_price: f64,
    /// ISO currency code of `local_price`
    pub currency: String,
    /// Available volume in MWh
    pub volume: f64,
    pub status: MarketStatus,
    pub produced_at: DateTime<Utc>,
    /// Ingestion latency in milliseconds
    pub latency_ms: i64,
}

/// A venue price normalized to the reference currency (USD/MWh).
/// `currency` is always the reference currency; the original quote is
/// retained as `local_price`/`local_currency`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedPrice {
    pub venue: VenueId,
    pub region: String,
    /// Normalized price in USD/MWh
    pub price: f64,
    pub currency: String,
    pub local_price: f64,
    pub local_currency: String,
    pub volume: f64,
    pub status: MarketStatus,
    pub produced_at: DateTime<Utc>,
    pub latency_ms: i64,
}

impl UnifiedPrice {
    /// Age of the underlying observation.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.produced_at
    }

    /// Whether the price is still within the validity window.
    pub fn is_fresh(&self, validity: chrono::Duration) -> bool {
        self.age() <= validity
    }
}

/// Currency → USD conversion rates used by the grid manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRates {
    rates: HashMap<String, f64>,
    pub fetched_at: DateTime<Utc>,
}

impl ExchangeRates {
    /// Operator-configured seed rates, used until the first refresh.
    pub fn seeds() -> Self {
        let mut rates = HashMap::new();
        rates.insert("AUD".to_string(), 0.65);
        rates.insert("JPY".to_string(), 0.0067);
        rates.insert("KRW".to_string(), 0.00075);
        rates.insert("EUR".to_string(), 1.08);
        rates.insert("GBP".to_string(), 1.27);
        Self {
            rates,
            fetched_at: Utc::now(),
        }
    }

    pub fn from_rates(rates: HashMap<String, f64>) -> Self {
        Self {
            rates,
            fetched_at: Utc::now(),
        }
    }

    /// USD per unit of `currency`; unknown currencies pass through at 1.0.
    pub fn to_usd(&self, amount: f64, currency: &str) -> f64 {
        if currency == "USD" {
            return amount;
        }
        match self.rates.get(currency) {
            Some(rate) => amount * rate,
            None => amount,
        }
    }
}
