use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::market::VenueId;

/// A matched (buy, sell) venue pair whose normalized spread, after
/// transfer cost and risk, exceeds configured thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub id: String,
    pub source_venue: VenueId,
    pub source_region: String,
    pub target_venue: VenueId,
    pub target_region: String,
    /// USD/MWh at the source (buy side)
    pub buy_price: f64,
    /// USD/MWh at the target (sell side)
    pub sell_price: f64,
    /// sell - buy, USD/MWh
    pub spread: f64,
    pub spread_percent: f64,
    /// Grid interconnection cost between the two venues, USD/MWh
    pub transfer_cost: f64,
    /// spread - transfer_cost
    pub net_spread: f64,
    /// min of the two available volumes, MWh
    pub max_volume: f64,
    /// net_spread * max_volume, USD
    pub estimated_profit: f64,
    /// 0..1, additive contributions from latency/status/venue/volume/age
    pub risk_score: f64,
    pub detected_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// What produced a trade signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    Arbitrage,
    Momentum,
    MeanReversion,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Arbitrage => "ARBITRAGE",
            SignalKind::Momentum => "MOMENTUM",
            SignalKind::MeanReversion => "MEAN_REVERSION",
        }
    }
}

/// An opportunity promoted into the engine's signal queue. Consumed once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub kind: SignalKind,
    pub venue: VenueId,
    pub opportunity: ArbitrageOpportunity,
    pub created_at: DateTime<Utc>,
}

impl TradeSignal {
    pub fn arbitrage(venue: VenueId, opportunity: ArbitrageOpportunity) -> Self {
        Self {
            kind: SignalKind::Arbitrage,
            venue,
            opportunity,
            created_at: Utc::now(),
        }
    }
}
