use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::market::VenueId;
use crate::error::{GridError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Accepted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// An order destined for one venue. `participant_id` identifies the
/// trading entity to the venue (DUID for AEMO, member id for JEPX).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrder {
    pub client_order_id: String,
    pub venue: VenueId,
    pub region: String,
    pub participant_id: String,
    pub side: OrderSide,
    /// Limit price in the venue's local currency per MWh
    pub price: Decimal,
    /// Quantity in MWh
    pub quantity: Decimal,
    /// Venue trading period (e.g. 1-48 for 30-minute products)
    pub period: u32,
    pub submitted_at: DateTime<Utc>,
}

impl VenueOrder {
    /// Local validation run before any dispatch to the venue. Bounds on
    /// price and period are venue-defined and passed in by the adapter.
    pub fn validate(&self, min_price: Decimal, max_price: Decimal, max_period: u32) -> Result<()> {
        if self.participant_id.is_empty() {
            return Err(GridError::OrderValidation(
                "participant id is required".to_string(),
            ));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(GridError::OrderValidation(format!(
                "quantity must be > 0, got {}",
                self.quantity
            )));
        }
        if self.price < min_price || self.price > max_price {
            return Err(GridError::OrderValidation(format!(
                "price {} outside venue bounds [{}, {}]",
                self.price, min_price, max_price
            )));
        }
        if self.period == 0 || self.period > max_period {
            return Err(GridError::OrderValidation(format!(
                "period {} outside venue bounds [1, {}]",
                self.period, max_period
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order() -> VenueOrder {
        VenueOrder {
            client_order_id: "ord-1".to_string(),
            venue: VenueId::Jepx,
            region: "TOKYO".to_string(),
            participant_id: "F9-TRADING".to_string(),
            side: OrderSide::Buy,
            price: dec!(12.5),
            quantity: dec!(10),
            period: 24,
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn valid_order_passes() {
        assert!(order().validate(dec!(0.01), dec!(999), 48).is_ok());
    }

    #[test]
    fn rejects_zero_quantity() {
        let mut o = order();
        o.quantity = Decimal::ZERO;
        assert!(matches!(
            o.validate(dec!(0.01), dec!(999), 48),
            Err(GridError::OrderValidation(_))
        ));
    }

    #[test]
    fn rejects_missing_identity() {
        let mut o = order();
        o.participant_id.clear();
        assert!(o.validate(dec!(0.01), dec!(999), 48).is_err());
    }

    #[test]
    fn rejects_out_of_band_period() {
        let mut o = order();
        o.period = 49;
        assert!(o.validate(dec!(0.01), dec!(999), 48).is_err());
    }
}
