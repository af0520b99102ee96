use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Categories an observer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NetProfit,
    MarketPrice,
    Position,
    Arbitrage,
    RiskAlert,
    Trade,
    Settlement,
    SystemStatus,
    Heartbeat,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NetProfit => "net_profit",
            EventKind::MarketPrice => "market_price",
            EventKind::Position => "position",
            EventKind::Arbitrage => "arbitrage",
            EventKind::RiskAlert => "risk_alert",
            EventKind::Trade => "trade",
            EventKind::Settlement => "settlement",
            EventKind::SystemStatus => "system_status",
            EventKind::Heartbeat => "heartbeat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "net_profit" => Some(EventKind::NetProfit),
            "market_price" => Some(EventKind::MarketPrice),
            "position" => Some(EventKind::Position),
            "arbitrage" => Some(EventKind::Arbitrage),
            "risk_alert" => Some(EventKind::RiskAlert),
            "trade" => Some(EventKind::Trade),
            "settlement" => Some(EventKind::Settlement),
            "system_status" => Some(EventKind::SystemStatus),
            "heartbeat" => Some(EventKind::Heartbeat),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope pushed to observers: `{id, type, data, timestamp, sequence}`.
/// The sequence is assigned globally by the broadcaster and is strictly
/// increasing across all event kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl PlatformEvent {
    /// Build an event with sequence 0; the broadcaster stamps the real one.
    pub fn new(kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            data,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        for kind in [
            EventKind::NetProfit,
            EventKind::MarketPrice,
            EventKind::Arbitrage,
            EventKind::Heartbeat,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("bogus"), None);
    }

    #[test]
    fn envelope_serializes_type_field() {
        let ev = PlatformEvent::new(EventKind::Trade, serde_json::json!({"pnl": 1.5}));
        let raw = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(raw["type"], "trade");
        assert!(raw["sequence"].is_u64());
    }
}
