//! End-to-end pipeline: venue prices → grid manager → trading engine →
//! settlement tracker, with the event fan-out observing each stage.

use chrono::Utc;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use gridarb::alerts::{AlertDispatcher, MemoryAlerter};
use gridarb::config::{
    EngineConfig, EventsConfig, GridConfig, KillSwitchConfig, RiskConfig, SettlementConfig,
};
use gridarb::domain::{EventKind, MarketStatus, VenueId, VenuePrice};
use gridarb::engine::{EngineStatus, RiskShield, TradingEngine};
use gridarb::events::EventBroadcaster;
use gridarb::grid::GridManager;
use gridarb::killswitch::{KillSwitch, LockdownLevel, Role};
use gridarb::settlement::{SettlementTracker, SimulatedChainClient};

struct Harness {
    grid: Arc<GridManager>,
    engine: Arc<TradingEngine>,
    settlement: Arc<SettlementTracker>,
    killswitch: Arc<KillSwitch>,
    broadcaster: Arc<EventBroadcaster>,
}

async fn harness() -> Harness {
    let grid = Arc::new(GridManager::new(
        GridConfig {
            min_net_spread: 1.0,
            ..GridConfig::default()
        },
        None,
    ));
    grid.set_transfer_cost(VenueId::Aemo, VenueId::Jepx, 1.0);

    let killswitch = Arc::new(KillSwitch::new(KillSwitchConfig::default()));
    let risk = Arc::new(RiskShield::new(
        RiskConfig {
            block_weekends: false,
            ..RiskConfig::default()
        },
        dec!(1000),
    ));
    let settlement = Arc::new(SettlementTracker::new(
        SettlementConfig {
            confirmation_blocks: 12,
            wallet_address: "0xwallet".to_string(),
            settlement_address: "0xsettle".to_string(),
            ..SettlementConfig::default()
        },
        Arc::new(SimulatedChainClient::new(13)),
    ));
    settlement.start().await.unwrap();

    let broadcaster = Arc::new(EventBroadcaster::new(EventsConfig::default()));
    let alerts = AlertDispatcher::new(Arc::new(MemoryAlerter::default()), 60);

    let engine = Arc::new(TradingEngine::new(
        EngineConfig {
            initial_capital: dec!(1000),
            max_drawdown_pct: 2.0,
            enabled_venues: vec!["AEMO".to_string(), "JEPX".to_string()],
            max_position_size: dec!(100),
            max_open_positions: 5,
            min_profit_margin: 0.5,
            safety_lock_enabled: true,
            trade_fee: dec!(0.5),
        },
        killswitch.clone(),
        risk,
        settlement.clone(),
        broadcaster.clone(),
        alerts,
    ));

    let opportunities = grid.opportunities().unwrap();
    engine.start(opportunities).await.unwrap();

    Harness {
        grid,
        engine,
        settlement,
        killswitch,
        broadcaster,
    }
}

fn price(venue: VenueId, region: &str, usd: f64, volume: f64) -> VenuePrice {
    VenuePrice {
        venue,
        region: region.to_string(),
        local_price: usd,
        currency: "USD".to_string(),
        volume,
        status: MarketStatus::Open,
        produced_at: Utc::now(),
        latency_ms: 5,
    }
}

#[tokio::test]
async fn arbitrage_flows_from_prices_to_settlement() {
    let h = harness().await;
    let mut observer = h.broadcaster.subscribe(None);

    h.grid.process_price(price(VenueId::Aemo, "R1", 50.0, 100.0));
    h.grid.process_price(price(VenueId::Jepx, "R2", 55.0, 100.0));
    h.grid.scan_once();

    // Let the engine tasks drain the opportunity and signal queues.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = h.engine.report();
    assert_eq!(report.total_trades, 1);
    // quantity 2 at spread 5 minus the 0.5 fee
    assert_eq!(report.cumulative_pnl, dec!(9.5));
    assert_eq!(report.status, EngineStatus::Running);

    let log = h.engine.trade_log();
    assert_eq!(log.len(), 1);
    let settlement_id = log[0].settlement_ref.clone().expect("settlement dispatched");

    // The submission loop has promoted the record; one confirmation scan
    // is enough with the simulated chain past the block requirement.
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.settlement.scan_confirmations().await;
    let settled = h.settlement.get(&settlement_id).expect("record retained");
    assert_eq!(settled.status.as_str(), "CONFIRMED");

    // Observers saw the arbitrage and the trade, in sequence order.
    let mut kinds = Vec::new();
    let mut last_seq = 0;
    while let Ok(event) = observer.rx.try_recv() {
        assert!(event.sequence > last_seq);
        last_seq = event.sequence;
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::Arbitrage));
    assert!(kinds.contains(&EventKind::Trade));
    assert!(kinds.contains(&EventKind::NetProfit));
}

#[tokio::test]
async fn killswitch_blocks_new_trades_platform_wide() {
    let h = harness().await;
    h.killswitch
        .set_level(LockdownLevel::Warning, "ops", Role::Admin, "anomaly")
        .unwrap();

    h.grid.process_price(price(VenueId::Aemo, "R1", 50.0, 100.0));
    h.grid.process_price(price(VenueId::Jepx, "R2", 55.0, 100.0));
    h.grid.scan_once();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = h.engine.report();
    assert_eq!(report.total_trades, 0);
    assert_eq!(report.rejected_by_killswitch, 1);
    assert!(h.settlement.pending().is_empty());
}

#[tokio::test]
async fn below_threshold_spread_never_reaches_engine() {
    let h = harness().await;

    // Net spread 0.4 after the 1.0 transfer cost override: below the
    // configured minimum of 1.0, so no opportunity is emitted.
    h.grid.process_price(price(VenueId::Aemo, "R1", 50.0, 100.0));
    h.grid.process_price(price(VenueId::Jepx, "R2", 51.4, 100.0));
    h.grid.scan_once();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = h.engine.report();
    assert_eq!(report.total_trades, 0);
    assert_eq!(report.rejected_by_killswitch, 0);
    assert_eq!(report.rejected_by_risk, 0);
}

#[tokio::test]
async fn caution_level_still_allows_new_trades() {
    let h = harness().await;
    h.killswitch
        .set_level(LockdownLevel::Caution, "ops", Role::Admin, "reduce limits")
        .unwrap();

    h.grid.process_price(price(VenueId::Aemo, "R1", 50.0, 100.0));
    h.grid.process_price(price(VenueId::Jepx, "R2", 55.0, 100.0));
    h.grid.scan_once();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = h.engine.report();
    assert_eq!(report.total_trades, 1);
    assert_eq!(report.rejected_by_killswitch, 0);
}

#[tokio::test]
async fn stop_tears_down_cleanly() {
    let h = harness().await;

    h.grid.process_price(price(VenueId::Aemo, "R1", 50.0, 100.0));
    h.grid.process_price(price(VenueId::Jepx, "R2", 55.0, 100.0));
    h.grid.scan_once();
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.engine.stop().await.unwrap();
    h.grid.stop().await.unwrap();
    h.settlement.stop().await.unwrap();
    h.broadcaster.stop().await;

    assert_eq!(h.engine.status(), EngineStatus::Stopped);
    // A second stop on the broadcaster is a no-op.
    h.broadcaster.stop().await;
}
