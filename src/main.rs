use clap::Parser;
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gridarb::adapters::{AemoAdapter, JepxAdapter};
use gridarb::alerts::{AlertDispatcher, AlertLevel, AlertSink, LogAlerter, WebhookAlerter};
use gridarb::api::{self, AppState};
use gridarb::config::AppConfig;
use gridarb::domain::EventKind;
use gridarb::engine::{RiskShield, TradingEngine};
use gridarb::events::EventBroadcaster;
use gridarb::grid::fx::{HttpRateSource, RateSource};
use gridarb::grid::GridManager;
use gridarb::killswitch::{KillSwitch, LockdownLevel, Trigger, TriggerValue};
use gridarb::secrets::{EnvSecretProvider, SecretCache};
use gridarb::settlement::{ChainClient, HttpChainClient, SettlementTracker, SimulatedChainClient};
use gridarb::zkp::ZkpGuard;

#[derive(Parser, Debug)]
#[command(name = "gridarb", about = "Cross-market energy arbitrage core")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "gridarb.toml")]
    config: PathBuf,

    /// Override the tracing filter (e.g. "debug,gridarb=trace")
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)?;
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("config error: {problem}");
        }
        anyhow::bail!("invalid configuration ({} problems)", problems.len());
    }

    let filter = cli.log.clone().unwrap_or_else(|| config.logging.filter.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(config = %cli.config.display(), "gridarb starting");

    // Shared infrastructure.
    let secrets = Arc::new(SecretCache::new(
        Box::new(EnvSecretProvider),
        std::time::Duration::from_secs(300),
    ));

    let sink: Arc<dyn AlertSink> = if config.alerts.webhook_url.is_empty() {
        Arc::new(LogAlerter)
    } else {
        Arc::new(WebhookAlerter::new(config.alerts.webhook_url.clone()))
    };
    let alerts = AlertDispatcher::new(sink, config.alerts.max_per_minute);

    let killswitch = Arc::new(KillSwitch::new(config.killswitch.clone()));
    let broadcaster = Arc::new(EventBroadcaster::new(config.events.clone()));
    broadcaster.start();

    let risk = Arc::new(RiskShield::new(
        config.risk.clone(),
        config.engine.initial_capital,
    ));

    let chain: Arc<dyn ChainClient> = if config.settlement.rpc_url.is_empty() {
        warn!("no settlement RPC configured, using simulated chain client");
        Arc::new(SimulatedChainClient::new(
            config.settlement.confirmation_blocks + 1,
        ))
    } else {
        // The wallet address lives with the signing key in the secret
        // provider; the config value is only a fallback.
        let wallet = match secrets.chain_credentials().await {
            Ok(creds) => creds.wallet_address,
            Err(_) => config.settlement.wallet_address.clone(),
        };
        Arc::new(HttpChainClient::new(config.settlement.rpc_url.clone(), wallet))
    };
    let settlement = Arc::new(SettlementTracker::new(config.settlement.clone(), chain));
    settlement.start().await?;

    let zkp = Arc::new(ZkpGuard::new(config.zkp.clone()));

    // Grid manager and venue adapters.
    let rate_source: Option<Arc<dyn RateSource>> = if config.grid.fx_endpoint.is_empty() {
        None
    } else {
        Some(Arc::new(HttpRateSource::new(config.grid.fx_endpoint.clone())))
    };
    let grid = Arc::new(GridManager::new(config.grid.clone(), rate_source));

    for venue in &config.engine.enabled_venues {
        match venue.to_ascii_uppercase().as_str() {
            "AEMO" => grid.register(Arc::new(AemoAdapter::new(
                config.aemo.clone(),
                secrets.clone(),
            )))?,
            "JEPX" => grid.register(Arc::new(JepxAdapter::new(
                config.jepx.clone(),
                secrets.clone(),
            )))?,
            other => warn!(venue = other, "no adapter available for enabled venue"),
        }
    }

    grid.start().await?;

    let engine = Arc::new(TradingEngine::new(
        config.engine.clone(),
        killswitch.clone(),
        risk.clone(),
        settlement.clone(),
        broadcaster.clone(),
        alerts.clone(),
    ));
    let opportunities = grid
        .opportunities()
        .expect("opportunity stream already taken");
    engine.start(opportunities).await?;

    // Root shutdown for the auxiliary tasks.
    let (shutdown_tx, _) = watch::channel(false);

    // Risk counter resets and nullifier retention cleanup.
    {
        let risk = risk.clone();
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { risk.run_reset_loop(rx).await });
    }
    {
        let zkp = zkp.clone();
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { zkp.run_cleanup(rx).await });
    }

    // Market data fan-out to observers.
    if let Some(mut unified) = grid.unified_prices() {
        let broadcaster = broadcaster.clone();
        let mut rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            return;
                        }
                    }
                    price = unified.recv() => {
                        let Some(price) = price else { return };
                        broadcaster.emit(
                            EventKind::MarketPrice,
                            serde_json::to_value(&price).unwrap_or_default(),
                        );
                    }
                }
            }
        });
    }

    // Kill-switch events: observers + critical alerting.
    if let Some(mut events) = killswitch.events() {
        let broadcaster = broadcaster.clone();
        let alerts = alerts.clone();
        let mut rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            return;
                        }
                    }
                    event = events.recv() => {
                        let Some(event) = event else { return };
                        broadcaster.emit(
                            EventKind::SystemStatus,
                            serde_json::to_value(&event).unwrap_or_default(),
                        );
                        if event.new_level >= LockdownLevel::Lockdown {
                            let _ = alerts
                                .send(
                                    AlertLevel::Critical,
                                    format!("Lockdown level {}", event.new_level),
                                    event.reason.clone(),
                                    Default::default(),
                                )
                                .await;
                        }
                    }
                }
            }
        });
    }

    // Settlement outcomes to observers.
    if let Some(mut events) = settlement.events() {
        let broadcaster = broadcaster.clone();
        let mut rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            return;
                        }
                    }
                    event = events.recv() => {
                        let Some(event) = event else { return };
                        broadcaster.emit(
                            EventKind::Settlement,
                            serde_json::to_value(&event).unwrap_or_default(),
                        );
                    }
                }
            }
        });
    }

    // Fraud alerts escalate the kill switch and notify observers.
    if let Some(mut frauds) = zkp.fraud_alerts() {
        let broadcaster = broadcaster.clone();
        let killswitch = killswitch.clone();
        let zkp = zkp.clone();
        let mut rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            return;
                        }
                    }
                    alert = frauds.recv() => {
                        let Some(alert) = alert else { return };
                        broadcaster.emit(
                            EventKind::RiskAlert,
                            serde_json::to_value(&alert).unwrap_or_default(),
                        );
                        let fraud_count = zkp.stats().fraud as u32;
                        if let Err(err) = killswitch.escalate(
                            Trigger::ZkpFraud,
                            TriggerValue::Count(fraud_count),
                            &alert.description,
                        ) {
                            error!(error = %err, "fraud escalation failed");
                        }
                    }
                }
            }
        });
    }

    // Operator control surface + observer stream.
    let state = AppState {
        killswitch: killswitch.clone(),
        risk: risk.clone(),
        engine: engine.clone(),
        grid: grid.clone(),
        settlement: settlement.clone(),
        zkp: zkp.clone(),
        broadcaster: broadcaster.clone(),
        auth_token: config.api.auth_token.clone(),
        started_at: chrono::Utc::now(),
    };
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API listening");

    let server = axum::serve(listener, api::router(state)).into_future();
    tokio::select! {
        result = server => {
            if let Err(err) = result {
                error!(error = %err, "API server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Graceful teardown: engine first, then data and sinks.
    let _ = shutdown_tx.send(true);
    if let Err(err) = engine.stop().await {
        warn!(error = %err, "engine stop");
    }
    if let Err(err) = grid.stop().await {
        warn!(error = %err, "grid stop");
    }
    if let Err(err) = settlement.stop().await {
        warn!(error = %err, "settlement stop");
    }
    broadcaster.stop().await;

    info!("gridarb stopped");
    Ok(())
}
