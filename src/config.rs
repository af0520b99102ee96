use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub killswitch: KillSwitchConfig,
    #[serde(default)]
    pub zkp: ZkpConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub aemo: AemoConfig,
    #[serde(default)]
    pub jepx: JepxConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Trading engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Seed capital in USD
    pub initial_capital: Decimal,
    /// Drawdown percentage that trips the safety lock
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    /// Venues the scan loop is allowed to trade
    #[serde(default = "default_enabled_venues")]
    pub enabled_venues: Vec<String>,
    /// Maximum notional per position (USD)
    #[serde(default = "default_max_position_size")]
    pub max_position_size: Decimal,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Minimum spread percent a scanned opportunity must carry
    #[serde(default = "default_min_profit_margin")]
    pub min_profit_margin: f64,
    /// Must stay enabled; preflight refuses to start without it
    #[serde(default = "default_true")]
    pub safety_lock_enabled: bool,
    /// Flat per-trade fee applied by the executor (USD)
    #[serde(default = "default_trade_fee")]
    pub trade_fee: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Drawdown percentage that emits a warning event
    #[serde(default = "default_mdd_warning_pct")]
    pub mdd_warning_pct: f64,
    /// Drawdown percentage that latches the safety lock
    #[serde(default = "default_max_drawdown_pct")]
    pub mdd_critical_pct: f64,
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    #[serde(default = "default_max_weekly_loss")]
    pub max_weekly_loss: Decimal,
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Maximum exposure per venue as a percentage of initial capital
    #[serde(default = "default_max_venue_exposure_pct")]
    pub max_venue_exposure_pct: f64,
    #[serde(default = "default_true")]
    pub block_weekends: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            mdd_warning_pct: default_mdd_warning_pct(),
            mdd_critical_pct: default_max_drawdown_pct(),
            max_daily_loss: default_max_daily_loss(),
            max_weekly_loss: default_max_weekly_loss(),
            max_daily_trades: default_max_daily_trades(),
            max_open_positions: default_max_open_positions(),
            max_venue_exposure_pct: default_max_venue_exposure_pct(),
            block_weekends: true,
        }
    }
}

/// Grid manager: normalization + arbitrage detection
#[derive(Debug, Clone, Deserialize)]
pub struct GridConfig {
    #[serde(default = "default_true")]
    pub enable_arbitrage: bool,
    /// Minimum spread percent; equality is rejected
    #[serde(default = "default_min_spread_percent")]
    pub min_spread_percent: f64,
    /// Minimum net spread in USD/MWh after transfer cost
    #[serde(default = "default_min_net_spread")]
    pub min_net_spread: f64,
    #[serde(default = "default_max_risk_score")]
    pub max_risk_score: f64,
    /// How long a unified price stays eligible, in seconds
    #[serde(default = "default_price_validity_secs")]
    pub price_validity_secs: u64,
    #[serde(default = "default_arbitrage_interval_secs")]
    pub arbitrage_interval_secs: u64,
    /// Seconds between FX rate refresh attempts
    #[serde(default = "default_fx_refresh_secs")]
    pub fx_refresh_secs: u64,
    /// Endpoint for the HTTP rate source; empty keeps the seeds
    #[serde(default)]
    pub fx_endpoint: String,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            enable_arbitrage: true,
            min_spread_percent: default_min_spread_percent(),
            min_net_spread: default_min_net_spread(),
            max_risk_score: default_max_risk_score(),
            price_validity_secs: default_price_validity_secs(),
            arbitrage_interval_secs: default_arbitrage_interval_secs(),
            fx_refresh_secs: default_fx_refresh_secs(),
            fx_endpoint: String::new(),
        }
    }
}

/// Automatic lockdown trigger thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct KillSwitchConfig {
    #[serde(default = "default_daily_loss_caution")]
    pub daily_loss_caution: Decimal,
    #[serde(default = "default_daily_loss_warning")]
    pub daily_loss_warning: Decimal,
    #[serde(default = "default_daily_loss_critical")]
    pub daily_loss_critical: Decimal,
    #[serde(default = "default_daily_loss_lockdown")]
    pub daily_loss_lockdown: Decimal,
    #[serde(default = "default_weekly_loss_lockdown")]
    pub weekly_loss_lockdown: Decimal,
    #[serde(default = "default_weekly_loss_emergency")]
    pub weekly_loss_emergency: Decimal,
    /// Fraud attempts at or past which the level jumps to LOCKDOWN
    #[serde(default = "default_zkp_fraud_count")]
    pub zkp_fraud_count: u32,
    /// API error rate percentage that triggers WARNING
    #[serde(default = "default_api_error_rate")]
    pub api_error_rate: f64,
    /// Price spike percentage that triggers CRITICAL
    #[serde(default = "default_price_spike_percent")]
    pub price_spike_percent: f64,
    #[serde(default = "default_cpu_usage_percent")]
    pub cpu_usage_percent: f64,
    /// Minutes before an auto-escalation recovers to its prior level
    #[serde(default = "default_auto_recover_mins")]
    pub auto_recover_mins: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            daily_loss_caution: default_daily_loss_caution(),
            daily_loss_warning: default_daily_loss_warning(),
            daily_loss_critical: default_daily_loss_critical(),
            daily_loss_lockdown: default_daily_loss_lockdown(),
            weekly_loss_lockdown: default_weekly_loss_lockdown(),
            weekly_loss_emergency: default_weekly_loss_emergency(),
            zkp_fraud_count: default_zkp_fraud_count(),
            api_error_rate: default_api_error_rate(),
            price_spike_percent: default_price_spike_percent(),
            cpu_usage_percent: default_cpu_usage_percent(),
            auto_recover_mins: default_auto_recover_mins(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// ZKP guard configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ZkpConfig {
    /// Maximum proof age in seconds
    #[serde(default = "default_proof_ttl_secs")]
    pub proof_ttl_secs: u64,
    /// Nullifier / proof-hash retention in seconds
    #[serde(default = "default_nullifier_ttl_secs")]
    pub nullifier_ttl_secs: u64,
    /// Per-trader proofs per second (sliding window)
    #[serde(default = "default_max_proofs_per_second")]
    pub max_proofs_per_second: u32,
    /// Groth16 serialization is 256 bytes; bounds guard against DoS
    #[serde(default = "default_min_proof_bytes")]
    pub min_proof_bytes: usize,
    #[serde(default = "default_max_proof_bytes")]
    pub max_proof_bytes: usize,
    #[serde(default = "default_true")]
    pub parallel_verify: bool,
}

impl Default for ZkpConfig {
    fn default() -> Self {
        Self {
            proof_ttl_secs: default_proof_ttl_secs(),
            nullifier_ttl_secs: default_nullifier_ttl_secs(),
            max_proofs_per_second: default_max_proofs_per_second(),
            min_proof_bytes: default_min_proof_bytes(),
            max_proof_bytes: default_max_proof_bytes(),
            parallel_verify: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    /// JSON-RPC endpoint; empty selects the simulated client
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u32,
    #[serde(default = "default_settle_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_settle_retry_secs")]
    pub retry_delay_secs: u64,
    /// Confirmation scan period
    #[serde(default = "default_confirm_interval_secs")]
    pub confirm_interval_secs: u64,
    #[serde(default)]
    pub wallet_address: String,
    /// Settlement contract address on the target chain
    #[serde(default)]
    pub settlement_address: String,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            chain_id: default_chain_id(),
            confirmation_blocks: default_confirmation_blocks(),
            max_retries: default_settle_max_retries(),
            retry_delay_secs: default_settle_retry_secs(),
            confirm_interval_secs: default_confirm_interval_secs(),
            wallet_address: String::new(),
            settlement_address: String::new(),
        }
    }
}

/// AEMO (Australian NEM) adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AemoConfig {
    #[serde(default = "default_aemo_api")]
    pub api_endpoint: String,
    #[serde(default = "default_aemo_ws")]
    pub ws_endpoint: String,
    #[serde(default = "default_aemo_regions")]
    pub regions: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enable_fcas: bool,
    #[serde(default = "default_true")]
    pub enable_predispatch: bool,
    #[serde(default = "default_price_buffer")]
    pub price_buffer: usize,
}

impl Default for AemoConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_aemo_api(),
            ws_endpoint: default_aemo_ws(),
            regions: default_aemo_regions(),
            poll_interval_secs: default_poll_interval_secs(),
            enable_fcas: true,
            enable_predispatch: true,
            price_buffer: default_price_buffer(),
        }
    }
}

/// JEPX (Japan) adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct JepxConfig {
    #[serde(default = "default_jepx_api")]
    pub api_endpoint: String,
    #[serde(default = "default_jepx_ws")]
    pub ws_endpoint: String,
    #[serde(default = "default_jepx_areas")]
    pub areas: Vec<String>,
    /// Spot auction results refresh (30-minute products)
    #[serde(default = "default_spot_poll_secs")]
    pub spot_poll_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub intraday_poll_secs: u64,
    #[serde(default = "default_balancing_poll_secs")]
    pub balancing_poll_secs: u64,
    #[serde(default = "default_true")]
    pub enable_forward: bool,
    #[serde(default = "default_price_buffer")]
    pub price_buffer: usize,
}

impl Default for JepxConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_jepx_api(),
            ws_endpoint: default_jepx_ws(),
            areas: default_jepx_areas(),
            spot_poll_secs: default_spot_poll_secs(),
            intraday_poll_secs: default_poll_interval_secs(),
            balancing_poll_secs: default_balancing_poll_secs(),
            enable_forward: true,
            price_buffer: default_price_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Per-observer queue depth; overflow drops the incoming event
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
    #[serde(default = "default_event_buffer")]
    pub ingress_buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            observer_buffer: default_observer_buffer(),
            ingress_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_job_queue_size")]
    pub job_queue_size: usize,
    #[serde(default = "default_job_queue_size")]
    pub result_queue_size: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            job_queue_size: default_job_queue_size(),
            result_queue_size: default_job_queue_size(),
            job_timeout_secs: default_job_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Bearer token for the control surface and observer stream
    #[serde(default)]
    pub auth_token: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            auth_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// Webhook destination; empty routes alerts to the log only
    #[serde(default)]
    pub webhook_url: String,
    /// Queued (non-critical) alerts allowed per minute
    #[serde(default = "default_alerts_per_minute")]
    pub max_per_minute: u32,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            max_per_minute: default_alerts_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file with a `GRIDARB_` env overlay.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("GRIDARB").separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    /// Validate config invariants. Returns list of problems (empty = valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.engine.initial_capital <= Decimal::ZERO {
            errors.push(format!(
                "engine.initial_capital must be > 0, got {}",
                self.engine.initial_capital
            ));
        }
        if self.engine.enabled_venues.is_empty() {
            errors.push("engine.enabled_venues must not be empty".to_string());
        }
        if !self.engine.safety_lock_enabled {
            errors.push("engine.safety_lock_enabled must be true".to_string());
        }
        if self.risk.mdd_warning_pct >= self.risk.mdd_critical_pct {
            errors.push(format!(
                "risk.mdd_warning_pct ({}) must be below risk.mdd_critical_pct ({})",
                self.risk.mdd_warning_pct, self.risk.mdd_critical_pct
            ));
        }
        if self.grid.min_spread_percent < 0.0 {
            errors.push("grid.min_spread_percent must be >= 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.grid.max_risk_score) {
            errors.push(format!(
                "grid.max_risk_score must be in [0, 1], got {}",
                self.grid.max_risk_score
            ));
        }
        if self.zkp.min_proof_bytes > self.zkp.max_proof_bytes {
            errors.push("zkp.min_proof_bytes exceeds zkp.max_proof_bytes".to_string());
        }
        if self.worker.workers == 0 {
            errors.push("worker.workers must be > 0".to_string());
        }
        errors
    }
}

fn default_true() -> bool {
    true
}

fn default_max_drawdown_pct() -> f64 {
    2.0
}

fn default_enabled_venues() -> Vec<String> {
    vec!["AEMO".to_string(), "JEPX".to_string()]
}

fn default_max_position_size() -> Decimal {
    dec!(100)
}

fn default_max_open_positions() -> usize {
    5
}

fn default_min_profit_margin() -> f64 {
    0.5
}

fn default_trade_fee() -> Decimal {
    dec!(0.50)
}

fn default_mdd_warning_pct() -> f64 {
    1.5
}

fn default_max_daily_loss() -> Decimal {
    dec!(20)
}

fn default_max_weekly_loss() -> Decimal {
    dec!(50)
}

fn default_max_daily_trades() -> u32 {
    50
}

fn default_max_venue_exposure_pct() -> f64 {
    50.0
}

fn default_min_spread_percent() -> f64 {
    0.5
}

fn default_min_net_spread() -> f64 {
    2.0
}

fn default_max_risk_score() -> f64 {
    0.7
}

fn default_price_validity_secs() -> u64 {
    30
}

fn default_arbitrage_interval_secs() -> u64 {
    5
}

fn default_fx_refresh_secs() -> u64 {
    300
}

fn default_daily_loss_caution() -> Decimal {
    dec!(250_000)
}

fn default_daily_loss_warning() -> Decimal {
    dec!(500_000)
}

fn default_daily_loss_critical() -> Decimal {
    dec!(1_000_000)
}

fn default_daily_loss_lockdown() -> Decimal {
    dec!(2_000_000)
}

fn default_weekly_loss_lockdown() -> Decimal {
    dec!(2_000_000)
}

fn default_weekly_loss_emergency() -> Decimal {
    dec!(5_000_000)
}

fn default_zkp_fraud_count() -> u32 {
    3
}

fn default_api_error_rate() -> f64 {
    10.0
}

fn default_price_spike_percent() -> f64 {
    200.0
}

fn default_cpu_usage_percent() -> f64 {
    95.0
}

fn default_auto_recover_mins() -> u64 {
    30
}

fn default_event_buffer() -> usize {
    1000
}

fn default_proof_ttl_secs() -> u64 {
    300
}

fn default_nullifier_ttl_secs() -> u64 {
    86_400
}

fn default_max_proofs_per_second() -> u32 {
    10
}

fn default_min_proof_bytes() -> usize {
    256
}

fn default_max_proof_bytes() -> usize {
    1024
}

fn default_chain_id() -> u64 {
    137
}

fn default_confirmation_blocks() -> u32 {
    12
}

fn default_settle_max_retries() -> u32 {
    3
}

fn default_settle_retry_secs() -> u64 {
    5
}

fn default_confirm_interval_secs() -> u64 {
    15
}

fn default_aemo_api() -> String {
    "https://api.nemgrid.example.com/v1".to_string()
}

fn default_aemo_ws() -> String {
    "wss://stream.nemgrid.example.com/dispatch".to_string()
}

fn default_aemo_regions() -> Vec<String> {
    ["NSW1", "QLD1", "VIC1", "SA1", "TAS1"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_price_buffer() -> usize {
    100
}

fn default_jepx_api() -> String {
    "https://api.jepx-gateway.example.com/v1".to_string()
}

fn default_jepx_ws() -> String {
    "wss://stream.jepx-gateway.example.com/market".to_string()
}

fn default_jepx_areas() -> Vec<String> {
    ["TOKYO", "KANSAI", "KYUSHU", "TOHOKU", "CHUBU", "HOKKAIDO"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_spot_poll_secs() -> u64 {
    60
}

fn default_balancing_poll_secs() -> u64 {
    30
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_observer_buffer() -> usize {
    256
}

fn default_workers() -> usize {
    10
}

fn default_job_queue_size() -> usize {
    1000
}

fn default_job_timeout_secs() -> u64 {
    10
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_api_port() -> u16 {
    8080
}

fn default_alerts_per_minute() -> u32 {
    20
}

fn default_log_filter() -> String {
    "info,gridarb=debug".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            engine: EngineConfig {
                initial_capital: dec!(1000),
                max_drawdown_pct: default_max_drawdown_pct(),
                enabled_venues: default_enabled_venues(),
                max_position_size: default_max_position_size(),
                max_open_positions: default_max_open_positions(),
                min_profit_margin: default_min_profit_margin(),
                safety_lock_enabled: true,
                trade_fee: default_trade_fee(),
            },
            risk: RiskConfig::default(),
            grid: GridConfig::default(),
            killswitch: KillSwitchConfig::default(),
            zkp: ZkpConfig::default(),
            settlement: SettlementConfig::default(),
            aemo: AemoConfig::default(),
            jepx: JepxConfig::default(),
            events: EventsConfig::default(),
            worker: WorkerConfig::default(),
            api: ApiConfig::default(),
            alerts: AlertsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_empty());
    }

    #[test]
    fn rejects_nonpositive_capital() {
        let mut cfg = base_config();
        cfg.engine.initial_capital = Decimal::ZERO;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("initial_capital")));
    }

    #[test]
    fn rejects_disabled_safety_lock() {
        let mut cfg = base_config();
        cfg.engine.safety_lock_enabled = false;
        assert!(!cfg.validate().is_empty());
    }

    #[test]
    fn rejects_empty_venues() {
        let mut cfg = base_config();
        cfg.engine.enabled_venues.clear();
        assert!(!cfg.validate().is_empty());
    }
}
