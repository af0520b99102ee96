use thiserror::Error;

/// Main error type for the trading platform
#[derive(Error, Debug)]
pub enum GridError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Resilience errors
    #[error("Maximum retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("Circuit breaker is open")]
    CircuitOpen,

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Stale price: {0}")]
    StalePrice(String),

    #[error("Unknown venue: {0}")]
    UnknownVenue(String),

    // Order errors
    #[error("Order validation failed: {0}")]
    OrderValidation(String),

    #[error("Order submission failed: {0}")]
    OrderSubmission(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    // Risk / policy rejections
    #[error("Trade rejected by risk shield: {0}")]
    RiskRejected(RiskRejection),

    #[error("Operation blocked by kill switch: {0}")]
    CapabilityBlocked(String),

    // Kill-switch control errors
    #[error("Insufficient privilege for this lockdown level")]
    InsufficientPrivilege,

    #[error("System already at this lockdown level")]
    AlreadyAtLevel,

    #[error("Cannot downgrade without CEO approval")]
    CannotDowngrade,

    #[error("Invalid lockdown level: {0}")]
    InvalidLevel(u8),

    // Proof admission errors
    #[error("Proof rejected: {0}")]
    ProofRejected(ProofRejection),

    // Settlement errors
    #[error("Settlement submission failed: {0}")]
    SettlementSubmission(String),

    #[error("Chain client error: {0}")]
    ChainClient(String),

    // Secret provider errors
    #[error("Unknown secret: {0}")]
    UnknownSecret(String),

    #[error("Secret provider error: {0}")]
    SecretProvider(String),

    // Worker pool errors
    #[error("Worker pool is closed")]
    PoolClosed,

    #[error("Job queue is full")]
    QueueFull,

    #[error("Job timed out after {elapsed_ms}ms")]
    JobTimeout { elapsed_ms: u64 },

    #[error("Shutdown timeout exceeded")]
    ShutdownTimeout,

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl GridError {
    /// Whether a retry through backoff is worthwhile. Validation and
    /// policy rejections are terminal; transport failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GridError::Http(_)
                | GridError::WebSocket(_)
                | GridError::ChainClient(_)
                | GridError::Io(_)
                | GridError::MarketDataUnavailable(_)
        )
    }
}

/// Result type alias for GridError
pub type Result<T> = std::result::Result<T, GridError>;

/// Structured reasons produced by the risk shield. First failing check wins.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskRejection {
    #[error("safety lock active")]
    SafetyLocked,

    #[error("drawdown limit reached: {current:.2}% >= {limit:.2}%")]
    DrawdownLimit { current: f64, limit: f64 },

    #[error("daily loss limit reached: ${loss}")]
    DailyLossLimit { loss: rust_decimal::Decimal },

    #[error("weekly loss limit reached: ${loss}")]
    WeeklyLossLimit { loss: rust_decimal::Decimal },

    #[error("max open positions reached: {open}/{max}")]
    PositionLimit { open: usize, max: usize },

    #[error("daily trade limit reached: {count}/{max}")]
    DailyTradeLimit { count: u32, max: u32 },

    #[error("venue exposure limit reached: {venue} at {exposure_pct:.1}%")]
    VenueExposure { venue: String, exposure_pct: f64 },

    #[error("weekend trading blocked")]
    WeekendBlocked,
}

/// Structured reasons produced by the ZKP guard pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofRejection {
    #[error("rate limit exceeded: {limit} proofs/second")]
    RateLimit { limit: u32 },

    #[error("invalid proof format: {0}")]
    InvalidFormat(String),

    #[error("proof timestamp expired")]
    Expired,

    #[error("proof timestamp in future")]
    FutureTimestamp,

    #[error("nullifier already consumed (replay attack)")]
    NullifierUsed,

    #[error("proof malleability detected")]
    Malleability,

    #[error("invalid curve point: {0}")]
    InvalidCurvePoint(String),

    #[error("invalid public inputs")]
    InvalidPublicInputs,

    #[error("no verifier key registered for circuit")]
    UnknownVerifierKey,

    #[error("pairing verification failed")]
    VerificationFailed,
}

impl ProofRejection {
    /// Rejections that constitute fraud rather than malformed input,
    /// paired with the risk score carried on the resulting alert.
    pub fn fraud_risk_score(&self) -> Option<u8> {
        match self {
            ProofRejection::NullifierUsed => Some(90),
            ProofRejection::Malleability => Some(85),
            ProofRejection::InvalidCurvePoint(_) => Some(95),
            _ => None,
        }
    }
}

impl From<RiskRejection> for GridError {
    fn from(err: RiskRejection) -> Self {
        GridError::RiskRejected(err)
    }
}

impl From<ProofRejection> for GridError {
    fn from(err: ProofRejection) -> Self {
        GridError::ProofRejected(err)
    }
}
