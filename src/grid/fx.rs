//! Exchange-rate refresh behind an injected source.
//!
//! The manager starts from operator-configured seed rates and refreshes
//! periodically; a failing source leaves the previous rates in place.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{GridError, Result};

/// Provides currency → USD rates (USD per unit of currency).
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch(&self) -> Result<HashMap<String, f64>>;
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    /// Units of currency per USD, keyed by currency code
    rates: HashMap<String, f64>,
}

/// Pulls rates from an exchangerate.host-compatible endpoint
/// (`GET {endpoint}?base=USD`).
pub struct HttpRateSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRateSource {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn fetch(&self) -> Result<HashMap<String, f64>> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("base", "USD")])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GridError::MarketDataUnavailable(format!(
                "rate source returned {}",
                resp.status()
            )));
        }
        let body: RatesResponse = resp.json().await?;

        // The endpoint quotes units-per-USD; invert to USD-per-unit.
        let mut rates = HashMap::with_capacity(body.rates.len());
        for (currency, per_usd) in body.rates {
            if per_usd > 0.0 {
                rates.insert(currency, 1.0 / per_usd);
            }
        }
        debug!(count = rates.len(), "exchange rates refreshed");
        Ok(rates)
    }
}

/// Fixed-rate source for tests and offline runs.
pub struct StaticRateSource(pub HashMap<String, f64>);

#[async_trait]
impl RateSource for StaticRateSource {
    async fn fetch(&self) -> Result<HashMap<String, f64>> {
        Ok(self.0.clone())
    }
}
