//! Credential retrieval behind a pluggable provider with TTL caching.
//!
//! The platform never reads credentials from its own config file; every
//! consumer asks the cache by logical name and tolerates transient
//! provider failures by reusing the cached value until it expires.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{GridError, Result};

/// Opaque secret backend: Vault, cloud secret manager, env, etc.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get(&self, name: &str) -> Result<Vec<u8>>;
}

/// Venue API credentials stored as a JSON secret.
#[derive(Debug, Clone, Deserialize)]
pub struct VenueCredentials {
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub participant_id: String,
}

/// Chain wallet credentials stored as a JSON secret. The signing key
/// never leaves the provider; only the address is surfaced here.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainCredentials {
    pub wallet_address: String,
    #[serde(default)]
    pub rpc_api_key: String,
}

struct CachedSecret {
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
}

/// TTL cache over any [`SecretProvider`].
pub struct SecretCache {
    provider: Box<dyn SecretProvider>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedSecret>>,
}

impl SecretCache {
    pub fn new(provider: Box<dyn SecretProvider>, ttl: std::time::Duration) -> Self {
        Self {
            provider,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::minutes(5)),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a secret, serving from cache while the TTL holds. A provider
    /// failure falls back to an expired cached value rather than erroring,
    /// so rotation hiccups do not take the adapters down.
    pub async fn get(&self, name: &str) -> Result<Vec<u8>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(name) {
                if entry.expires_at > Utc::now() {
                    return Ok(entry.value.clone());
                }
            }
        }

        match self.provider.get(name).await {
            Ok(value) => {
                let mut cache = self.cache.write().await;
                cache.insert(
                    name.to_string(),
                    CachedSecret {
                        value: value.clone(),
                        expires_at: Utc::now() + self.ttl,
                    },
                );
                debug!(secret = name, "secret refreshed");
                Ok(value)
            }
            Err(err) => {
                let cache = self.cache.read().await;
                if let Some(entry) = cache.get(name) {
                    warn!(secret = name, error = %err, "provider failed, serving stale secret");
                    return Ok(entry.value.clone());
                }
                Err(err)
            }
        }
    }

    pub async fn venue_credentials(&self, venue: &str) -> Result<VenueCredentials> {
        let raw = self.get(&format!("venues/{}", venue.to_lowercase())).await?;
        serde_json::from_slice(&raw).map_err(GridError::Json)
    }

    pub async fn chain_credentials(&self) -> Result<ChainCredentials> {
        let raw = self.get("chain/wallet").await?;
        serde_json::from_slice(&raw).map_err(GridError::Json)
    }

    /// Drop a cached entry, forcing a provider round-trip on next access.
    pub async fn invalidate(&self, name: &str) {
        self.cache.write().await.remove(name);
    }
}

/// Environment-variable provider for development and tests. Secret name
/// `venues/aemo` maps to `GRIDARB_SECRET_VENUES_AEMO`.
pub struct EnvSecretProvider;

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let var = format!(
            "GRIDARB_SECRET_{}",
            name.replace('/', "_").to_ascii_uppercase()
        );
        std::env::var(&var)
            .map(|v| v.into_bytes())
            .map_err(|_| GridError::UnknownSecret(name.to_string()))
    }
}
