//! Proof admission controller for settlement-adjacent attestations.
//!
//! A proof is accepted only if every step passes, in order: rate limit,
//! format, freshness, replay, malleability, curve checks, pairing.
//! Replay, malleability and curve failures are fraud: they emit an alert
//! on a lossy channel and count separately from plain rejections.

pub mod curve;
pub mod verifier;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ZkpConfig;
use crate::error::{GridError, ProofRejection, Result};
pub use verifier::VerifierKey;

/// A zero-knowledge proof submitted alongside a settlement attestation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    pub id: String,
    pub proof_data: Vec<u8>,
    pub public_inputs: Vec<Vec<u8>>,
    /// One-time tag for replay detection
    pub nullifier: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub settlement_id: String,
    pub trader_id: String,
    pub amount: Decimal,
    /// Selects the verifier key; empty falls back to the default key
    #[serde(default)]
    pub circuit_hash: Vec<u8>,
}

/// Emitted on the fraud channel for replay/malleability/curve failures.
#[derive(Debug, Clone, Serialize)]
pub struct FraudAlert {
    pub timestamp: DateTime<Utc>,
    pub alert_type: String,
    pub proof_id: String,
    pub trader_id: String,
    pub settlement_id: String,
    pub description: String,
    /// 0-100
    pub risk_score: u8,
    pub action: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GuardStats {
    pub verified: u64,
    pub rejected: u64,
    pub fraud: u64,
}

/// Replay state: nullifiers and proof hashes are recorded together on
/// acceptance, under one lock, so an accepted proof can never race its
/// own duplicate.
struct ReplayState {
    nullifiers: HashMap<String, DateTime<Utc>>,
    proof_hashes: HashMap<String, DateTime<Utc>>,
}

pub struct ZkpGuard {
    config: ZkpConfig,
    keys: RwLock<HashMap<String, Arc<VerifierKey>>>,
    replay: Mutex<ReplayState>,
    rate: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,

    fraud_tx: mpsc::Sender<FraudAlert>,
    fraud_rx: Mutex<Option<mpsc::Receiver<FraudAlert>>>,
    fraud_dropped: AtomicU64,

    verified: AtomicU64,
    rejected: AtomicU64,
    fraud: AtomicU64,
}

impl ZkpGuard {
    pub fn new(config: ZkpConfig) -> Self {
        let (fraud_tx, fraud_rx) = mpsc::channel(1000);
        Self {
            config,
            keys: RwLock::new(HashMap::new()),
            replay: Mutex::new(ReplayState {
                nullifiers: HashMap::new(),
                proof_hashes: HashMap::new(),
            }),
            rate: Mutex::new(HashMap::new()),
            fraud_tx,
            fraud_rx: Mutex::new(Some(fraud_rx)),
            fraud_dropped: AtomicU64::new(0),
            verified: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            fraud: AtomicU64::new(0),
        }
    }

    /// Register a circuit-specific verifier key; the name `default` is
    /// the fallback for proofs with no registered circuit hash.
    pub fn register_verifier_key(&self, circuit: &str, key: VerifierKey) {
        self.keys
            .write()
            .expect("lock poisoned")
            .insert(circuit.to_string(), Arc::new(key));
        info!(circuit, "registered verifier key");
    }

    /// Fraud alert stream; taken once.
    pub fn fraud_alerts(&self) -> Option<mpsc::Receiver<FraudAlert>> {
        self.fraud_rx.lock().expect("lock poisoned").take()
    }

    /// Run the full admission pipeline for one proof.
    pub fn verify(&self, proof: &Proof) -> Result<()> {
        match self.verify_inner(proof) {
            Ok(()) => {
                self.verified.fetch_add(1, Ordering::Relaxed);
                debug!(proof_id = %proof.id, settlement_id = %proof.settlement_id, "proof accepted");
                Ok(())
            }
            Err(rejection) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                if let Some(risk_score) = rejection.fraud_risk_score() {
                    self.record_fraud(proof, &rejection, risk_score);
                } else {
                    warn!(proof_id = %proof.id, reason = %rejection, "proof rejected");
                }
                Err(GridError::ProofRejected(rejection))
            }
        }
    }

    fn verify_inner(&self, proof: &Proof) -> std::result::Result<(), ProofRejection> {
        // 1. Per-trader rate limit (sliding 1-second window).
        self.check_rate_limit(&proof.trader_id)?;

        // 2. Format.
        self.check_format(proof)?;

        // 3. Freshness.
        self.check_freshness(proof)?;

        let proof_hash = hex::encode(Sha256::digest(&proof.proof_data));
        let nullifier_key = hex::encode(&proof.nullifier);
        {
            let replay = self.replay.lock().expect("lock poisoned");
            // 4. Replay.
            if replay.nullifiers.contains_key(&nullifier_key) {
                return Err(ProofRejection::NullifierUsed);
            }
            // 5. Malleability.
            if replay.proof_hashes.contains_key(&proof_hash) {
                return Err(ProofRejection::Malleability);
            }
        }

        // 6. Curve points.
        let points = curve::parse_proof(&proof.proof_data)?;

        // 7. Pairing. CPU-bound; no lock is held here.
        let key = self.key_for(&proof.circuit_hash)?;
        key.verify(&points, &proof.public_inputs)?;

        // 8. Record nullifier and proof hash atomically with acceptance,
        // re-checking in case a duplicate raced past step 4.
        let now = Utc::now();
        let mut replay = self.replay.lock().expect("lock poisoned");
        if replay.nullifiers.contains_key(&nullifier_key) {
            return Err(ProofRejection::NullifierUsed);
        }
        if replay.proof_hashes.contains_key(&proof_hash) {
            return Err(ProofRejection::Malleability);
        }
        replay.nullifiers.insert(nullifier_key, now);
        replay.proof_hashes.insert(proof_hash, now);
        Ok(())
    }

    /// Verify a batch; results preserve input order. Parallel evaluation
    /// runs the CPU-bound pairings on blocking threads.
    pub async fn verify_batch(self: &Arc<Self>, proofs: Vec<Proof>) -> Vec<Result<()>> {
        if !self.config.parallel_verify {
            return proofs.iter().map(|p| self.verify(p)).collect();
        }

        let handles: Vec<_> = proofs
            .into_iter()
            .map(|proof| {
                let guard = self.clone();
                tokio::task::spawn_blocking(move || guard.verify(&proof))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .await
                    .unwrap_or_else(|e| Err(GridError::Internal(format!("verify task failed: {e}")))),
            );
        }
        results
    }

    fn check_rate_limit(&self, trader_id: &str) -> std::result::Result<(), ProofRejection> {
        let now = Utc::now();
        let window_start = now - Duration::seconds(1);
        let mut rate = self.rate.lock().expect("lock poisoned");
        let timestamps = rate.entry(trader_id.to_string()).or_default();

        while timestamps
            .front()
            .is_some_and(|ts| *ts <= window_start)
        {
            timestamps.pop_front();
        }

        if timestamps.len() >= self.config.max_proofs_per_second as usize {
            return Err(ProofRejection::RateLimit {
                limit: self.config.max_proofs_per_second,
            });
        }
        timestamps.push_back(now);
        Ok(())
    }

    fn check_format(&self, proof: &Proof) -> std::result::Result<(), ProofRejection> {
        if proof.id.is_empty() {
            return Err(ProofRejection::InvalidFormat("missing proof id".to_string()));
        }
        if proof.proof_data.len() < self.config.min_proof_bytes {
            return Err(ProofRejection::InvalidFormat(format!(
                "proof data too short: {} bytes",
                proof.proof_data.len()
            )));
        }
        if proof.proof_data.len() > self.config.max_proof_bytes {
            return Err(ProofRejection::InvalidFormat(format!(
                "proof data too large: {} bytes",
                proof.proof_data.len()
            )));
        }
        if proof.nullifier.is_empty() {
            return Err(ProofRejection::InvalidFormat("missing nullifier".to_string()));
        }
        if proof.settlement_id.is_empty() {
            return Err(ProofRejection::InvalidFormat(
                "missing settlement id".to_string(),
            ));
        }
        if proof.public_inputs.is_empty() {
            return Err(ProofRejection::InvalidFormat(
                "missing public inputs".to_string(),
            ));
        }
        Ok(())
    }

    fn check_freshness(&self, proof: &Proof) -> std::result::Result<(), ProofRejection> {
        let now = Utc::now();
        let ttl = Duration::seconds(self.config.proof_ttl_secs as i64);
        // Age equal to the TTL is already expired.
        if now - proof.timestamp >= ttl {
            return Err(ProofRejection::Expired);
        }
        // Clock-skew tolerance: exactly +30s is still acceptable.
        if proof.timestamp > now + Duration::seconds(30) {
            return Err(ProofRejection::FutureTimestamp);
        }
        Ok(())
    }

    fn key_for(&self, circuit_hash: &[u8]) -> std::result::Result<Arc<VerifierKey>, ProofRejection> {
        let keys = self.keys.read().expect("lock poisoned");
        if !circuit_hash.is_empty() {
            let circuit = hex::encode(circuit_hash);
            if let Some(key) = keys.get(&circuit) {
                return Ok(key.clone());
            }
        }
        // Fall back to the default key; with none registered at all the
        // guard fails closed.
        keys.get("default")
            .cloned()
            .ok_or(ProofRejection::UnknownVerifierKey)
    }

    fn record_fraud(&self, proof: &Proof, rejection: &ProofRejection, risk_score: u8) {
        self.fraud.fetch_add(1, Ordering::Relaxed);

        let alert_type = match rejection {
            ProofRejection::NullifierUsed => "replay_attack",
            ProofRejection::Malleability => "malleability",
            ProofRejection::InvalidCurvePoint(_) => "invalid_curve",
            _ => "fraud",
        };

        error!(
            alert_type,
            proof_id = %proof.id,
            trader_id = %proof.trader_id,
            risk_score,
            "FRAUD DETECTED"
        );

        let alert = FraudAlert {
            timestamp: Utc::now(),
            alert_type: alert_type.to_string(),
            proof_id: proof.id.clone(),
            trader_id: proof.trader_id.clone(),
            settlement_id: proof.settlement_id.clone(),
            description: rejection.to_string(),
            risk_score,
            action: "BLOCKED".to_string(),
        };

        if self.fraud_tx.try_send(alert).is_err() {
            self.fraud_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("fraud alert channel full, dropping alert");
        }
    }

    /// Evict nullifiers and proof hashes past the retention window.
    pub fn evict_expired(&self) -> usize {
        let cutoff = Utc::now() - Duration::seconds(self.config.nullifier_ttl_secs as i64);
        let mut replay = self.replay.lock().expect("lock poisoned");
        let before = replay.nullifiers.len();
        replay.nullifiers.retain(|_, at| *at > cutoff);
        replay.proof_hashes.retain(|_, at| *at > cutoff);
        let evicted = before - replay.nullifiers.len();
        if evicted > 0 {
            info!(evicted, "expired nullifiers cleaned up");
        }
        evicted
    }

    /// Hourly retention cleanup task.
    pub async fn run_cleanup(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    self.evict_expired();
                }
            }
        }
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            verified: self.verified.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            fraud: self.fraud.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::verifier::test_support::{
        passing_inputs, passing_key, passing_proof_bytes, passing_proof_bytes_alt,
    };
    use super::*;
    use ark_bn254::{G1Affine, G2Affine};
    use ark_ec::{AffineRepr, CurveGroup};
    use rust_decimal_macros::dec;

    fn guard() -> Arc<ZkpGuard> {
        let guard = ZkpGuard::new(ZkpConfig::default());
        guard.register_verifier_key("default", passing_key());
        Arc::new(guard)
    }

    fn proof(nullifier: &[u8]) -> Proof {
        Proof {
            id: format!("P-{}", hex::encode(nullifier)),
            proof_data: passing_proof_bytes(),
            public_inputs: passing_inputs(),
            nullifier: nullifier.to_vec(),
            timestamp: Utc::now(),
            settlement_id: "SETTLE-1".to_string(),
            trader_id: "trader-a".to_string(),
            amount: dec!(100),
            circuit_hash: Vec::new(),
        }
    }

    /// On-curve points that fail the pairing equation: C is doubled
    /// without compensating A.
    fn tampered_proof(nullifier: &[u8]) -> Proof {
        let mut p = proof(nullifier);
        let double_g = (G1Affine::generator() + G1Affine::generator()).into_affine();
        p.proof_data = curve::encode_proof(&curve::Groth16Points {
            a: G1Affine::generator(),
            b: G2Affine::generator(),
            c: double_g,
        });
        p
    }

    /// A second accepted proof with bytes distinct from [`proof`].
    fn alt_proof(nullifier: &[u8]) -> Proof {
        let mut p = proof(nullifier);
        p.proof_data = passing_proof_bytes_alt();
        p
    }

    #[test]
    fn accepts_valid_proof() {
        let g = guard();
        g.verify(&proof(b"n-1")).unwrap();
        let stats = g.stats();
        assert_eq!(stats.verified, 1);
        assert_eq!(stats.rejected, 0);
    }

    #[test]
    fn replay_with_same_nullifier_is_fraud() {
        let g = guard();
        let mut alerts = g.fraud_alerts().unwrap();

        g.verify(&proof(b"n-replay")).unwrap();

        // Any proof carrying the same nullifier within the retention
        // window is a replay, regardless of its bytes.
        let result = g.verify(&proof(b"n-replay"));
        assert!(matches!(
            result,
            Err(GridError::ProofRejected(ProofRejection::NullifierUsed))
        ));

        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.alert_type, "replay_attack");
        assert!(alert.risk_score >= 90);

        let stats = g.stats();
        assert_eq!(stats.verified, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.fraud, 1);
    }

    #[test]
    fn duplicate_bytes_with_new_nullifier_is_malleability() {
        let g = guard();
        let mut alerts = g.fraud_alerts().unwrap();

        g.verify(&proof(b"n-a")).unwrap();
        let result = g.verify(&proof(b"n-b"));
        assert!(matches!(
            result,
            Err(GridError::ProofRejected(ProofRejection::Malleability))
        ));
        assert_eq!(alerts.try_recv().unwrap().alert_type, "malleability");
    }

    #[test]
    fn coordinate_at_modulus_is_curve_fraud() {
        let g = guard();
        let mut alerts = g.fraud_alerts().unwrap();

        let mut p = proof(b"n-curve");
        // A_x = field modulus: the canonical invalid-encoding probe.
        p.proof_data[0..32].copy_from_slice(&[
            0x30, 0x64, 0x4e, 0x72, 0xe1, 0x31, 0xa0, 0x29, 0xb8, 0x50, 0x45, 0xb6, 0x81, 0x81,
            0x58, 0x5d, 0x97, 0x81, 0x6a, 0x91, 0x68, 0x71, 0xca, 0x8d, 0x3c, 0x20, 0x8c, 0x16,
            0xd8, 0x7c, 0xfd, 0x47,
        ]);

        let result = g.verify(&p);
        assert!(matches!(
            result,
            Err(GridError::ProofRejected(ProofRejection::InvalidCurvePoint(_)))
        ));

        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.alert_type, "invalid_curve");
        assert!(alert.risk_score >= 90);
    }

    #[test]
    fn pairing_failure_is_rejection_not_fraud() {
        let g = guard();
        let result = g.verify(&tampered_proof(b"n-tamper"));
        assert!(matches!(
            result,
            Err(GridError::ProofRejected(ProofRejection::VerificationFailed))
        ));
        assert_eq!(g.stats().fraud, 0);
    }

    #[test]
    fn format_checks_reject_malformed_proofs() {
        let g = guard();

        let mut missing_nullifier = proof(b"n-x");
        missing_nullifier.nullifier.clear();
        assert!(matches!(
            g.verify(&missing_nullifier),
            Err(GridError::ProofRejected(ProofRejection::InvalidFormat(_)))
        ));

        let mut no_inputs = proof(b"n-y");
        no_inputs.public_inputs.clear();
        assert!(g.verify(&no_inputs).is_err());

        let mut oversized = proof(b"n-z");
        oversized.proof_data = vec![0u8; 4096];
        assert!(g.verify(&oversized).is_err());
    }

    #[test]
    fn freshness_boundaries() {
        let g = guard();

        // Exactly TTL old: rejected.
        let mut expired = proof(b"n-old");
        expired.timestamp = Utc::now() - Duration::seconds(300);
        assert!(matches!(
            g.verify(&expired),
            Err(GridError::ProofRejected(ProofRejection::Expired))
        ));

        // Within clock skew: accepted.
        let mut near_future = proof(b"n-nf");
        near_future.timestamp = Utc::now() + Duration::seconds(29);
        g.verify(&near_future).unwrap();

        // Beyond clock skew: rejected.
        let mut far_future = proof(b"n-ff");
        far_future.timestamp = Utc::now() + Duration::seconds(31);
        assert!(matches!(
            g.verify(&far_future),
            Err(GridError::ProofRejected(ProofRejection::FutureTimestamp))
        ));
    }

    #[test]
    fn rate_limit_applies_per_trader() {
        let guard = ZkpGuard::new(ZkpConfig {
            max_proofs_per_second: 2,
            ..ZkpConfig::default()
        });
        guard.register_verifier_key("default", passing_key());
        let g = Arc::new(guard);

        g.verify(&proof(b"r-1")).unwrap();
        g.verify(&alt_proof(b"r-2")).unwrap();

        let result = g.verify(&proof(b"r-3"));
        assert!(matches!(
            result,
            Err(GridError::ProofRejected(ProofRejection::RateLimit { limit: 2 }))
        ));

        // A different trader is unaffected by trader-a's window.
        let mut other = tampered_proof(b"r-4");
        other.trader_id = "trader-b".to_string();
        let result = g.verify(&other);
        assert!(matches!(
            result,
            Err(GridError::ProofRejected(ProofRejection::VerificationFailed))
        ));
    }

    #[test]
    fn fails_closed_without_any_verifier_key() {
        let g = Arc::new(ZkpGuard::new(ZkpConfig::default()));
        let result = g.verify(&proof(b"n-nokey"));
        assert!(matches!(
            result,
            Err(GridError::ProofRejected(ProofRejection::UnknownVerifierKey))
        ));
    }

    #[test]
    fn eviction_allows_reuse_after_retention() {
        let guard = ZkpGuard::new(ZkpConfig {
            nullifier_ttl_secs: 0,
            ..ZkpConfig::default()
        });
        guard.register_verifier_key("default", passing_key());
        let g = Arc::new(guard);

        g.verify(&proof(b"n-ttl")).unwrap();
        assert_eq!(g.evict_expired(), 1);
        // Retention window elapsed: the nullifier may be seen again.
        g.verify(&proof(b"n-ttl")).unwrap();
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let g = guard();
        let mut bad = proof(b"b-2");
        bad.proof_data[0..32].fill(0xff);

        let results = g
            .verify_batch(vec![proof(b"b-1"), bad, alt_proof(b"b-3")])
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(GridError::ProofRejected(ProofRejection::InvalidCurvePoint(_)))
        ));
        assert!(results[2].is_ok());
    }
}
