//! Groth16 pairing verification over BN254.
//!
//! The accepted equation is `e(A, B) = e(α, β) · e(acc, γ) · e(C, δ)`
//! with the public-input accumulator `acc = IC₀ + Σ aᵢ · ICᵢ₊₁`,
//! scalars reduced modulo the curve order. Evaluated as a single
//! multi-pairing with A negated; the product must be the identity.

use ark_bn254::{Bn254, G1Affine, G1Projective, G2Affine};
use ark_ec::pairing::Pairing;
use ark_ec::{AffineRepr, CurveGroup};
use ark_ff::{PrimeField, Zero};

use super::curve::{scalar_from_bytes, Groth16Points};
use crate::error::ProofRejection;

/// Circuit-specific verification key.
#[derive(Debug, Clone)]
pub struct VerifierKey {
    pub alpha: G1Affine,
    pub beta: G2Affine,
    pub gamma: G2Affine,
    pub delta: G2Affine,
    /// Input-consistency points; IC.len() must be inputs + 1
    pub ic: Vec<G1Affine>,
}

impl VerifierKey {
    /// Compute `IC₀ + Σ aᵢ · ICᵢ₊₁` over the public inputs.
    pub fn input_accumulator(&self, inputs: &[Vec<u8>]) -> Result<G1Affine, ProofRejection> {
        if self.ic.is_empty() || inputs.len() + 1 > self.ic.len() {
            return Err(ProofRejection::InvalidPublicInputs);
        }

        let mut acc: G1Projective = self.ic[0].into_group();
        for (input, ic) in inputs.iter().zip(self.ic.iter().skip(1)) {
            let scalar = scalar_from_bytes(input);
            acc += ic.mul_bigint(scalar.into_bigint());
        }
        Ok(acc.into_affine())
    }

    /// The pairing check proper. CPU-bound; call without holding locks.
    pub fn verify(&self, points: &Groth16Points, inputs: &[Vec<u8>]) -> Result<(), ProofRejection> {
        let acc = self.input_accumulator(inputs)?;

        // e(-A, B) · e(α, β) · e(acc, γ) · e(C, δ) == 1
        let result = Bn254::multi_pairing(
            [-points.a, self.alpha, acc, points.c],
            [points.b, self.beta, self.gamma, self.delta],
        );

        if result.is_zero() {
            Ok(())
        } else {
            Err(ProofRejection::VerificationFailed)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::zkp::curve::parse_proof;

    #[test]
    fn accepts_consistent_proof() {
        let key = passing_key();
        let points = parse_proof(&passing_proof_bytes()).unwrap();
        key.verify(&points, &passing_inputs()).unwrap();
    }

    #[test]
    fn rejects_tampered_statement() {
        // Doubling alpha breaks the equation.
        let mut key = passing_key();
        key.alpha = (key.alpha + G1Affine::generator()).into_affine();

        let points = parse_proof(&passing_proof_bytes()).unwrap();
        let result = key.verify(&points, &passing_inputs());
        assert_eq!(result, Err(ProofRejection::VerificationFailed));
    }

    #[test]
    fn rejects_tampered_proof_point() {
        let key = passing_key();
        let mut points = parse_proof(&passing_proof_bytes()).unwrap();
        points.c = (points.c + G1Affine::generator()).into_affine();

        let result = key.verify(&points, &passing_inputs());
        assert_eq!(result, Err(ProofRejection::VerificationFailed));
    }

    #[test]
    fn rejects_excess_public_inputs() {
        let key = passing_key();
        let points = parse_proof(&passing_proof_bytes()).unwrap();
        let inputs = vec![vec![1u8], vec![2u8]];
        let result = key.verify(&points, &inputs);
        assert_eq!(result, Err(ProofRejection::InvalidPublicInputs));
    }

    #[test]
    fn accumulator_reduces_scalars_mod_order() {
        let key = passing_key();
        // A scalar larger than the curve order reduces instead of erroring.
        let acc = key.input_accumulator(&[vec![0xffu8; 40]]).unwrap();
        // IC tail is the identity, so any scalar leaves IC[0].
        assert_eq!(acc, key.ic[0]);
    }
}
