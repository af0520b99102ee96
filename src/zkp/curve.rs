//! BN254 point parsing and validation for the fixed Groth16 proof layout.
//!
//! Wire format: A (G1, 64 bytes) + B (G2, 128 bytes) + C (G1, 64 bytes),
//! each coordinate a 32-byte big-endian field element. Coordinates are
//! bounds-checked against the field modulus *before* any reduction so an
//! out-of-range encoding is rejected rather than silently wrapped.

use ark_bn254::{Fq, Fq2, G1Affine, G2Affine};
use ark_ec::AffineRepr;
use ark_ff::PrimeField;

use crate::error::ProofRejection;

/// BN254 base field modulus, big-endian.
const FIELD_MODULUS_BE: [u8; 32] = [
    0x30, 0x64, 0x4e, 0x72, 0xe1, 0x31, 0xa0, 0x29, 0xb8, 0x50, 0x45, 0xb6, 0x81, 0x81, 0x58,
    0x5d, 0x97, 0x81, 0x6a, 0x91, 0x68, 0x71, 0xca, 0x8d, 0x3c, 0x20, 0x8c, 0x16, 0xd8, 0x7c,
    0xfd, 0x47,
];

/// Serialized Groth16 proof size: A(64) + B(128) + C(64).
pub const PROOF_BYTES: usize = 256;

/// The three proof points, parsed and curve-checked.
#[derive(Debug, Clone)]
pub struct Groth16Points {
    pub a: G1Affine,
    pub b: G2Affine,
    pub c: G1Affine,
}

/// Parse and fully validate the 256-byte proof layout.
pub fn parse_proof(data: &[u8]) -> Result<Groth16Points, ProofRejection> {
    if data.len() < PROOF_BYTES {
        return Err(ProofRejection::InvalidCurvePoint(format!(
            "proof data too short: {} bytes",
            data.len()
        )));
    }

    let a = g1_from_bytes(&data[0..32], &data[32..64], "A")?;
    let b = g2_from_bytes(
        &data[64..96],
        &data[96..128],
        &data[128..160],
        &data[160..192],
    )?;
    let c = g1_from_bytes(&data[192..224], &data[224..256], "C")?;

    Ok(Groth16Points { a, b, c })
}

/// Scalar reduced into the BN254 scalar field (mod curve order).
pub fn scalar_from_bytes(bytes: &[u8]) -> ark_bn254::Fr {
    ark_bn254::Fr::from_be_bytes_mod_order(bytes)
}

fn fq_from_be(bytes: &[u8], label: &str) -> Result<Fq, ProofRejection> {
    if bytes >= &FIELD_MODULUS_BE[..] {
        return Err(ProofRejection::InvalidCurvePoint(format!(
            "{label} coordinate exceeds field modulus"
        )));
    }
    Ok(Fq::from_be_bytes_mod_order(bytes))
}

fn g1_from_bytes(x_bytes: &[u8], y_bytes: &[u8], label: &str) -> Result<G1Affine, ProofRejection> {
    if is_all_zero(x_bytes) && is_all_zero(y_bytes) {
        return Err(ProofRejection::InvalidCurvePoint(format!(
            "{label} is the point at infinity"
        )));
    }

    let x = fq_from_be(x_bytes, label)?;
    let y = fq_from_be(y_bytes, label)?;

    // y^2 = x^3 + 3 on BN254 G1.
    let point = G1Affine::new_unchecked(x, y);
    if !point.is_on_curve() {
        return Err(ProofRejection::InvalidCurvePoint(format!(
            "{label} is not on the curve"
        )));
    }
    Ok(point)
}

fn g2_from_bytes(
    x0: &[u8],
    x1: &[u8],
    y0: &[u8],
    y1: &[u8],
) -> Result<G2Affine, ProofRejection> {
    if is_all_zero(x0) && is_all_zero(x1) && is_all_zero(y0) && is_all_zero(y1) {
        return Err(ProofRejection::InvalidCurvePoint(
            "B is the point at infinity".to_string(),
        ));
    }

    let x = Fq2::new(fq_from_be(x0, "B")?, fq_from_be(x1, "B")?);
    let y = Fq2::new(fq_from_be(y0, "B")?, fq_from_be(y1, "B")?);

    // Full twist-curve membership check.
    let point = G2Affine::new_unchecked(x, y);
    if !point.is_on_curve() {
        return Err(ProofRejection::InvalidCurvePoint(
            "B is not on the twist curve".to_string(),
        ));
    }
    Ok(point)
}

fn is_all_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == 0)
}

/// Big-endian 32-byte encoding of a base-field element.
pub fn fq_to_bytes(value: &Fq) -> [u8; 32] {
    use ark_ff::BigInteger;
    let raw = value.into_bigint().to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - raw.len()..].copy_from_slice(&raw);
    out
}

/// Serialize points back into the wire layout. Used by tests and by key
/// tooling; the guard itself only parses.
pub fn encode_proof(points: &Groth16Points) -> Vec<u8> {
    let mut out = Vec::with_capacity(PROOF_BYTES);
    let (ax, ay) = points.a.xy().expect("A is not infinity");
    out.extend_from_slice(&fq_to_bytes(ax));
    out.extend_from_slice(&fq_to_bytes(ay));

    let (bx, by) = points.b.xy().expect("B is not infinity");
    out.extend_from_slice(&fq_to_bytes(&bx.c0));
    out.extend_from_slice(&fq_to_bytes(&bx.c1));
    out.extend_from_slice(&fq_to_bytes(&by.c0));
    out.extend_from_slice(&fq_to_bytes(&by.c1));

    let (cx, cy) = points.c.xy().expect("C is not infinity");
    out.extend_from_slice(&fq_to_bytes(cx));
    out.extend_from_slice(&fq_to_bytes(cy));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator_proof_bytes() -> Vec<u8> {
        encode_proof(&Groth16Points {
            a: G1Affine::generator(),
            b: G2Affine::generator(),
            c: G1Affine::generator(),
        })
    }

    #[test]
    fn parses_generator_points() {
        let bytes = generator_proof_bytes();
        assert_eq!(bytes.len(), PROOF_BYTES);
        let points = parse_proof(&bytes).unwrap();
        assert_eq!(points.a, G1Affine::generator());
        assert_eq!(points.b, G2Affine::generator());
        assert_eq!(points.c, G1Affine::generator());
    }

    #[test]
    fn rejects_short_data() {
        let result = parse_proof(&[0u8; 100]);
        assert!(matches!(result, Err(ProofRejection::InvalidCurvePoint(_))));
    }

    #[test]
    fn rejects_coordinate_at_field_modulus() {
        let mut bytes = generator_proof_bytes();
        bytes[0..32].copy_from_slice(&FIELD_MODULUS_BE);
        let result = parse_proof(&bytes);
        assert!(matches!(
            result,
            Err(ProofRejection::InvalidCurvePoint(ref msg)) if msg.contains("field modulus")
        ));
    }

    #[test]
    fn rejects_point_at_infinity() {
        let mut bytes = generator_proof_bytes();
        // Zero A entirely: (0, 0) encodes the identity.
        bytes[0..64].fill(0);
        let result = parse_proof(&bytes);
        assert!(matches!(
            result,
            Err(ProofRejection::InvalidCurvePoint(ref msg)) if msg.contains("infinity")
        ));
    }

    #[test]
    fn rejects_off_curve_point() {
        let mut bytes = generator_proof_bytes();
        // (1, 3): 9 != 1 + 3, so y^2 != x^3 + 3.
        bytes[0..64].fill(0);
        bytes[31] = 1;
        bytes[63] = 3;
        let result = parse_proof(&bytes);
        assert!(matches!(
            result,
            Err(ProofRejection::InvalidCurvePoint(ref msg)) if msg.contains("not on the curve")
        ));
    }

    #[test]
    fn rejects_tampered_g2_point() {
        let mut bytes = generator_proof_bytes();
        // Flip a byte inside B's x coordinate.
        bytes[70] ^= 0xff;
        let result = parse_proof(&bytes);
        assert!(matches!(result, Err(ProofRejection::InvalidCurvePoint(_))));
    }

    #[test]
    fn scalar_reduction_wraps_modulus() {
        let max = [0xffu8; 32];
        // Reduced into the scalar field without panicking.
        let _ = scalar_from_bytes(&max);
    }
}
