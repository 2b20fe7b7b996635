//! Shamir secret sharing over GF(256).
//!
//! Each byte of the secret is the constant term of an independent random
//! polynomial of degree `threshold - 1`; share `x` holds the polynomial
//! evaluated at `x`. Any `threshold` shares recover the secret via Lagrange
//! interpolation at zero; fewer reveal nothing about it.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{SecurityError, SecurityResult};

/// key: shamir-share
/// One share of a split secret. `checksum` is a truncated SHA-256 over the
/// raw share bytes, used to fail fast on corrupted shares before any
/// interpolation happens.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitKeyShare {
    pub share_index: u8,
    pub total_shares: u8,
    pub threshold: u8,
    pub share: String,
    pub checksum: String,
}

/// Carry-less binary multiply in GF(2^8) with reduction by the AES
/// irreducible polynomial x^8 + x^4 + x^3 + x + 1.
fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut result = 0u8;
    for _ in 0..8 {
        if b & 1 != 0 {
            result ^= a;
        }
        let high_bit = a & 0x80 != 0;
        a <<= 1;
        if high_bit {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    result
}

fn gf_pow(base: u8, exp: u32) -> u8 {
    let mut result = 1u8;
    for _ in 0..exp {
        result = gf_mul(result, base);
    }
    result
}

/// Multiplicative inverse via a^254: the nonzero elements form a group of
/// order 255, so a^254 = a^-1.
fn gf_inv(a: u8) -> SecurityResult<u8> {
    if a == 0 {
        return Err(SecurityError::Config(
            "zero has no inverse in GF(256)".into(),
        ));
    }
    Ok(gf_pow(a, 254))
}

fn share_checksum(share: &[u8]) -> String {
    hex::encode(Sha256::digest(share))[..8].to_string()
}

/// Split `secret` into `total_shares` shares, any `threshold` of which
/// reconstruct it exactly.
pub fn split_secret(
    secret: &[u8],
    total_shares: u8,
    threshold: u8,
) -> SecurityResult<Vec<SplitKeyShare>> {
    if secret.is_empty() {
        return Err(SecurityError::Config("cannot split an empty secret".into()));
    }
    if threshold < 2 {
        return Err(SecurityError::Config("threshold must be at least 2".into()));
    }
    if threshold > total_shares {
        return Err(SecurityError::Config(
            "threshold cannot be greater than total shares".into(),
        ));
    }

    // coefficients[0] is the secret itself; the rest are uniform random.
    let mut coefficients: Vec<Zeroizing<Vec<u8>>> =
        Vec::with_capacity(threshold as usize);
    coefficients.push(Zeroizing::new(secret.to_vec()));
    for _ in 1..threshold {
        let mut coefficient = Zeroizing::new(vec![0u8; secret.len()]);
        OsRng.fill_bytes(coefficient.as_mut_slice());
        coefficients.push(coefficient);
    }

    let mut shares = Vec::with_capacity(total_shares as usize);
    for x in 1..=total_shares {
        let mut share = Zeroizing::new(vec![0u8; secret.len()]);
        for (byte_idx, out) in share.iter_mut().enumerate() {
            let mut value = 0u8;
            for (coef_idx, coefficient) in coefficients.iter().enumerate() {
                value ^= gf_mul(coefficient[byte_idx], gf_pow(x, coef_idx as u32));
            }
            *out = value;
        }

        shares.push(SplitKeyShare {
            share_index: x,
            total_shares,
            threshold,
            checksum: share_checksum(&share),
            share: STANDARD.encode(share.as_slice()),
        });
    }

    Ok(shares)
}

/// Reconstruct the secret from at least `threshold` shares. Every supplied
/// share's checksum is verified before any field arithmetic runs.
pub fn reconstruct_secret(shares: &[SplitKeyShare]) -> SecurityResult<Zeroizing<Vec<u8>>> {
    let first = shares
        .first()
        .ok_or_else(|| SecurityError::Config("no shares supplied".into()))?;
    let threshold = first.threshold as usize;

    if shares.len() < threshold {
        return Err(SecurityError::Config(format!(
            "need at least {} shares to reconstruct, got {}",
            threshold,
            shares.len()
        )));
    }
    if shares
        .iter()
        .any(|s| s.threshold != first.threshold || s.total_shares != first.total_shares)
    {
        return Err(SecurityError::Config(
            "shares come from different split configurations".into(),
        ));
    }

    let mut decoded: Vec<(u8, Zeroizing<Vec<u8>>)> = Vec::with_capacity(shares.len());
    let mut seen_indices = [false; 256];
    for share in shares {
        // Index zero never occurs in a genuine split, and duplicate
        // evaluation points make interpolation degenerate.
        if share.share_index == 0 || seen_indices[share.share_index as usize] {
            return Err(SecurityError::CryptoFailure(
                "share verification failed".into(),
            ));
        }
        seen_indices[share.share_index as usize] = true;

        let bytes = STANDARD
            .decode(&share.share)
            .map(Zeroizing::new)
            .map_err(|_| SecurityError::CryptoFailure("share verification failed".into()))?;
        if share_checksum(&bytes) != share.checksum {
            return Err(SecurityError::CryptoFailure(
                "share verification failed".into(),
            ));
        }
        decoded.push((share.share_index, bytes));
    }

    let selected = &decoded[..threshold];
    let share_len = selected[0].1.len();
    if selected.iter().any(|(_, bytes)| bytes.len() != share_len) {
        return Err(SecurityError::CryptoFailure(
            "share verification failed".into(),
        ));
    }

    let mut secret = Zeroizing::new(vec![0u8; share_len]);
    for byte_idx in 0..share_len {
        let mut value = 0u8;
        for (i, (xi, bytes)) in selected.iter().enumerate() {
            // Lagrange basis polynomial evaluated at x = 0.
            let mut basis = 1u8;
            for (j, (xj, _)) in selected.iter().enumerate() {
                if i != j {
                    basis = gf_mul(basis, gf_mul(*xj, gf_inv(xi ^ xj)?));
                }
            }
            value ^= gf_mul(bytes[byte_idx], basis);
        }
        secret[byte_idx] = value;
    }

    Ok(secret)
}
