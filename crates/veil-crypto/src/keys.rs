//! Viewing key derivation: seed string → HKDF-SHA256 → scalar mod subgroup
//! order → keypair on the embedded curve.

use ark_bn254::Fr;
use ark_ff::{BigInteger, BigInteger256, PrimeField};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use veil_types::{Error, Result};

use crate::edwards::{self, Point};

const HKDF_INFO: &str = "Veil.KeyGen";
const MIN_SEED_LEN: usize = 8;

/// A viewing keypair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    pub secret: Fr,
    pub public: Point,
}

/// Expand a seed (optionally namespaced by an account nonce) to 32 bytes.
fn derive_seed(seed: &str, nonce: Option<&str>) -> Result<[u8; 32]> {
    if seed.len() < MIN_SEED_LEN {
        return Err(Error::config(format!(
            "seed too short: minimum {} characters required",
            MIN_SEED_LEN
        )));
    }

    let info = match nonce {
        Some(n) => format!("{}:{}", HKDF_INFO, n),
        None => HKDF_INFO.to_string(),
    };

    // HKDF with no salt (RFC 5869 default: HashLen zeros)
    let hk = Hkdf::<Sha256>::new(None, seed.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|e| Error::crypto(format!("key derivation failed: {}", e)))?;

    Ok(okm)
}

fn keypair_from_seed(seed_bytes: &[u8; 32]) -> KeyPair {
    let digest: [u8; 32] = Sha256::digest(seed_bytes).into();

    let mut le = digest;
    le.reverse();
    let hash_bigint = BigInteger256::new([
        u64::from_le_bytes(le[0..8].try_into().unwrap()),
        u64::from_le_bytes(le[8..16].try_into().unwrap()),
        u64::from_le_bytes(le[16..24].try_into().unwrap()),
        u64::from_le_bytes(le[24..32].try_into().unwrap()),
    ]);

    let reduced = bigint_mod(&hash_bigint, &edwards::subgroup_order());
    let secret = Fr::from_bigint(reduced).unwrap_or_else(|| Fr::from(0u64));
    let public = edwards::mul_generator(&secret);

    KeyPair { secret, public }
}

/// BigInteger256 modular reduction: a mod m. The operands are at most a few
/// multiples apart, so repeated subtraction terminates quickly.
pub(crate) fn bigint_mod(a: &BigInteger256, m: &BigInteger256) -> BigInteger256 {
    let mut result = *a;
    while result >= *m {
        result.sub_with_borrow(m);
    }
    result
}

/// Derive a keypair from a seed string and optional account nonce.
pub fn derive_key_pair(seed: &str, nonce: Option<&str>) -> Result<KeyPair> {
    let derived = derive_seed(seed, nonce)?;
    Ok(keypair_from_seed(&derived))
}
