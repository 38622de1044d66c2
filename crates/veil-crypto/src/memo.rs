//! Sealed memos: ECDH + NaCl secretbox (XSalsa20-Poly1305).
//!
//! Sealing:
//! 1. ephemeral keypair (e, E) on the embedded curve
//! 2. shared = owner_pk * e, key = compress(shared)
//! 3. nonce = keccak256(compress(E) || compress(owner_pk))[0..24]
//! 4. output = compress(E) || secretbox(note_bytes, nonce, key)

use ark_bn254::Fr;
use ark_ff::PrimeField;
use sha3::{Digest, Keccak256};
use xsalsa20poly1305::{
    aead::{Aead, KeyInit},
    Key, Nonce, XSalsa20Poly1305,
};

use veil_types::{Error, Hex, Result};

use crate::edwards::{self, Point};
use crate::keys;
use crate::note::{self, NotePlaintext};

/// Nonce binding both parties' public keys.
fn memo_nonce(eph_pk: &Point, owner_pk: &Point) -> Result<[u8; 24]> {
    let mut input = [0u8; 64];
    input[0..32].copy_from_slice(&eph_pk.compress()?);
    input[32..64].copy_from_slice(&owner_pk.compress()?);

    let hash = Keccak256::digest(input);
    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(&hash[0..24]);
    Ok(nonce)
}

/// Seal a note for its owner. Returns 0x-hex of compress(E) || ciphertext.
pub fn seal(note_plain: &NotePlaintext) -> Result<Hex> {
    let encoded = note::encode(note_plain)?;

    let eph_sk = random_scalar();
    let eph_pk = edwards::mul_generator(&eph_sk);

    let shared = note_plain.owner_pk.mul(&eph_sk);
    let shared_key = shared.compress()?;

    let nonce_bytes = memo_nonce(&eph_pk, &note_plain.owner_pk)?;

    let cipher = XSalsa20Poly1305::new(Key::from_slice(&shared_key));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, encoded.as_slice())
        .map_err(|e| Error::crypto(format!("memo encryption failed: {}", e)))?;

    let mut sealed = Vec::with_capacity(32 + ciphertext.len());
    sealed.extend_from_slice(&eph_pk.compress()?);
    sealed.extend_from_slice(&ciphertext);

    Ok(format!("0x{}", hex::encode(sealed)))
}

/// Try to open a sealed memo with a viewing secret.
///
/// Returns `Ok(None)` when the memo is well-formed but not addressed to
/// this key (authentication failure), an error only on malformed input.
pub fn open(viewing_secret: &Fr, sealed_hex: &str) -> Result<Option<NotePlaintext>> {
    let hex_str = sealed_hex.strip_prefix("0x").unwrap_or(sealed_hex);
    let payload =
        hex::decode(hex_str).map_err(|e| Error::crypto(format!("invalid memo hex: {}", e)))?;

    // 32 bytes ephemeral pk + 16 bytes MAC minimum
    if payload.len() < 32 + 16 {
        return Ok(None);
    }

    let mut eph_compressed = [0u8; 32];
    eph_compressed.copy_from_slice(&payload[0..32]);
    let eph_pk = match Point::decompress(&eph_compressed) {
        Ok(p) => p,
        Err(_) => return Ok(None),
    };

    let ciphertext = &payload[32..];

    let owner_pk = edwards::mul_generator(viewing_secret);

    let shared = eph_pk.mul(viewing_secret);
    let shared_key = shared.compress()?;

    let nonce_bytes = memo_nonce(&eph_pk, &owner_pk)?;

    let cipher = XSalsa20Poly1305::new(Key::from_slice(&shared_key));
    let nonce = Nonce::from_slice(&nonce_bytes);
    match cipher.decrypt(nonce, ciphertext) {
        Ok(plaintext) => Ok(Some(note::decode(&plaintext)?)),
        Err(_) => Ok(None),
    }
}

/// Random scalar reduced into the subgroup order.
fn random_scalar() -> Fr {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);

    let val = Fr::from_le_bytes_mod_order(&bytes);
    let reduced = keys::bigint_mod(&val.into_bigint(), &edwards::subgroup_order());
    Fr::from_bigint(reduced).unwrap_or_else(|| Fr::from(1u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::derive_key_pair;

    fn sample_note(owner_pk: Point) -> NotePlaintext {
        NotePlaintext {
            asset_id: Fr::from(1u64),
            amount: Fr::from(1000u64),
            owner_pk,
            blinding: Fr::from(42u64),
            is_frozen: false,
        }
    }

    #[test]
    fn seal_open_roundtrip() {
        let kp = derive_key_pair("memo-roundtrip-seed", None).unwrap();
        let note_plain = sample_note(kp.public);

        let sealed = seal(&note_plain).unwrap();
        let opened = open(&kp.secret, &sealed).unwrap().expect("should open");

        assert_eq!(opened.asset_id, note_plain.asset_id);
        assert_eq!(opened.amount, note_plain.amount);
        assert_eq!(opened.owner_pk, note_plain.owner_pk);
        assert_eq!(opened.blinding, note_plain.blinding);
        assert_eq!(opened.is_frozen, note_plain.is_frozen);
    }

    #[test]
    fn wrong_key_does_not_open() {
        let owner = derive_key_pair("memo-owner-seed-x", None).unwrap();
        let other = derive_key_pair("memo-other-seed-x", None).unwrap();

        let sealed = seal(&sample_note(owner.public)).unwrap();
        assert!(open(&other.secret, &sealed).unwrap().is_none());
    }

    #[test]
    fn truncated_memo_is_not_an_error() {
        let kp = derive_key_pair("memo-truncated-seed", None).unwrap();
        assert!(open(&kp.secret, "0x0011223344").unwrap().is_none());
    }

    #[test]
    fn garbage_hex_is_an_error() {
        let kp = derive_key_pair("memo-garbage-seed0", None).unwrap();
        assert!(open(&kp.secret, "0xzz").is_err());
    }
}
