//! Shielded note plaintext: codec, commitment and nullifier hashes.
//!
//! Wire format is 5 ABI-style uint256 slots (160 bytes):
//!   [asset_id, amount, compressed_owner_pk, blinding, is_frozen(0/1)]
//!
//! commitment = Poseidon2 sequence over
//!   [pk.x, pk.y, blinding, asset_id, amount | frozen_bit] in the Record
//!   domain, where frozen_bit is bit 128 of the amount slot.
//! nullifier = Poseidon2(nullifier_key, commitment) in the Nullifier
//!   domain; the key is the owner secret directly, or an ECDH-derived key
//!   when a non-identity freezer is attached.

use ark_bn254::Fr;
use ark_ff::{BigInteger, BigInteger256, PrimeField};
use veil_types::{Error, Result};

use crate::edwards::Point;
use crate::poseidon::{self, HashDomain};

/// A decrypted note.
#[derive(Debug, Clone)]
pub struct NotePlaintext {
    pub asset_id: Fr,
    pub amount: Fr,
    pub owner_pk: Point,
    pub blinding: Fr,
    pub is_frozen: bool,
}

const ENCODED_LEN: usize = 160;

/// Encode a note to its 160-byte wire form.
pub fn encode(note: &NotePlaintext) -> Result<Vec<u8>> {
    let compressed = note.owner_pk.compress()?;

    let mut out = Vec::with_capacity(ENCODED_LEN);
    out.extend_from_slice(&field_to_be_bytes(&note.asset_id));
    out.extend_from_slice(&field_to_be_bytes(&note.amount));
    // The compressed-point slot keeps the compression bytes as-is.
    out.extend_from_slice(&compressed);
    out.extend_from_slice(&field_to_be_bytes(&note.blinding));
    let mut frozen_slot = [0u8; 32];
    if note.is_frozen {
        frozen_slot[31] = 1;
    }
    out.extend_from_slice(&frozen_slot);

    Ok(out)
}

/// Decode the 160-byte wire form.
pub fn decode(data: &[u8]) -> Result<NotePlaintext> {
    if data.len() != ENCODED_LEN {
        return Err(Error::crypto(format!(
            "note data must be {} bytes, got {}",
            ENCODED_LEN,
            data.len()
        )));
    }

    let asset_id = be_bytes_to_field(&data[0..32]);
    let amount = be_bytes_to_field(&data[32..64]);

    let mut compressed = [0u8; 32];
    compressed.copy_from_slice(&data[64..96]);
    let owner_pk = Point::decompress(&compressed)?;

    let blinding = be_bytes_to_field(&data[96..128]);
    let is_frozen = data[159] == 1;

    Ok(NotePlaintext {
        asset_id,
        amount,
        owner_pk,
        blinding,
        is_frozen,
    })
}

/// Commitment hash over the note opening.
pub fn commitment(note: &NotePlaintext) -> Fr {
    let mut amount = note.amount;
    if note.is_frozen {
        // amount |= 1 << 128
        let frozen_bit = Fr::from_bigint(BigInteger256::new([0, 0, 1, 0])).unwrap();
        amount += frozen_bit;
    }

    let inputs = [
        note.owner_pk.x,
        note.owner_pk.y,
        note.blinding,
        note.asset_id,
        amount,
    ];
    poseidon::hash_sequence(&inputs, HashDomain::Record, None)
}

/// Nullifier for a commitment.
///
/// With no freezer (or the identity freezer) the owner secret is the
/// nullifier key; otherwise the key is derived from the ECDH shared point
/// with the freezer public key.
pub fn nullifier(owner_secret: &Fr, commitment: &Fr, freezer_pk: Option<Point>) -> Fr {
    let nullifier_key = match freezer_pk {
        None => *owner_secret,
        Some(fp) if fp.is_identity() => *owner_secret,
        Some(fp) => {
            let shared = fp.mul(owner_secret);
            poseidon::hash_pair(shared.x, shared.y, HashDomain::KeyDerivation)
        }
    };

    poseidon::hash_pair(nullifier_key, *commitment, HashDomain::Nullifier)
}

/// Pool identifier: Poseidon2 sequence over the token address and the
/// viewer / freezer public keys in the Asset domain.
pub fn pool_asset_id(token: Fr, viewer_pk: &Point, freezer_pk: &Point) -> Fr {
    let inputs = [token, viewer_pk.x, viewer_pk.y, freezer_pk.x, freezer_pk.y];
    poseidon::hash_sequence(&inputs, HashDomain::Asset, None)
}

/// Fresh random blinding factor.
pub fn random_blinding() -> Fr {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    Fr::from_le_bytes_mod_order(&bytes)
}

fn field_to_be_bytes(f: &Fr) -> [u8; 32] {
    let bytes = f.into_bigint().to_bytes_be();
    let mut result = [0u8; 32];
    let offset = 32usize.saturating_sub(bytes.len());
    result[offset..].copy_from_slice(&bytes);
    result
}

fn be_bytes_to_field(data: &[u8]) -> Fr {
    let mut padded = [0u8; 32];
    let offset = 32usize.saturating_sub(data.len());
    padded[offset..].copy_from_slice(data);
    padded.reverse();
    Fr::from_le_bytes_mod_order(&padded)
}
