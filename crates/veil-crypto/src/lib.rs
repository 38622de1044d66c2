//! Cryptographic primitives for the Veil SDK.
//!
//! Everything the wallet core needs from the proof system's native field:
//! the Poseidon2 permutation with domain separation, the twisted Edwards
//! embedded curve, seed-based key derivation, the note codec, sealed memos,
//! and the commitment / nullifier hashes built on top.

pub mod edwards;
pub mod keys;
pub mod memo;
pub mod note;
pub mod poseidon;
