//! Stable hashing helpers.
//!
//! Grounded on `hurry/src/cargo/fingerprint.rs`'s `util_hash_u64`, which
//! hashes through `rustc_stable_hash::StableSipHasher128` rather than
//! `std::collections::hash_map::DefaultHasher` — the latter is explicitly
//! *not* guaranteed stable across Rust versions or machines, which would
//! violate the cross-machine determinism invariant (spec §8).

use std::hash::{Hash, Hasher};

use rustc_stable_hash::StableSipHasher128;

/// Hash a single value to a stable `u64`, matching the teacher's
/// `util_hash_u64`.
pub fn stable_hash_u64<H: Hash>(value: &H) -> u64 {
    let mut hasher = StableSipHasher128::new();
    value.hash(&mut hasher);
    Hasher::finish(&hasher)
}

/// Hash a value to a full 256-bit digest by running four independent,
/// domain-separated stable hashes (only `Hasher::finish() -> u64` is part of
/// the trait's public contract, so four 64-bit lanes compose a 32-byte
/// digest rather than relying on a wider, hasher-specific output).
pub fn stable_hash_256<H: Hash>(value: &H) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    for (lane, chunk) in bytes.chunks_mut(8).enumerate() {
        let mut hasher = StableSipHasher128::new();
        (lane as u8).hash(&mut hasher);
        value.hash(&mut hasher);
        chunk.copy_from_slice(&Hasher::finish(&hasher).to_le_bytes());
    }
    bytes
}
