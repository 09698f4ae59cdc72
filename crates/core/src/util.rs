//! Small helpers shared across modules. Randomness here is not
//! cryptographic; it exists for jitter and salting, not security.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

fn seeded_hasher() -> impl Hasher {
    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64,
    );
    hasher
}

pub fn rand_u64() -> u64 {
    seeded_hasher().finish()
}

pub fn rand_percent() -> f32 {
    (seeded_hasher().finish() % 10_000) as f32 / 10_000.0
}

/// FNV-1a 64-bit. Deterministic and stable across processes, unlike
/// [`rand_u64`] above, which is why the pose signature uses this instead.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_is_stable() {
        assert_eq!(fnv1a_64(b"hello"), fnv1a_64(b"hello"));
        assert_ne!(fnv1a_64(b"hello"), fnv1a_64(b"hellp"));
    }

    #[test]
    fn fnv1a_known_vector() {
        // FNV-1a 64-bit of the empty string is the offset basis itself.
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
    }
}
