//! Deterministic splittable random keys
//!
//! An [`RngStream`] owns one [`RngKey`]. Every split consumes the stream and
//! returns the requested subkeys together with a stream advanced to a fresh
//! key, so a key is never handed out twice. Children are derived with
//! SHA-256 from the parent key and a child index, which makes the whole
//! sequence a pure function of the seed and the sequence of split calls.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const SPLIT_DOMAIN: &[u8] = b"shardtrain-split";

/// Two-word opaque seed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RngKey([u32; 2]);

impl RngKey {
    /// Root key for a seed
    pub fn from_seed(seed: u64) -> Self {
        Self([(seed >> 32) as u32, seed as u32])
    }

    pub fn words(&self) -> [u32; 2] {
        self.0
    }

    fn derive(&self, tag: u8, data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SPLIT_DOMAIN);
        hasher.update(self.0[0].to_le_bytes());
        hasher.update(self.0[1].to_le_bytes());
        hasher.update([tag]);
        hasher.update(data);
        let digest = hasher.finalize();
        let word = |i: usize| u32::from_le_bytes([digest[i], digest[i + 1], digest[i + 2], digest[i + 3]]);
        Self([word(0), word(4)])
    }

    /// Child `index` of this key
    fn child(&self, index: u64) -> Self {
        self.derive(0, &index.to_le_bytes())
    }

    /// Seeded generator for consumers that need a stream of numbers
    pub fn to_rng(&self) -> StdRng {
        StdRng::seed_from_u64(((self.0[0] as u64) << 32) | self.0[1] as u64)
    }

    /// Derive a key for a named sub-purpose without consuming the stream
    ///
    /// Used to give each parameter of a model its own initializer key.
    pub fn fold_in(&self, name: &str) -> Self {
        self.derive(1, name.as_bytes())
    }
}

impl fmt::Display for RngKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}{:08x}", self.0[0], self.0[1])
    }
}

/// Single-owner sequence of keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RngStream {
    key: RngKey,
}

impl RngStream {
    pub fn new(seed: u64) -> Self {
        Self {
            key: RngKey::from_seed(seed),
        }
    }

    /// Continue a stream from a persisted key
    pub fn from_key(key: RngKey) -> Self {
        Self { key }
    }

    /// The key the next split will consume
    pub fn key(&self) -> RngKey {
        self.key
    }

    pub fn split(self) -> (RngKey, RngStream) {
        let sub = self.key.child(1);
        (sub, RngStream { key: self.key.child(0) })
    }

    pub fn split_many(self, n: usize) -> (Vec<RngKey>, RngStream) {
        let subs = (1..=n as u64).map(|i| self.key.child(i)).collect();
        (subs, RngStream { key: self.key.child(0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::Rng;
    use std::collections::HashSet;

    #[test]
    fn test_split_matches_first_of_split_many() {
        let (a, next_a) = RngStream::new(7).split();
        let (many, next_b) = RngStream::new(7).split_many(3);
        assert_eq!(a, many[0]);
        assert_eq!(next_a, next_b);
    }

    #[test]
    fn test_keys_are_not_reused() {
        let mut stream = RngStream::new(0);
        let mut seen = HashSet::new();
        seen.insert(stream.key());
        for _ in 0..200 {
            let (subs, next) = stream.split_many(2);
            for key in subs {
                assert!(seen.insert(key), "duplicate key {key}");
            }
            assert!(seen.insert(next.key()));
            stream = next;
        }
    }

    #[test]
    fn test_different_seeds_differ() {
        let (a, _) = RngStream::new(1).split();
        let (b, _) = RngStream::new(2).split();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fold_in_is_name_sensitive() {
        let key = RngKey::from_seed(3);
        assert_eq!(key.fold_in("lm.table"), key.fold_in("lm.table"));
        assert_ne!(key.fold_in("lm.table"), key.fold_in("lm.bias"));
    }

    #[test]
    fn test_to_rng_is_reproducible() {
        let key = RngKey::from_seed(11);
        let (mut r1, mut r2) = (key.to_rng(), key.to_rng());
        let a: Vec<f32> = (0..4).map(|_| r1.random()).collect();
        let b: Vec<f32> = (0..4).map(|_| r2.random()).collect();
        assert_eq!(a, b);
    }

    fn expected_child(parent: [u32; 2], index: u64) -> [u32; 2] {
        let mut hasher = Sha256::new();
        hasher.update(b"shardtrain-split");
        hasher.update(parent[0].to_le_bytes());
        hasher.update(parent[1].to_le_bytes());
        hasher.update([0u8]);
        hasher.update(index.to_le_bytes());
        let digest = hasher.finalize();
        [
            u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]),
            u32::from_le_bytes([digest[4], digest[5], digest[6], digest[7]]),
        ]
    }

    #[test]
    fn test_child_keys_are_truncated_sha256() {
        let parent = RngKey::from_seed((3u64 << 32) | 4);
        assert_eq!(parent.words(), [3, 4]);

        let (subs, next) = RngStream::from_key(parent).split_many(2);
        assert_eq!(subs[0].words(), expected_child([3, 4], 1));
        assert_eq!(subs[1].words(), expected_child([3, 4], 2));
        assert_eq!(next.key().words(), expected_child([3, 4], 0));
    }

    #[test]
    fn test_key_serializes_as_two_words() {
        let key = RngKey::from_seed((5u64 << 32) | 9);
        assert_eq!(serde_json::to_string(&key).unwrap(), "[5,9]");
    }

    proptest! {
        #[test]
        fn prop_replay_reproduces_keys(seed in any::<u64>(), calls in proptest::collection::vec(1usize..4, 1..20)) {
            let run = |calls: &[usize]| {
                let mut stream = RngStream::new(seed);
                let mut out = Vec::new();
                for &n in calls {
                    let (subs, next) = stream.split_many(n);
                    out.extend(subs);
                    stream = next;
                }
                out
            };
            prop_assert_eq!(run(&calls), run(&calls));
        }
    }
}
