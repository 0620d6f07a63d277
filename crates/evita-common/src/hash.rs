//! Content hashing for query structures.
//!
//! Formula hashes are compared across sessions (two sessions issuing the same
//! query against the same index version must land on the same cache record),
//! so the hasher must not be randomly seeded per process start the way
//! `std::collections::HashMap` seeds its `RandomState`. We use `ahash` with
//! fixed seeds instead.
//!
//! These hashes are an identity tool for in-memory caching only. They are not
//! persisted and they are not a security primitive.

use std::hash::{BuildHasher, Hasher};

const SEED_0: u64 = 0x243f_6a88_85a3_08d3;
const SEED_1: u64 = 0x1319_8a2e_0370_7344;
const SEED_2: u64 = 0xa409_3822_299f_31d0;
const SEED_3: u64 = 0x082e_fa98_ec4e_6c89;

fn hasher() -> ahash::AHasher {
    ahash::RandomState::with_seeds(SEED_0, SEED_1, SEED_2, SEED_3).build_hasher()
}

/// Hash the UTF-8 bytes of a string.
pub fn hash_str(value: &str) -> u64 {
    let mut h = hasher();
    h.write(value.as_bytes());
    h.write_usize(value.len());
    h.finish()
}

/// Hash a sequence of longs; the order of the input matters.
pub fn hash_longs(values: &[u64]) -> u64 {
    let mut h = hasher();
    for v in values {
        h.write_u64(*v);
    }
    h.write_usize(values.len());
    h.finish()
}

/// Hash a multiset of longs; any permutation of the input yields the same hash.
pub fn hash_unordered_longs(values: &[u64]) -> u64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    hash_longs(&sorted)
}

/// Incremental builder for structural hashes.
///
/// Every hashed structure starts with a class id so that two different node
/// kinds with identical parameters never collide by construction.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    longs: Vec<u64>,
}

impl ContentHasher {
    pub fn new(class_id: u64) -> Self {
        Self {
            longs: vec![class_id],
        }
    }

    pub fn long(mut self, value: u64) -> Self {
        self.longs.push(value);
        self
    }

    pub fn signed(self, value: i64) -> Self {
        self.long(value as u64)
    }

    pub fn optional(self, value: Option<i64>) -> Self {
        match value {
            Some(v) => self.long(1).signed(v),
            None => self.long(0),
        }
    }

    pub fn str(self, value: &str) -> Self {
        self.long(hash_str(value))
    }

    /// Append child hashes in the given order.
    pub fn ordered(mut self, children: &[u64]) -> Self {
        self.longs.push(children.len() as u64);
        self.longs.extend_from_slice(children);
        self
    }

    /// Append child hashes so that their order does not influence the result.
    pub fn unordered(self, children: &[u64]) -> Self {
        let mut sorted = children.to_vec();
        sorted.sort_unstable();
        self.ordered(&sorted)
    }

    pub fn finish(self) -> u64 {
        hash_longs(&self.longs)
    }
}
