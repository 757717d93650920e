//! Fixed-seed hasher for the realm's deferred task queue.
//!
//! Task keys are small integers produced by the realm itself, so HashDoS
//! resistance buys nothing here. `FixedHashBuilder` is zero-sized, which
//! keeps the `IndexMap` that holds queued tasks free of per-map hasher state.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};

const SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Zero-sized `BuildHasher` backed by foldhash with a constant seed
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedHashBuilder;

impl BuildHasher for FixedHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(SEED).build_hasher()
    }
}
