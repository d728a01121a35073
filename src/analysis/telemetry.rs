use crate::store::CallKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassKind {
    /// No schedule attached: full trace recorded, nothing evicted.
    Trial,
    /// Schedule attached: evictions applied as their buckets are reached.
    Production,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassStats {
    pub kind: PassKind,
    pub horizon: usize,
    /// Calls whose body actually ran.
    pub events: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    /// Bodies re-run because their value had been evicted.
    pub recomputations: usize,
    pub evictions: usize,
    pub peak_resident: usize,
    pub peak_resident_bytes: usize,
    /// Entries still cached when the pass ended.
    pub final_resident: usize,
    pub max_depth: usize,
}

impl PassStats {
    pub fn new(kind: PassKind, horizon: usize) -> Self {
        Self {
            kind,
            horizon,
            events: 0,
            cache_hits: 0,
            cache_misses: 0,
            recomputations: 0,
            evictions: 0,
            peak_resident: 0,
            peak_resident_bytes: 0,
            final_resident: 0,
            max_depth: 0,
        }
    }

    /// Fraction of reads served from cache. Zero when nothing was read.
    pub fn hit_rate(&self) -> f64 {
        let reads = self.cache_hits + self.cache_misses;
        if reads == 0 { 0.0 } else { self.cache_hits as f64 / reads as f64 }
    }
}

/// How many times each key missed the cache during a pass.
///
/// In a well-formed production pass every key misses at most once; anything
/// higher means a value was evicted while still wanted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissCounter {
    counts: HashMap<CallKey, u32>,
}

impl MissCounter {
    pub fn record(&mut self, key: CallKey) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    pub fn get(&self, key: &CallKey) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn max(&self) -> u32 {
        self.counts.values().copied().max().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().map(|&c| c as u64).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CallKey, &u32)> {
        self.counts.iter()
    }

    pub fn len(&self) -> usize { self.counts.len() }
    pub fn is_empty(&self) -> bool { self.counts.is_empty() }
}
