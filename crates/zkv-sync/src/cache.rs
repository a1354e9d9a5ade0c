//! Decrypted record cache, one entry per owner.
//!
//! TTL-bounded (default 30s) with a capacity cap (default 50 owners). Over
//! capacity, the entry inserted earliest is evicted; reads do not refresh it.
//! Callers invalidate an owner before every mutating remote write.
//!
//! Every invalidation bumps the owner's generation. Readers take a
//! generation before listing and store through [`RecordCache::set_if_current`],
//! so a snapshot read before a write can never land after it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use zkv_core::config::CacheConfig;
use zkv_core::types::Record;

struct Entry {
    records: Vec<Record>,
    inserted_at: Instant,
}

/// Point-in-time marker for one owner's cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeneration {
    epoch: u64,
    owner: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    generations: HashMap<String, u64>,
    /// Bumped by `clear`
    epoch: u64,
}

impl State {
    fn generation(&self, owner_id: &str) -> CacheGeneration {
        CacheGeneration {
            epoch: self.epoch,
            owner: self.generations.get(owner_id).copied().unwrap_or(0),
        }
    }
}

pub struct RecordCache {
    state: Mutex<State>,
    ttl: Duration,
    max_owners: usize,
}

impl RecordCache {
    pub fn new(ttl: Duration, max_owners: usize) -> Self {
        RecordCache {
            state: Mutex::new(State::default()),
            ttl,
            max_owners: max_owners.max(1),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl(), config.max_owners)
    }

    /// A copy of the owner's records, or `None` if absent or expired.
    pub fn get(&self, owner_id: &str) -> Option<Vec<Record>> {
        let mut state = self.state.lock();
        let entries = &mut state.entries;
        match entries.get(owner_id) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.records.clone()),
            Some(_) => {
                entries.remove(owner_id);
                tracing::trace!(owner_id, "record cache entry expired");
                None
            }
            None => None,
        }
    }

    /// The owner's current generation. Take it before reading remote state.
    pub fn generation(&self, owner_id: &str) -> CacheGeneration {
        self.state.lock().generation(owner_id)
    }

    /// Store `records` only if nothing invalidated the owner since
    /// `generation` was taken. Returns whether the entry was written.
    pub fn set_if_current(
        &self,
        owner_id: &str,
        generation: CacheGeneration,
        records: &[Record],
    ) -> bool {
        let mut state = self.state.lock();
        if state.generation(owner_id) != generation {
            tracing::debug!(owner_id, "record cache invalidated during read; not storing");
            return false;
        }
        self.insert(&mut state, owner_id, records);
        true
    }

    /// Store unconditionally.
    pub fn set(&self, owner_id: &str, records: &[Record]) {
        let mut state = self.state.lock();
        self.insert(&mut state, owner_id, records);
    }

    fn insert(&self, state: &mut State, owner_id: &str, records: &[Record]) {
        let entries = &mut state.entries;
        entries.insert(
            owner_id.to_string(),
            Entry {
                records: records.to_vec(),
                inserted_at: Instant::now(),
            },
        );
        while entries.len() > self.max_owners {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(owner, _)| owner.clone());
            match oldest {
                Some(owner) => {
                    entries.remove(&owner);
                    tracing::debug!(evicted = %owner, "record cache over capacity");
                }
                None => break,
            }
        }
    }

    pub fn invalidate(&self, owner_id: &str) {
        let mut state = self.state.lock();
        state.entries.remove(owner_id);
        *state.generations.entry(owner_id.to_string()).or_insert(0) += 1;
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.generations.clear();
        state.epoch += 1;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}
