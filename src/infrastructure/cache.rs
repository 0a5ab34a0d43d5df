use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error};

use crate::domain::market::candle::{Candle, VisibleRange};
use crate::domain::market::timeframe::Timeframe;

const DEFAULT_CAPACITY: usize = 32;
const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Deterministic key over everything that determines an analysis result.
///
/// Candle count and last timestamp are folded in, so fresh candle data
/// produces a new fingerprint and stale cache entries are never served for
/// a chart that has moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn compute(
        symbol: &str,
        timeframe: Timeframe,
        range: &VisibleRange,
        config_digest: u64,
        candles: &[Candle],
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        timeframe.hash(&mut hasher);
        range.from_ts.hash(&mut hasher);
        range.to_ts.hash(&mut hasher);
        config_digest.hash(&mut hasher);
        candles.len().hash(&mut hasher);
        if let Some(last) = candles.last() {
            last.timestamp.hash(&mut hasher);
        }
        Self(hasher.finish())
    }
}

/// Lifetime counters; every lookup ends as exactly one hit or one miss,
/// `coalesced` additionally counts lookups that waited on an in-flight
/// computation.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

struct CacheEntry<T> {
    value: Arc<T>,
    inserted_at: Instant,
}

struct CacheState<T> {
    entries: HashMap<Fingerprint, CacheEntry<T>>,
    insertion_order: VecDeque<Fingerprint>,
    in_flight: HashSet<Fingerprint>,
    hits: u64,
    misses: u64,
    coalesced: u64,
}

impl<T> CacheState<T> {
    fn remove(&mut self, fingerprint: Fingerprint) {
        self.entries.remove(&fingerprint);
        self.insertion_order.retain(|other| *other != fingerprint);
    }
}

/// Bounded TTL cache for analysis results with request coalescing.
///
/// At most one computation runs per fingerprint: concurrent lookups for the
/// same key block until the in-flight computation finishes and then serve
/// its value. A failed computation releases the key so the next caller can
/// retry. Constructed once at startup and shared by handle.
pub struct AnalyzerCache<T> {
    state: Mutex<CacheState<T>>,
    computed: Condvar,
    capacity: usize,
    ttl: Duration,
}

impl<T> Default for AnalyzerCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl<T> AnalyzerCache<T> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
                in_flight: HashSet::new(),
                hits: 0,
                misses: 0,
                coalesced: 0,
            }),
            computed: Condvar::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Returns the cached value for `fingerprint`, computing it via
    /// `compute` on a miss. `compute` runs outside the cache lock.
    pub fn get_or_compute<F>(&self, fingerprint: Fingerprint, compute: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut state = self.lock_state();
        let mut waited = false;
        loop {
            if let Some(entry) = state.entries.get(&fingerprint) {
                if entry.inserted_at.elapsed() < self.ttl {
                    let value = Arc::clone(&entry.value);
                    state.hits += 1;
                    return Ok(value);
                }
                debug!("AnalyzerCache: Entry {:?} expired", fingerprint);
                state.remove(fingerprint);
            }
            if state.in_flight.contains(&fingerprint) {
                if !waited {
                    state.coalesced += 1;
                    waited = true;
                }
                state = match self.computed.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                continue;
            }
            break;
        }

        state.misses += 1;
        state.in_flight.insert(fingerprint);
        drop(state);

        let result = compute();

        let mut state = self.lock_state();
        state.in_flight.remove(&fingerprint);
        let outcome = match result {
            Ok(value) => {
                let value = Arc::new(value);
                self.insert_locked(&mut state, fingerprint, Arc::clone(&value));
                Ok(value)
            }
            Err(error) => Err(error),
        };
        drop(state);
        // Wake waiters in both cases; after a failure they recompute.
        self.computed.notify_all();
        outcome
    }

    /// Drops every cached value. Counters are lifetime stats and survive.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.entries.clear();
        state.insertion_order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock_state();
        let total = state.hits + state.misses;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            coalesced: state.coalesced,
            entries: state.entries.len(),
            hit_rate: if total > 0 {
                state.hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    fn insert_locked(
        &self,
        state: &mut MutexGuard<'_, CacheState<T>>,
        fingerprint: Fingerprint,
        value: Arc<T>,
    ) {
        if !state.entries.contains_key(&fingerprint) {
            while state.entries.len() >= self.capacity {
                let Some(oldest) = state.insertion_order.pop_front() else {
                    break;
                };
                debug!("AnalyzerCache: Evicting {:?} at capacity", oldest);
                state.entries.remove(&oldest);
            }
            state.insertion_order.push_back(fingerprint);
        }
        state.entries.insert(
            fingerprint,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("AnalyzerCache: Lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
