//! # Cache Module
//!
//! Short-TTL read-through cache in front of the aggregation engine. The TTL
//! only bounds read load from polling clients; freshness after a timer
//! mutation comes from explicit invalidation.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::error::{Result, TrackerError};
use crate::models::{AggregateResult, Scope};

/// Default cache TTL in seconds
pub const CACHE_TTL_SECONDS: i64 = 30;

/// Cache of aggregate results keyed by scope.
///
/// Reads and writes are best effort: a failing backend degrades to a miss.
/// Every scope carries a generation that `invalidate` bumps, and `set` only
/// stores when the generation it was given is still current. Invalidation
/// reports failures so callers can react.
pub trait AggregateCache: Send + Sync {
    fn get(&self, scope: &Scope) -> Option<AggregateResult>;
    /// Current generation of `scope`, or `None` when the backend can't tell.
    fn generation(&self, scope: &Scope) -> Option<u64>;
    /// Store `value` if `scope` is still at `generation`. Returns whether it was stored.
    fn set(&self, scope: &Scope, value: &AggregateResult, generation: u64) -> bool;
    fn invalidate(&self, scope: &Scope) -> Result<()>;
}

/// Return the cached aggregate for `scope`, computing and storing it on a miss.
///
/// The generation is read before computing, so a result that raced with an
/// invalidation is returned to the caller but never stored.
pub fn read_through<F>(cache: &dyn AggregateCache, scope: &Scope, compute: F) -> Result<AggregateResult>
where
    F: FnOnce() -> Result<AggregateResult>,
{
    if let Some(hit) = cache.get(scope) {
        debug!("aggregate cache hit for {scope}");
        return Ok(hit);
    }
    debug!("aggregate cache miss for {scope}");
    let generation = cache.generation(scope);
    let value = compute()?;
    match generation {
        Some(generation) if cache.set(scope, &value, generation) => {}
        _ => debug!("aggregate for {scope} not cached"),
    }
    Ok(value)
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: AggregateResult,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Scope, CacheEntry>,
    generations: HashMap<Scope, u64>,
}

/// Process-local cache with per-entry expiry.
pub struct MemoryCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ttl,
            clock,
        }
    }

    /// (total entries, entries not yet expired)
    pub fn stats(&self) -> (usize, usize) {
        let now = self.clock.now();
        match self.state.lock() {
            Ok(state) => {
                let valid = state.entries.values().filter(|e| e.expires_at > now).count();
                (state.entries.len(), valid)
            }
            Err(_) => (0, 0),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.clear();
        }
    }
}

impl AggregateCache for MemoryCache {
    fn get(&self, scope: &Scope) -> Option<AggregateResult> {
        let now = self.clock.now();
        let state = self.state.lock().ok()?;
        let entry = state.entries.get(scope)?;
        if entry.expires_at > now {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn generation(&self, scope: &Scope) -> Option<u64> {
        let state = self.state.lock().ok()?;
        Some(state.generations.get(scope).copied().unwrap_or(0))
    }

    fn set(&self, scope: &Scope, value: &AggregateResult, generation: u64) -> bool {
        let now = self.clock.now();
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.generations.get(scope).copied().unwrap_or(0) != generation {
            return false;
        }
        // Clean up expired entries while we have the lock
        state.entries.retain(|_, entry| entry.expires_at > now);
        state.entries.insert(
            scope.clone(),
            CacheEntry {
                value: value.clone(),
                expires_at: now + self.ttl,
            },
        );
        true
    }

    fn invalidate(&self, scope: &Scope) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TrackerError::Persistence("aggregate cache lock poisoned".into()))?;
        state.entries.remove(scope);
        *state.generations.entry(scope.clone()).or_insert(0) += 1;
        Ok(())
    }
}

/// Cache that never holds anything; every read goes to the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl AggregateCache for NoCache {
    fn get(&self, _scope: &Scope) -> Option<AggregateResult> {
        None
    }

    fn generation(&self, _scope: &Scope) -> Option<u64> {
        None
    }

    fn set(&self, _scope: &Scope, _value: &AggregateResult, _generation: u64) -> bool {
        false
    }

    fn invalidate(&self, _scope: &Scope) -> Result<()> {
        Ok(())
    }
}
