//! Staleness tracking for server-backed views.
//!
//! After a confirmed write the writer calls [`InvalidationBus::invalidate`]
//! for every view the write could affect. Views refetch when stale and mark
//! themselves fresh with the generation they observed when the fetch
//! started, so an invalidation that lands mid-fetch is never lost.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

/// Server-backed view that can go stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// Recent committed sales (terminal history, shift totals).
    RecentTransactions,
    /// Expense ledger listing.
    ExpensePage,
}

/// Broadcast when a view is invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub key: QueryKey,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct KeyState {
    generation: u64,
    fresh_generation: u64,
}

impl Default for KeyState {
    fn default() -> Self {
        // Never fetched: stale until the first mark_fresh.
        Self {
            generation: 1,
            fresh_generation: 0,
        }
    }
}

/// Tracks which views need a refetch.
pub struct InvalidationBus {
    keys: Mutex<HashMap<QueryKey, KeyState>>,
    tx: broadcast::Sender<Invalidation>,
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            keys: Mutex::new(HashMap::new()),
            tx,
        }
    }

    fn with_state<T>(&self, key: &QueryKey, f: impl FnOnce(&mut KeyState) -> T) -> T {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        f(keys.entry(key.clone()).or_default())
    }

    /// Mark `key` stale and notify subscribers. Returns the new generation.
    pub fn invalidate(&self, key: QueryKey) -> u64 {
        let generation = self.with_state(&key, |state| {
            state.generation += 1;
            state.generation
        });
        debug!(?key, generation, "View invalidated");
        // No subscribers is fine; staleness is still recorded.
        let _ = self.tx.send(Invalidation { key, generation });
        generation
    }

    /// Generation to pass to [`Self::mark_fresh`] once a fetch started now
    /// completes.
    pub fn generation(&self, key: &QueryKey) -> u64 {
        self.with_state(key, |state| state.generation)
    }

    /// Record that data as of `observed` generation is now displayed.
    pub fn mark_fresh(&self, key: &QueryKey, observed: u64) {
        self.with_state(key, |state| {
            state.fresh_generation = state.fresh_generation.max(observed);
        });
    }

    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.with_state(key, |state| state.fresh_generation < state.generation)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.tx.subscribe()
    }
}
