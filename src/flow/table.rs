//! Sharded flow table
//!
//! Keys are spread over a power-of-two number of shards, each behind its own
//! lock. A shard stores its flows in a dense slot vector with a key -> slot
//! index, so eviction candidates can be sampled without walking a map.
//!
//! Capacity is table-wide: a live counter reserves a slot before a new key
//! is inserted. When the table is full the oldest flow among the sampled
//! shards is evicted and its slot handed to the new key. At most one shard
//! lock is held at any time.
//!
//! Every removal (close, expiry, eviction, drain) happens while the shard
//! lock is held, which is what makes finalization exactly-once.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error};

use crate::core::FlowKey;
use crate::error::{FlowError, Result};
use super::accumulator::FlowState;
use super::record::EndReason;
use super::FlowConfig;

/// Slots sampled per shard when looking for an eviction victim
const EVICTION_SAMPLE: usize = 16;

/// Shards inspected per eviction
const EVICTION_SHARDS: usize = 8;

/// Admission attempts before a new key is rejected
const ADMIT_ATTEMPTS: usize = 4;

#[derive(Default)]
struct Shard {
    index: HashMap<FlowKey, usize>,
    slots: Vec<FlowState>,
    evict_cursor: usize,
}

impl Shard {
    fn insert(&mut self, state: FlowState) -> usize {
        let slot = self.slots.len();
        self.index.insert(state.key, slot);
        self.slots.push(state);
        slot
    }

    fn remove_slot(&mut self, slot: usize) -> FlowState {
        let state = self.slots.swap_remove(slot);
        self.index.remove(&state.key);
        if let Some(moved) = self.slots.get(slot) {
            self.index.insert(moved.key, slot);
        }
        state
    }

    /// Oldest-by-last-packet slot among a sample of the shard
    fn eviction_candidate(&mut self) -> Option<usize> {
        let len = self.slots.len();
        if len <= EVICTION_SAMPLE {
            return (0..len).min_by_key(|&i| self.slots[i].last_seen);
        }

        let step = len / EVICTION_SAMPLE;
        let start = self.evict_cursor % len;
        self.evict_cursor = self.evict_cursor.wrapping_add(1);
        (0..EVICTION_SAMPLE)
            .map(|i| (start + i * step) % len)
            .min_by_key(|&i| self.slots[i].last_seen)
    }
}

/// Identity of an eviction victim, re-checked before removal
struct Victim {
    shard: usize,
    key: FlowKey,
    id: u64,
    last_seen: DateTime<Utc>,
}

/// Concurrent map from flow key to live flow state
pub struct FlowTable {
    shards: Box<[Mutex<Shard>]>,
    shard_mask: usize,
    capacity: usize,
    /// Live flows plus admissions in progress
    live: AtomicUsize,
    evict_cursor: AtomicUsize,
    activity_timeout_us: u64,
    hasher: RandomState,
    next_id: AtomicU64,
}

/// Exclusive access to one live flow
///
/// Holds the shard lock for as long as it lives. Dereferences to the
/// [`FlowState`] so the caller can fold a packet in, then either drops the
/// handle or detaches the flow with [`FlowHandle::remove_for_finalize`].
pub struct FlowHandle<'a> {
    table: &'a FlowTable,
    guard: MutexGuard<'a, Shard>,
    slot: usize,
    created: bool,
    evicted: Option<FlowState>,
}

impl<'a> FlowHandle<'a> {
    /// True when this call admitted the key into the table
    pub fn is_new(&self) -> bool {
        self.created
    }

    /// Flow displaced to make room for this one, if any
    pub fn take_evicted(&mut self) -> Option<FlowState> {
        self.evicted.take()
    }

    /// Detach the flow while still holding the shard lock
    pub fn remove_for_finalize(mut self) -> FlowState {
        let state = self.guard.remove_slot(self.slot);
        self.table.release(1);
        state
    }

    /// Swap the flow for a fresh one under the same key, returning the old
    /// state for finalization
    pub fn restart(&mut self, now: DateTime<Utc>) -> FlowState {
        let fresh = self.table.new_state(self.key, now);
        self.created = true;
        std::mem::replace(&mut self.guard.slots[self.slot], fresh)
    }
}

impl Deref for FlowHandle<'_> {
    type Target = FlowState;

    fn deref(&self) -> &FlowState {
        &self.guard.slots[self.slot]
    }
}

impl DerefMut for FlowHandle<'_> {
    fn deref_mut(&mut self) -> &mut FlowState {
        &mut self.guard.slots[self.slot]
    }
}

impl FlowTable {
    /// Create a table sized from the flow configuration
    pub fn new(config: &FlowConfig) -> Self {
        let shard_count = config.shard_count();
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(
            "Flow table: {} shards, capacity {}",
            shard_count, config.table_capacity
        );

        Self {
            shards,
            shard_mask: shard_count - 1,
            capacity: config.table_capacity.max(1),
            live: AtomicUsize::new(0),
            evict_cursor: AtomicUsize::new(0),
            activity_timeout_us: config.activity_timeout_us(),
            hasher: RandomState::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Upper bound on live flows
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn shard_index(&self, key: &FlowKey) -> usize {
        (self.hasher.hash_one(key) as usize) & self.shard_mask
    }

    fn new_state(&self, key: FlowKey, now: DateTime<Utc>) -> FlowState {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        FlowState::new(id, key, now, self.activity_timeout_us)
    }

    fn release(&self, n: usize) {
        if n > 0 {
            self.live.fetch_sub(n, Ordering::AcqRel);
        }
    }

    /// Reserve one slot below capacity
    fn try_reserve(&self) -> bool {
        let mut live = self.live.load(Ordering::Acquire);
        while live < self.capacity {
            match self
                .live
                .compare_exchange_weak(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => live = current,
            }
        }
        false
    }

    /// Secure a slot for a new key, evicting if the table is full
    ///
    /// An evicted flow's slot passes straight to the new key, so the live
    /// count is unchanged in that case. Must be called with no shard lock
    /// held.
    fn admit(&self, shard: usize) -> Result<Option<FlowState>> {
        for _ in 0..ADMIT_ATTEMPTS {
            if self.try_reserve() {
                return Ok(None);
            }
            if let Some(victim) = self.evict_oldest() {
                return Ok(Some(victim));
            }
        }
        Err(FlowError::EvictionFailed { shard })
    }

    /// Remove the oldest flow among the sampled shards
    ///
    /// Shards are inspected one lock at a time; `None` when nothing was
    /// found or the chosen flow changed before it could be removed.
    fn evict_oldest(&self) -> Option<FlowState> {
        let inspect = self.shards.len().min(EVICTION_SHARDS);
        let start = self.evict_cursor.fetch_add(inspect, Ordering::Relaxed);

        let mut oldest: Option<Victim> = None;
        for i in 0..inspect {
            let shard = (start + i) & self.shard_mask;
            let mut guard = self.shards[shard].lock();
            if let Some(slot) = guard.eviction_candidate() {
                let state = &guard.slots[slot];
                if oldest.as_ref().map_or(true, |v| state.last_seen < v.last_seen) {
                    oldest = Some(Victim {
                        shard,
                        key: state.key,
                        id: state.id,
                        last_seen: state.last_seen,
                    });
                }
            }
        }

        let victim = oldest?;
        let mut guard = self.shards[victim.shard].lock();
        let slot = guard.index.get(&victim.key).copied()?;
        let current = &guard.slots[slot];
        if current.id != victim.id || current.last_seen != victim.last_seen {
            return None;
        }
        let state = guard.remove_slot(slot);
        debug!("Evicted flow {} ({}) from shard {}", state.id, state.key, victim.shard);
        Some(state)
    }

    /// Look up the flow for `key`, admitting it if absent
    ///
    /// A full table evicts its oldest sampled flow first; the displaced state
    /// is handed back through [`FlowHandle::take_evicted`].
    pub fn get_or_create_for_update(&self, key: FlowKey, now: DateTime<Utc>) -> Result<FlowHandle<'_>> {
        let shard = self.shard_index(&key);

        let guard = self.shards[shard].lock();
        let existing = guard.index.get(&key).copied();
        if let Some(slot) = existing {
            return Ok(FlowHandle {
                table: self,
                guard,
                slot,
                created: false,
                evicted: None,
            });
        }
        drop(guard);

        let evicted = self.admit(shard)?;

        let mut guard = self.shards[shard].lock();
        let existing = guard.index.get(&key).copied();
        if let Some(slot) = existing {
            // Another worker admitted the key meanwhile; give the slot back
            self.release(1);
            return Ok(FlowHandle {
                table: self,
                guard,
                slot,
                created: false,
                evicted,
            });
        }

        let slot = guard.insert(self.new_state(key, now));
        Ok(FlowHandle {
            table: self,
            guard,
            slot,
            created: true,
            evicted,
        })
    }

    /// Atomically detach the flow for `key`
    ///
    /// A key that is not live is an invariant violation: the caller believed
    /// it owned a flow that someone else already finalized.
    pub fn remove_for_finalize(&self, key: &FlowKey) -> Result<FlowState> {
        let mut guard = self.shards[self.shard_index(key)].lock();
        match guard.index.get(key).copied() {
            Some(slot) => {
                let state = guard.remove_slot(slot);
                self.release(1);
                Ok(state)
            }
            None => {
                error!("Finalize requested for {} which is not in the flow table", key);
                Err(FlowError::Invariant(format!("finalize of absent flow {}", key)))
            }
        }
    }

    /// Detach every flow idle for longer than `idle_timeout_us` or older than
    /// `max_lifetime_us` at `now`
    pub fn sweep_expired(
        &self,
        now: DateTime<Utc>,
        idle_timeout_us: u64,
        max_lifetime_us: u64,
    ) -> Vec<(FlowState, EndReason)> {
        let mut expired = Vec::new();

        for shard in self.shards.iter() {
            let mut guard = shard.lock();
            let before = expired.len();
            // Walk backwards so swap_remove only moves already-visited slots
            for slot in (0..guard.slots.len()).rev() {
                if let Some(reason) = guard.slots[slot].expiry_reason(now, idle_timeout_us, max_lifetime_us) {
                    expired.push((guard.remove_slot(slot), reason));
                }
            }
            self.release(expired.len() - before);
        }

        expired
    }

    /// Detach every live flow
    pub fn drain_all(&self) -> Vec<FlowState> {
        let mut drained = Vec::new();
        for shard in self.shards.iter() {
            let mut guard = shard.lock();
            guard.index.clear();
            self.release(guard.slots.len());
            drained.append(&mut guard.slots);
        }
        drained
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.shards[self.shard_index(key)].lock().index.contains_key(key)
    }

    /// Current number of live flows
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().slots.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
