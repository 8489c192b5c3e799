//! Ring-sharded counters.
//!
//! A [`CounterGroup`] holds up to 16 counters per shard, one cache-line
//! aligned shard per ring. Dispatcher threads bind themselves to their
//! ring's shard; other threads (callers polling synchronously, producers)
//! land on a shard chosen from their thread-local address. [`Counter`]
//! names one slot of a group and implements [`metriken::Metric`].

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

const SLOTS: usize = 16;
const NUM_SHARDS: usize = 64;

thread_local! {
    static RING_SHARD: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Bind the current thread's counter updates to `ring`'s shard.
pub(crate) fn bind_ring_shard(ring: usize) {
    RING_SHARD.set(Some(ring % NUM_SHARDS));
}

#[repr(C, align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

pub struct CounterGroup {
    shards: [Shard; NUM_SHARDS],
}

impl CounterGroup {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const SHARD: Shard = Shard {
            slots: [ZERO; SLOTS],
        };
        Self {
            shards: [SHARD; NUM_SHARDS],
        }
    }

    #[inline]
    fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS, "slot index out of bounds");
        self.shards[current_shard()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn sum(&self, slot: usize) -> u64 {
        debug_assert!(slot < SLOTS, "slot index out of bounds");
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }

    fn shard_value(&self, shard: usize, slot: usize) -> u64 {
        self.shards[shard % NUM_SHARDS].slots[slot].load(Ordering::Relaxed)
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// One counter slot of a [`CounterGroup`].
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        Self { group, slot }
    }

    #[inline]
    pub fn increment(&self) {
        self.group.add(self.slot, 1);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        self.group.add(self.slot, value);
    }

    /// Total across all shards.
    pub fn value(&self) -> u64 {
        self.group.sum(self.slot)
    }

    /// Contribution of one ring's dispatcher.
    pub fn ring_value(&self, ring: usize) -> u64 {
        self.group.shard_value(ring, self.slot)
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(Counter::value(self)))
    }
}

#[inline]
fn current_shard() -> usize {
    RING_SHARD.get().unwrap_or_else(|| {
        thread_local! {
            static ID: u8 = const { 0 };
        }
        ID.with(|x| x as *const u8 as usize) % NUM_SHARDS
    })
}
