//! Bounded register sample cache.
//!
//! Workers record register values here on every re-arm cycle so the broker
//! can answer reads for a core that is idling without waking it.
//!
//! The cache is a fixed array of slots keyed by `(core, register)`. An
//! existing slot for a key is overwritten in place, a new key claims the
//! first empty slot with a compare-and-swap, and once every slot is taken new
//! keys are dropped. Nothing is ever evicted before [`SampleCache::clear`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// One cached register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSample {
    pub core: u32,
    pub register: u32,
    pub value: u64,
    pub valid: bool,
}

#[derive(Default)]
struct Slot {
    /// [`slot_key`] of the owner, 0 while empty.
    key: AtomicU64,
    value: AtomicU64,
    valid: AtomicBool,
}

impl Slot {
    fn store(&self, value: u64) {
        self.value.store(value, Ordering::Release);
        self.valid.store(true, Ordering::Release);
    }
}

/// Core is offset by one so `(core 0, register 0)` is distinguishable from
/// an empty slot.
fn slot_key(core: u32, register: u32) -> u64 {
    ((u64::from(core) + 1) << 32) | u64::from(register)
}

/// Process-wide register sample store.
///
/// Only workers write it, each for its own core. Outside the crate the cache
/// is read-only:
///
/// ```compile_fail
/// let cache = coreidle_core::SampleCache::new(4);
/// cache.record(0, 0xE7, 1);
/// ```
pub struct SampleCache {
    slots: Box<[Slot]>,
}

impl SampleCache {
    /// Empty cache with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
        }
    }

    /// Number of slots, claimed or not.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Store a sample for a worker's own core. Returns `false` when the cache
    /// is full and the key is new, in which case the sample is dropped.
    pub(crate) fn record(&self, core: u32, register: u32, value: u64) -> bool {
        let key = slot_key(core, register);

        if let Some(slot) = self
            .slots
            .iter()
            .find(|s| s.key.load(Ordering::Acquire) == key)
        {
            slot.store(value);
            return true;
        }

        for slot in self.slots.iter() {
            match slot
                .key
                .compare_exchange(0, key, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    slot.store(value);
                    return true;
                }
                // Another writer claimed this slot for the same key first.
                Err(current) if current == key => {
                    slot.store(value);
                    return true;
                }
                Err(_) => continue,
            }
        }
        false
    }

    /// Last valid value recorded for `(core, register)`.
    pub fn lookup(&self, core: u32, register: u32) -> Option<u64> {
        let key = slot_key(core, register);
        let slot = self
            .slots
            .iter()
            .find(|s| s.key.load(Ordering::Acquire) == key)?;
        slot.valid
            .load(Ordering::Acquire)
            .then(|| slot.value.load(Ordering::Acquire))
    }

    /// Forget every sample. Only call while no worker is running.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.valid.store(false, Ordering::Release);
            slot.value.store(0, Ordering::Release);
            slot.key.store(0, Ordering::Release);
        }
    }

    /// Number of claimed slots.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.key.load(Ordering::Acquire) != 0)
            .count()
    }

    /// True when no slot is claimed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every claimed slot, in slot order.
    pub fn samples(&self) -> Vec<RegisterSample> {
        self.slots
            .iter()
            .filter_map(|s| {
                let key = s.key.load(Ordering::Acquire);
                (key != 0).then(|| RegisterSample {
                    core: ((key >> 32) - 1) as u32,
                    register: key as u32,
                    value: s.value.load(Ordering::Acquire),
                    valid: s.valid.load(Ordering::Acquire),
                })
            })
            .collect()
    }
}
