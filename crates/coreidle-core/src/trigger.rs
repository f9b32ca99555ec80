//! One-shot watched-memory trigger.
//!
//! A [`TriggerRegion`] is one cache line that a worker monitors while its core
//! idles. The launcher ends the wait by writing a non-zero word into the line
//! through a [`TriggerHandle`], exactly once.
//!
//! The worker owns the region through an `Arc` and drops it on exit; the
//! handle is a `Weak`, so a trip that arrives after the worker has gone
//! performs no write at all.
//!
//! The armed mark and the trip latch sit outside the watched line. Touching
//! them must not wake the monitor.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::state::TRIGGER_REGION_BYTES;

const WORDS: usize = TRIGGER_REGION_BYTES / 4;

#[repr(C, align(64))]
struct WatchedLine {
    words: [AtomicU32; WORDS],
}

/// A worker's watched region.
pub struct TriggerRegion {
    line: WatchedLine,
    armed: AtomicBool,
    tripped: AtomicBool,
}

impl TriggerRegion {
    /// Fresh zeroed region, not yet armed.
    pub fn allocate() -> Arc<Self> {
        Arc::new(Self {
            line: WatchedLine {
                words: std::array::from_fn(|_| AtomicU32::new(0)),
            },
            armed: AtomicBool::new(false),
            tripped: AtomicBool::new(false),
        })
    }

    /// Address handed to the monitor instruction.
    pub fn watched_address(&self) -> *const u8 {
        self.line.words.as_ptr().cast()
    }

    /// Whether any word of the watched line is non-zero.
    pub fn is_triggered(&self) -> bool {
        self.line
            .words
            .iter()
            .any(|w| w.load(Ordering::Acquire) != 0)
    }

    /// Published by the worker once the monitor is set up for the first time.
    pub fn mark_armed(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// A handle for the launcher. Does not keep the region alive.
    pub fn handle(self: &Arc<Self>) -> TriggerHandle {
        TriggerHandle {
            region: Arc::downgrade(self),
        }
    }
}

/// Result of [`TriggerHandle::trip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripOutcome {
    /// The watched line was written.
    Written,
    /// A previous trip already wrote it; nothing was written this time.
    AlreadyTripped,
    /// The worker had released the region; nothing was written.
    Released,
}

/// Launcher-side, write-once view of a region.
#[derive(Clone)]
pub struct TriggerHandle {
    region: Weak<TriggerRegion>,
}

impl TriggerHandle {
    /// End the worker's wait.
    pub fn trip(&self) -> TripOutcome {
        let Some(region) = self.region.upgrade() else {
            return TripOutcome::Released;
        };
        if region.tripped.swap(true, Ordering::AcqRel) {
            return TripOutcome::AlreadyTripped;
        }
        region.line.words[0].store(1, Ordering::Release);
        TripOutcome::Written
    }

    /// `false` once released, even if the worker armed before leaving.
    pub fn is_armed(&self) -> bool {
        self.region.upgrade().is_some_and(|r| r.is_armed())
    }

    pub fn is_released(&self) -> bool {
        self.region.strong_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_one_aligned_cache_line() {
        let region = TriggerRegion::allocate();
        assert_eq!(std::mem::size_of::<WatchedLine>(), TRIGGER_REGION_BYTES);
        assert_eq!(region.watched_address() as usize % 64, 0);
        assert!(!region.is_triggered());
        assert!(!region.is_armed());
    }

    #[test]
    fn trip_writes_once() {
        let region = TriggerRegion::allocate();
        let handle = region.handle();
        assert_eq!(handle.trip(), TripOutcome::Written);
        assert!(region.is_triggered());
        assert_eq!(handle.trip(), TripOutcome::AlreadyTripped);
        assert_eq!(handle.clone().trip(), TripOutcome::AlreadyTripped);
    }

    #[test]
    fn trip_after_release_is_a_no_op() {
        let region = TriggerRegion::allocate();
        let handle = region.handle();
        region.mark_armed();
        assert!(handle.is_armed());
        drop(region);
        assert!(handle.is_released());
        assert!(!handle.is_armed());
        assert_eq!(handle.trip(), TripOutcome::Released);
    }

    #[test]
    fn trip_is_seen_across_threads() {
        let region = TriggerRegion::allocate();
        let handle = region.handle();
        let waiter = {
            let region = Arc::clone(&region);
            std::thread::spawn(move || {
                region.mark_armed();
                while !region.is_triggered() {
                    std::hint::spin_loop();
                }
            })
        };
        while !handle.is_armed() {
            std::thread::yield_now();
        }
        assert_eq!(handle.trip(), TripOutcome::Written);
        waiter.join().unwrap();
    }
}
