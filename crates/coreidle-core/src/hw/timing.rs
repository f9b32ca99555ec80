//! Duration-dependent sleeping for the deferred trigger.
//!
//! Short waits spin so timer slack does not dominate them; long waits sleep
//! so the launcher does not burn a core it may share with a worker.

use std::time::{Duration, Instant};

/// How [`sleep_us`] waits for a given duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepGranularity {
    /// Below 10 µs: spin on the clock.
    Busy,
    /// Below 10 ms: sleep most of it, spin the last microsecond.
    Fine,
    /// 10 ms and up: whole milliseconds.
    Coarse,
}

pub fn granularity_for(duration_us: u32) -> SleepGranularity {
    if duration_us < 10 {
        SleepGranularity::Busy
    } else if duration_us < 10_000 {
        SleepGranularity::Fine
    } else {
        SleepGranularity::Coarse
    }
}

/// Block the calling thread for at least `duration_us` microseconds.
pub fn sleep_us(duration_us: u32) {
    let target = Duration::from_micros(u64::from(duration_us));
    match granularity_for(duration_us) {
        SleepGranularity::Busy => spin_until(Instant::now() + target),
        SleepGranularity::Fine => {
            let deadline = Instant::now() + target;
            std::thread::sleep(target - Duration::from_micros(1));
            spin_until(deadline);
        }
        SleepGranularity::Coarse => {
            // Round up so a 15.5 ms request never wakes at 15 ms.
            let ms = u64::from(duration_us).div_ceil(1000);
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}

fn spin_until(deadline: Instant) {
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}
