//! Monitor/wait implementations.
//!
//! Ring-3 code cannot execute MONITOR/MWAIT, so on x86_64 parts with WAITPKG
//! we use the user-level pair UMONITOR/UMWAIT. UMWAIT only distinguishes two
//! light states (C0.1 and C0.2); the MWAIT hint picks between them. Everything
//! else falls back to [`PollWait`], which sleeps for a short interval and lets
//! the worker re-check its region.

use std::sync::Arc;
use std::time::Duration;

use crate::config::WaitBackend;
use crate::platform::WaitPrimitive;
use crate::trigger::TriggerRegion;

/// Hint value meaning "stay in C0".
const ACTIVE_HINT: u32 = 0xF0;

/// Pick the wait primitive for `backend`.
///
/// `Umwait` on a CPU without WAITPKG degrades to polling with a warning.
pub fn select_wait_primitive(
    backend: WaitBackend,
    poll_interval: Duration,
) -> Arc<dyn WaitPrimitive> {
    match backend {
        WaitBackend::Poll => Arc::new(PollWait::new(poll_interval)),
        WaitBackend::Auto | WaitBackend::Umwait => {
            if let Some(umwait) = Umwait::detect() {
                return Arc::new(umwait);
            }
            if backend == WaitBackend::Umwait {
                log::warn!("CPU lacks WAITPKG; falling back to polling wait");
            }
            Arc::new(PollWait::new(poll_interval))
        }
    }
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Sleep-and-recheck stand-in for monitor/wait.
///
/// `monitor` is a no-op and every `wait` returns after `interval`, which the
/// worker treats like a spurious wake.
pub struct PollWait {
    interval: Duration,
}

impl PollWait {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl WaitPrimitive for PollWait {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn monitor(&self, _region: &TriggerRegion) {}

    fn wait(&self, _hint: u32) {
        std::thread::sleep(self.interval);
    }
}

// ---------------------------------------------------------------------------
// UMONITOR / UMWAIT
// ---------------------------------------------------------------------------

/// User-level monitor/wait (Tremont, Sapphire Rapids and later).
pub struct Umwait {
    /// TSC ticks before UMWAIT gives up on its own. The OS caps this further
    /// through `IA32_UMWAIT_CONTROL`.
    deadline_ticks: u64,
}

impl Umwait {
    /// `Some` when the CPU advertises WAITPKG.
    pub fn detect() -> Option<Self> {
        has_waitpkg().then_some(Self {
            deadline_ticks: 1_000_000,
        })
    }

    /// UMWAIT control word for an MWAIT hint: bit 0 set selects C0.1.
    fn control_for(hint: u32) -> u32 {
        if hint == ACTIVE_HINT { 1 } else { 0 }
    }
}

#[cfg(target_arch = "x86_64")]
fn has_waitpkg() -> bool {
    // CPUID.(EAX=07H, ECX=0):ECX[bit 5]
    #[allow(unused_unsafe)]
    let leaf = unsafe { std::arch::x86_64::__cpuid_count(7, 0) };
    leaf.ecx & (1 << 5) != 0
}

#[cfg(not(target_arch = "x86_64"))]
fn has_waitpkg() -> bool {
    false
}

impl WaitPrimitive for Umwait {
    fn name(&self) -> &'static str {
        "umwait"
    }

    #[cfg(target_arch = "x86_64")]
    fn monitor(&self, region: &TriggerRegion) {
        let addr = region.watched_address();
        // SAFETY: WAITPKG was confirmed by `detect`. UMONITOR only records the
        // address range; the region outlives the call because we hold a borrow.
        unsafe {
            // umonitor rax
            std::arch::asm!(
                ".byte 0xf3, 0x0f, 0xae, 0xf0",
                in("rax") addr,
                options(nostack, preserves_flags)
            );
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn monitor(&self, _region: &TriggerRegion) {}

    #[cfg(target_arch = "x86_64")]
    fn wait(&self, hint: u32) {
        // SAFETY: reading the TSC has no side effects.
        let now = unsafe { std::arch::x86_64::_rdtsc() };
        let deadline = now.wrapping_add(self.deadline_ticks);
        let control = Self::control_for(hint);
        // SAFETY: WAITPKG was confirmed by `detect`. UMWAIT blocks until the
        // monitored line is written, the deadline passes, or an interrupt.
        // Not `nomem`: the region re-check after it must not be hoisted above.
        unsafe {
            // umwait ecx
            std::arch::asm!(
                ".byte 0xf2, 0x0f, 0xae, 0xf1",
                in("ecx") control,
                in("eax") deadline as u32,
                in("edx") (deadline >> 32) as u32,
                options(nostack)
            );
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn wait(&self, _hint: u32) {}
}
