//! The per-core worker: pin, arm, wait, re-arm until triggered.
//!
//! Each worker runs on its own OS thread and owns its [`TriggerRegion`]. Its
//! life is
//!
//! ```text
//! Arming -> Waiting -> { Triggered | ReArm -> Waiting } -> Exited
//! ```
//!
//! A return from the wait primitive without the region being written is a
//! reset: the worker samples its registers into the cache and re-arms.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::cache::SampleCache;
use crate::hw::msr::{
    IA32_TIME_STAMP_COUNTER, MSR_CORE_C3_RESIDENCY, MSR_CORE_C6_RESIDENCY, MSR_CORE_C7_RESIDENCY,
    MSR_IA32_MPERF,
};
use crate::platform::{Platform, RegisterError};
use crate::slot::{CoreSlot, WorkerPhase};
use crate::state::IdleState;
use crate::trigger::TriggerRegion;

/// How a worker left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerExit {
    /// The region was written.
    Triggered,
    /// The thread could not be pinned; the core never idled.
    PinFailed,
}

/// Residency counter deltas over one worker's wait, in counter ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ResidencyDelta {
    pub c0: u64,
    /// Whatever TSC time the other counters do not account for.
    pub c1: u64,
    pub c3: u64,
    pub c6: u64,
    pub c7: u64,
    pub tsc: u64,
}

impl ResidencyDelta {
    fn between(start: &ResidencySnapshot, end: &ResidencySnapshot) -> Self {
        let c0 = end.mperf.wrapping_sub(start.mperf);
        let c3 = end.c3.wrapping_sub(start.c3);
        let c6 = end.c6.wrapping_sub(start.c6);
        let c7 = end.c7.wrapping_sub(start.c7);
        let tsc = end.tsc.wrapping_sub(start.tsc);
        let accounted = c0.saturating_add(c3).saturating_add(c6).saturating_add(c7);
        let c1 = tsc.saturating_sub(accounted);
        Self {
            c0,
            c1,
            c3,
            c6,
            c7,
            tsc,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ResidencySnapshot {
    mperf: u64,
    c3: u64,
    c6: u64,
    c7: u64,
    tsc: u64,
}

impl ResidencySnapshot {
    fn take(platform: &Platform, core: u32) -> Result<Self, RegisterError> {
        let read = |register| platform.registers.read(core, register);
        Ok(Self {
            mperf: read(MSR_IA32_MPERF)?,
            c3: read(MSR_CORE_C3_RESIDENCY)?,
            c6: read(MSR_CORE_C6_RESIDENCY)?,
            c7: read(MSR_CORE_C7_RESIDENCY)?,
            tsc: read(IA32_TIME_STAMP_COUNTER)?,
        })
    }
}

/// What a worker hands back when it exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub core: u32,
    pub state: IdleState,
    /// Wake-ups that were not the trigger.
    pub resets: u64,
    pub exit: WorkerExit,
    pub elapsed_us: u64,
    pub residency: Option<ResidencyDelta>,
}

/// Everything a worker thread needs, moved into it at spawn.
pub(crate) struct WorkerContext {
    pub core: u32,
    pub state: IdleState,
    pub region: Arc<TriggerRegion>,
    pub slot: Arc<CoreSlot>,
    pub cache: Arc<SampleCache>,
    pub platform: Platform,
    pub tracked_registers: Arc<[u32]>,
    pub collect_residency: bool,
}

/// Worker thread body.
pub(crate) fn run(ctx: WorkerContext) -> WorkerReport {
    let WorkerContext {
        core,
        state,
        region,
        slot,
        cache,
        platform,
        tracked_registers,
        collect_residency,
    } = ctx;
    let started = Instant::now();

    if let Err(e) = platform.topology.pin_current_thread(core) {
        log::warn!("core {core}: cannot pin worker: {e}");
        drop(region);
        let report = WorkerReport {
            core,
            state,
            resets: 0,
            exit: WorkerExit::PinFailed,
            elapsed_us: started.elapsed().as_micros() as u64,
            residency: None,
        };
        slot.finish(report.clone());
        return report;
    }

    let entry = if collect_residency {
        ResidencySnapshot::take(&platform, core)
            .inspect_err(|e| log::debug!("core {core}: no residency counters: {e}"))
            .ok()
    } else {
        None
    };

    let hint = state.mwait_hint();
    let wait = &platform.wait;

    wait.monitor(&region);
    region.mark_armed();
    slot.set_phase(WorkerPhase::Waiting);
    log::debug!("core {core}: armed for {state} (hint {hint:#04x})");

    let mut resets: u64 = 0;
    loop {
        wait.wait(hint);
        if region.is_triggered() {
            break;
        }

        resets += 1;
        if resets == 1 {
            log::debug!("core {core}: first re-arm");
        }
        sample_registers(&platform, &cache, &slot, core, &tracked_registers);

        wait.monitor(&region);
        // Written while we were sampling; the monitor will not report it.
        if region.is_triggered() {
            break;
        }
    }

    drop(region);

    let residency = entry.and_then(|start| {
        let end = ResidencySnapshot::take(&platform, core).ok()?;
        Some(ResidencyDelta::between(&start, &end))
    });
    if let Some(r) = &residency {
        log::info!(
            "core {core}: residency c0={} c1={} c3={} c6={} c7={} tsc={}",
            r.c0,
            r.c1,
            r.c3,
            r.c6,
            r.c7,
            r.tsc
        );
    }

    let report = WorkerReport {
        core,
        state,
        resets,
        exit: WorkerExit::Triggered,
        elapsed_us: started.elapsed().as_micros() as u64,
        residency,
    };
    log::debug!(
        "core {core}: exited {state} after {} µs, {resets} resets",
        report.elapsed_us
    );
    slot.finish(report.clone());
    report
}

/// Record this core's tracked and requested registers.
fn sample_registers(
    platform: &Platform,
    cache: &SampleCache,
    slot: &CoreSlot,
    core: u32,
    tracked: &[u32],
) {
    let interest = slot.interest();
    let registers = tracked
        .iter()
        .chain(interest.iter().filter(|r| !tracked.contains(*r)));
    for &register in registers {
        match platform.registers.read(core, register) {
            Ok(value) => {
                if !cache.record(core, register, value) {
                    log::trace!("core {core}: sample cache full, dropped {register:#x}");
                }
            }
            Err(e) => log::trace!("core {core}: sample {register:#x} failed: {e}"),
        }
    }
}
