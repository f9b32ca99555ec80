//! Starts workers for an idle command and fires the deferred trigger.
//!
//! Every launch runs on its own group thread, so the caller gets a
//! [`LaunchHandle`] back immediately. The group thread:
//!
//! 1. walks the core mask, marks each core waiting and spawns a pinned worker;
//!    a core whose worker cannot start is reported and skipped, the others
//!    carry on;
//! 2. waits until every started worker has armed (or released its region
//!    because pinning failed, or `arm_timeout` passed);
//! 3. sleeps for the command's duration;
//! 4. trips each core's trigger once and collects the worker reports.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::command::{IdleCommand, RejectReason};
use crate::hw::timing;
use crate::orchestrator::Orchestrator;
use crate::state::IdleState;
use crate::trigger::{TriggerHandle, TriggerRegion, TripOutcome};
use crate::worker::{self, WorkerContext, WorkerReport};

/// What happened to one selected core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CoreOutcome {
    /// A worker ran on the core. `armed` is false when the launcher gave up
    /// waiting for the first arm and tripped anyway.
    Launched { armed: bool, trip: TripOutcome },
    /// No worker idled on the core.
    Failed { reason: RejectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoreLaunch {
    pub core: u32,
    pub outcome: CoreOutcome,
}

/// Result of one launch, produced once every worker has exited.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub id: Uuid,
    pub state: IdleState,
    pub duration_us: u32,
    /// One entry per selected core, in mask order.
    pub cores: Vec<CoreLaunch>,
    pub workers: Vec<WorkerReport>,
    /// From the first spawn to the last worker joined.
    pub elapsed_us: u64,
}

impl LaunchReport {
    pub fn launched_cores(&self) -> Vec<u32> {
        self.cores
            .iter()
            .filter(|c| matches!(c.outcome, CoreOutcome::Launched { .. }))
            .map(|c| c.core)
            .collect()
    }

    pub fn failed_cores(&self) -> Vec<(u32, RejectReason)> {
        self.cores
            .iter()
            .filter_map(|c| match c.outcome {
                CoreOutcome::Failed { reason } => Some((c.core, reason)),
                CoreOutcome::Launched { .. } => None,
            })
            .collect()
    }

    /// Number of trigger writes performed.
    pub fn trips_written(&self) -> usize {
        self.cores
            .iter()
            .filter(|c| {
                matches!(
                    c.outcome,
                    CoreOutcome::Launched {
                        trip: TripOutcome::Written,
                        ..
                    }
                )
            })
            .count()
    }

    pub fn worker(&self, core: u32) -> Option<&WorkerReport> {
        self.workers.iter().find(|w| w.core == core)
    }
}

/// Handle to a running launch. Dropping it detaches the launch.
pub struct LaunchHandle {
    id: Uuid,
    group: JoinHandle<LaunchReport>,
}

impl LaunchHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.group.is_finished()
    }

    /// Block until every worker of this launch has exited.
    pub fn join(self) -> thread::Result<LaunchReport> {
        self.group.join()
    }
}

impl std::fmt::Debug for LaunchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Starts launches against one orchestrator.
#[derive(Clone)]
pub struct Launcher {
    orchestrator: Arc<Orchestrator>,
}

struct Started {
    core: u32,
    trigger: TriggerHandle,
    worker: JoinHandle<WorkerReport>,
}

enum ArmWait {
    Armed,
    /// Region dropped before arming: the worker could not pin.
    Released,
    TimedOut,
}

impl Launcher {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Start `command` in the background.
    ///
    /// Fails only if the orchestrator is shut down or the group thread cannot
    /// be spawned; per-core failures end up in the [`LaunchReport`].
    pub fn launch(&self, command: IdleCommand) -> io::Result<LaunchHandle> {
        if self.orchestrator.is_closed() {
            return Err(io::Error::other("orchestrator is shut down"));
        }
        let id = Uuid::new_v4();
        let orchestrator = Arc::clone(&self.orchestrator);
        orchestrator.launch_started();
        let group = thread::Builder::new()
            .name(format!("coreidle-launch-{}", &id.simple().to_string()[..8]))
            .spawn(move || {
                let report = run_launch(&orchestrator, id, command);
                orchestrator.launch_finished();
                report
            });
        match group {
            Ok(group) => Ok(LaunchHandle { id, group }),
            Err(e) => {
                self.orchestrator.launch_finished();
                Err(e)
            }
        }
    }
}

fn run_launch(orchestrator: &Orchestrator, id: Uuid, command: IdleCommand) -> LaunchReport {
    let started_at = Instant::now();
    let state = command.state();
    let duration_us = command.duration_us();
    log::info!(
        "launch {id}: cores {} -> {state} for {duration_us} µs",
        command.core_mask()
    );

    let mut outcomes: Vec<CoreLaunch> = Vec::new();
    let mut started: Vec<Started> = Vec::new();

    for core in command.core_mask().cores() {
        match start_worker(orchestrator, core, state) {
            Ok(s) => started.push(s),
            Err(reason) => outcomes.push(CoreLaunch {
                core,
                outcome: CoreOutcome::Failed { reason },
            }),
        }
    }

    let arm_deadline = Instant::now() + orchestrator.config().arm_timeout();
    let mut to_trip: Vec<(u32, bool, TriggerHandle)> = Vec::new();
    for s in &started {
        match wait_for_arm(&s.trigger, arm_deadline) {
            ArmWait::Armed => to_trip.push((s.core, true, s.trigger.clone())),
            ArmWait::Released => outcomes.push(CoreLaunch {
                core: s.core,
                outcome: CoreOutcome::Failed {
                    reason: RejectReason::AllocationFailure,
                },
            }),
            ArmWait::TimedOut => {
                log::warn!("launch {id}: core {} did not arm in time", s.core);
                to_trip.push((s.core, false, s.trigger.clone()));
            }
        }
    }

    if !to_trip.is_empty() {
        timing::sleep_us(duration_us);
    }

    for (core, armed, trigger) in to_trip {
        let trip = trigger.trip();
        log::debug!("launch {id}: core {core} trip {trip:?}");
        outcomes.push(CoreLaunch {
            core,
            outcome: CoreOutcome::Launched { armed, trip },
        });
    }

    let mut workers = Vec::with_capacity(started.len());
    for s in started {
        match s.worker.join() {
            Ok(report) => workers.push(report),
            Err(_) => log::error!("launch {id}: worker on core {} panicked", s.core),
        }
    }

    outcomes.sort_by_key(|o| o.core);
    let report = LaunchReport {
        id,
        state,
        duration_us,
        cores: outcomes,
        workers,
        elapsed_us: started_at.elapsed().as_micros() as u64,
    };
    let failed = report.failed_cores();
    if failed.is_empty() {
        log::info!(
            "launch {id}: {} cores done in {} µs",
            report.workers.len(),
            report.elapsed_us
        );
    } else {
        log::warn!("launch {id}: finished with failed cores {failed:?}");
    }
    report
}

fn start_worker(
    orchestrator: &Orchestrator,
    core: u32,
    state: IdleState,
) -> Result<Started, RejectReason> {
    let slot = orchestrator.slot(core).ok_or(RejectReason::CoreOutOfRange)?;
    let region = TriggerRegion::allocate();
    let trigger = region.handle();

    slot.begin_launch(state);
    let ctx = WorkerContext {
        core,
        state,
        region,
        slot: Arc::clone(slot),
        cache: Arc::clone(orchestrator.cache()),
        platform: orchestrator.platform().clone(),
        tracked_registers: Arc::clone(orchestrator.tracked_registers()),
        collect_residency: orchestrator.config().collect_residency,
    };

    match thread::Builder::new()
        .name(format!("coreidle-worker-{core}"))
        .spawn(move || worker::run(ctx))
    {
        Ok(worker) => Ok(Started {
            core,
            trigger,
            worker,
        }),
        Err(e) => {
            log::warn!("core {core}: cannot start worker: {e}");
            slot.abort_launch();
            Err(RejectReason::AllocationFailure)
        }
    }
}

fn wait_for_arm(trigger: &TriggerHandle, deadline: Instant) -> ArmWait {
    loop {
        if trigger.is_armed() {
            return ArmWait::Armed;
        }
        if trigger.is_released() {
            return ArmWait::Released;
        }
        if Instant::now() >= deadline {
            return ArmWait::TimedOut;
        }
        thread::sleep(Duration::from_micros(20));
    }
}
