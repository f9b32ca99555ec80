//! Per-core bookkeeping shared by the launcher, workers and the broker.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::state::IdleState;
use crate::worker::WorkerReport;

/// Where a core's most recent worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    /// Never launched.
    Idle,
    /// Started, monitor not yet set up.
    Arming,
    /// Inside the wait loop.
    Waiting,
    /// Left the wait loop.
    Exited,
}

impl WorkerPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Arming,
            2 => Self::Waiting,
            3 => Self::Exited,
            _ => Self::Idle,
        }
    }
}

const NO_TARGET: u8 = u8::MAX;

/// Most registers readers can add to one core's re-arm sampling.
pub const MAX_INTEREST_PER_CORE: usize = 8;

/// State of one logical core, alive as long as the orchestrator.
pub struct CoreSlot {
    core: u32,
    /// Workers currently between launch and exit. The core is waiting while
    /// this is non-zero.
    active: AtomicU32,
    phase: AtomicU8,
    target: AtomicU8,
    launches: AtomicU64,
    /// Registers the broker was asked for while the core was waiting and had
    /// no sample; workers sample these alongside the tracked set.
    interest: Mutex<Vec<u32>>,
    last_report: Mutex<Option<WorkerReport>>,
}

impl CoreSlot {
    /// Slot for `core`, never launched.
    pub fn new(core: u32) -> Self {
        Self {
            core,
            active: AtomicU32::new(0),
            phase: AtomicU8::new(WorkerPhase::Idle as u8),
            target: AtomicU8::new(NO_TARGET),
            launches: AtomicU64::new(0),
            interest: Mutex::new(Vec::new()),
            last_report: Mutex::new(None),
        }
    }

    pub fn core(&self) -> u32 {
        self.core
    }

    /// True while at least one worker is between launch and exit.
    pub fn is_waiting(&self) -> bool {
        self.active.load(Ordering::Acquire) > 0
    }

    /// Phase of the most recent worker.
    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// State of the most recent launch, `None` before the first.
    pub fn target_state(&self) -> Option<IdleState> {
        IdleState::from_id(self.target.load(Ordering::Acquire))
    }

    /// Launches started on this core since the orchestrator came up.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Mark the core waiting ahead of starting a worker on it.
    pub(crate) fn begin_launch(&self, state: IdleState) {
        self.target.store(state.id(), Ordering::Release);
        self.launches.fetch_add(1, Ordering::Relaxed);
        self.set_phase(WorkerPhase::Arming);
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// Undo [`begin_launch`](Self::begin_launch) when the worker never started.
    pub(crate) fn abort_launch(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.last_out();
        }
    }

    /// Called by a worker as it leaves; clears `waiting` with the last one out.
    pub(crate) fn finish(&self, report: WorkerReport) {
        *self.last_report.lock().unwrap() = Some(report);
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.last_out();
        }
    }

    /// Reader interest only lasts as long as the waits it was raised in.
    fn last_out(&self) {
        self.interest.lock().unwrap().clear();
        self.set_phase(WorkerPhase::Exited);
    }

    /// Ask future re-arm cycles to sample `register`. Returns `true` if it
    /// was added, `false` if it was already requested or the list is full.
    pub(crate) fn register_interest(&self, register: u32) -> bool {
        let mut interest = self.interest.lock().unwrap();
        if interest.contains(&register) {
            return false;
        }
        if interest.len() >= MAX_INTEREST_PER_CORE {
            log::debug!(
                "core {}: interest list full, not sampling {register:#x}",
                self.core
            );
            return false;
        }
        interest.push(register);
        true
    }

    /// Registers readers asked for during the current waits.
    pub fn interest(&self) -> Vec<u32> {
        self.interest.lock().unwrap().clone()
    }

    /// Report of the last worker to exit on this core.
    pub fn last_report(&self) -> Option<WorkerReport> {
        self.last_report.lock().unwrap().clone()
    }

    /// Snapshot for status views.
    pub fn status(&self) -> CoreStatus {
        CoreStatus {
            core: self.core,
            phase: self.phase(),
            waiting: self.is_waiting(),
            target_state: self.target_state(),
            launches: self.launches(),
            interest: self.interest(),
            last_report: self.last_report(),
        }
    }
}

/// Serializable snapshot of a [`CoreSlot`].
#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    pub core: u32,
    pub phase: WorkerPhase,
    pub waiting: bool,
    pub target_state: Option<IdleState>,
    pub launches: u64,
    pub interest: Vec<u32>,
    pub last_report: Option<WorkerReport>,
}
