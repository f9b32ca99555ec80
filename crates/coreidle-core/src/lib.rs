//! # coreidle-core
//!
//! Park chosen CPU cores in a chosen C-state for a bounded time, and read
//! their performance counters without waking them.
//!
//! ## Quick Start
//!
//! ```no_run
//! use coreidle_core::{CommandEndpoint, CoreMask, EngineConfig, IdleRequest, Orchestrator};
//!
//! let endpoint = CommandEndpoint::new(Orchestrator::native(EngineConfig::default()));
//!
//! // Cores 0 and 2 into C6 for 2 ms.
//! let accepted = endpoint
//!     .submit_idle_command(&IdleRequest {
//!         core_mask: CoreMask::from_cores([0, 2]),
//!         state: 6,
//!         duration_us: 2000,
//!     })
//!     .unwrap();
//! let report = accepted.handle.join().unwrap();
//! println!("{} cores idled", report.workers.len());
//! ```
//!
//! ## Architecture
//!
//! CommandEndpoint → Launcher → one pinned worker per core → trigger ends each wait
//!
//! Each worker arms a monitor on its own 64-byte [`TriggerRegion`] and waits.
//! Whenever the wait returns without the region being written, the worker
//! samples its core's registers into the shared [`SampleCache`]. After the
//! requested duration the launcher writes every region once.
//!
//! Register reads go through the [`RegisterBroker`]: a core that is not
//! waiting is read live from a thread pinned to it, and a waiting core is
//! answered from the cache.
//!
//! Hardware sits behind the three traits in [`platform`], so the whole
//! engine runs against test doubles as well as `/dev/cpu/*/msr` and
//! UMONITOR/UMWAIT.

pub mod broker;
pub mod cache;
pub mod command;
pub mod config;
pub mod endpoint;
pub mod hw;
pub mod launcher;
pub mod orchestrator;
pub mod platform;
pub mod slot;
pub mod state;
pub mod trigger;
pub mod wire;
pub mod worker;

#[cfg(test)]
mod testing;

pub use broker::{AperfMperf, ReadSource, RegisterBroker, RegisterRequest, RegisterResponse};
pub use cache::{RegisterSample, SampleCache};
pub use command::{CoreMask, IdleCommand, IdleRequest, RejectReason};
pub use config::{EngineConfig, WaitBackend, load_config_from_path};
pub use endpoint::{Accepted, CommandEndpoint};
pub use launcher::{CoreLaunch, CoreOutcome, LaunchHandle, LaunchReport, Launcher};
pub use orchestrator::Orchestrator;
pub use platform::{CpuTopology, Platform, RegisterAccess, RegisterError, WaitPrimitive};
pub use slot::{CoreSlot, CoreStatus, WorkerPhase};
pub use state::{IdleState, MAX_CORES, MAX_DURATION_US};
pub use trigger::{TriggerHandle, TriggerRegion, TripOutcome};
pub use wire::{IdleChannel, IdleRecord, RegisterChannel, RegisterRecord, WireError};
pub use worker::{ResidencyDelta, WorkerExit, WorkerReport};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
