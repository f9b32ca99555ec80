//! The owner of all per-core state.
//!
//! One [`Orchestrator`] holds the core slots, the sample cache and the
//! platform implementations. The launcher, the workers it starts and the
//! broker all share it through an `Arc`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::broker::RegisterBroker;
use crate::cache::SampleCache;
use crate::config::EngineConfig;
use crate::launcher::Launcher;
use crate::platform::Platform;
use crate::slot::{CoreSlot, CoreStatus};
use crate::state::{MAX_CORES, MAX_DURATION_US};

pub struct Orchestrator {
    config: EngineConfig,
    platform: Platform,
    slots: Vec<Arc<CoreSlot>>,
    cache: Arc<SampleCache>,
    tracked_registers: Arc<[u32]>,
    launches_in_flight: AtomicUsize,
    closed: AtomicBool,
}

impl Orchestrator {
    /// Build an orchestrator with one slot per online core and an empty cache.
    pub fn new(config: EngineConfig, platform: Platform) -> Arc<Self> {
        let cores = platform.topology.online_cores().min(MAX_CORES);
        let slots = (0..cores as u32).map(|c| Arc::new(CoreSlot::new(c))).collect();
        let cache = Arc::new(SampleCache::new(config.sample_cache_capacity));
        cache.clear();
        let tracked_registers = Arc::from(config.tracked_registers.as_slice());
        log::info!(
            "orchestrator up: {cores} cores, {} sample slots, {}",
            cache.capacity(),
            platform.describe()
        );
        Arc::new(Self {
            config,
            platform,
            slots,
            cache,
            tracked_registers,
            launches_in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Orchestrator on this machine's hardware.
    pub fn native(config: EngineConfig) -> Arc<Self> {
        let platform = Platform::native(&config);
        Self::new(config, platform)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn cache(&self) -> &Arc<SampleCache> {
        &self.cache
    }

    pub fn tracked_registers(&self) -> &Arc<[u32]> {
        &self.tracked_registers
    }

    /// Online core count as the machine reports it right now.
    pub fn online_cores(&self) -> usize {
        self.platform.topology.online_cores()
    }

    /// Effective duration ceiling: the configured one, never above the hard limit.
    pub fn max_duration_us(&self) -> u32 {
        self.config.max_duration_us.min(MAX_DURATION_US)
    }

    pub fn slot(&self, core: u32) -> Option<&Arc<CoreSlot>> {
        self.slots.get(core as usize)
    }

    pub fn slots(&self) -> &[Arc<CoreSlot>] {
        &self.slots
    }

    pub fn core_status(&self) -> Vec<CoreStatus> {
        self.slots.iter().map(|s| s.status()).collect()
    }

    /// Cores with a worker between launch and exit.
    pub fn waiting_cores(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|s| s.is_waiting())
            .map(|s| s.core())
            .collect()
    }

    pub fn launcher(self: &Arc<Self>) -> Launcher {
        Launcher::new(Arc::clone(self))
    }

    pub fn broker(self: &Arc<Self>) -> RegisterBroker {
        RegisterBroker::new(Arc::clone(self))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn launch_started(&self) {
        self.launches_in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn launch_finished(&self) {
        self.launches_in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_quiet(&self) -> bool {
        self.launches_in_flight.load(Ordering::Acquire) == 0 && self.waiting_cores().is_empty()
    }

    /// Stop accepting launches, wait up to `timeout` for running ones to
    /// finish, then clear the sample cache.
    ///
    /// Returns `false` if launches were still running at the deadline; the
    /// cache is left alone in that case because workers may still write it.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.closed.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;
        while !self.is_quiet() {
            if Instant::now() >= deadline {
                log::warn!(
                    "shutdown timed out with cores {:?} still waiting",
                    self.waiting_cores()
                );
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.cache.clear();
        log::info!("orchestrator shut down");
        true
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("cores", &self.slots.len())
            .field("platform", &self.platform)
            .field("waiting", &self.waiting_cores())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CoreMask, IdleCommand, IdleRequest};
    use crate::hw::msr::MSR_IA32_MPERF;
    use crate::testing::{orchestrator, test_config};

    #[test]
    fn one_slot_per_online_core() {
        let (orch, _) = orchestrator(6, &[], test_config());
        assert_eq!(orch.slots().len(), 6);
        assert_eq!(orch.slot(5).unwrap().core(), 5);
        assert!(orch.slot(6).is_none());
        assert!(orch.waiting_cores().is_empty());
    }

    #[test]
    fn slots_stop_at_max_cores() {
        let (orch, _) = orchestrator(MAX_CORES + 8, &[], test_config());
        assert_eq!(orch.slots().len(), MAX_CORES);
        assert_eq!(orch.online_cores(), MAX_CORES + 8);
    }

    #[test]
    fn duration_ceiling_never_exceeds_hard_limit() {
        let config = EngineConfig {
            max_duration_us: u32::MAX,
            ..test_config()
        };
        let (orch, _) = orchestrator(1, &[], config);
        assert_eq!(orch.max_duration_us(), MAX_DURATION_US);
    }

    #[test]
    fn tracked_registers_come_from_config() {
        let config = EngineConfig {
            tracked_registers: vec![MSR_IA32_MPERF],
            ..test_config()
        };
        let (orch, _) = orchestrator(1, &[], config);
        assert_eq!(&orch.tracked_registers()[..], &[MSR_IA32_MPERF]);
    }

    #[test]
    fn shutdown_when_quiet_clears_cache() {
        let (orch, _) = orchestrator(2, &[], test_config());
        orch.cache().record(0, MSR_IA32_MPERF, 1);
        assert!(orch.shutdown(Duration::from_millis(50)));
        assert!(orch.is_closed());
        assert!(orch.cache().is_empty());
    }

    #[test]
    fn shutdown_times_out_while_a_launch_runs() {
        let (orch, _) = orchestrator(1, &[], test_config());
        let command = IdleCommand::validate(
            &IdleRequest {
                core_mask: CoreMask::from_u64(1),
                state: 1,
                duration_us: 300_000,
            },
            1,
            orch.max_duration_us(),
        )
        .unwrap();
        let handle = orch.launcher().launch(command).unwrap();

        assert!(!orch.shutdown(Duration::from_millis(5)));
        handle.join().unwrap();
        assert!(orch.shutdown(Duration::from_millis(50)));
    }
}
