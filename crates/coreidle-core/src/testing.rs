//! Platform doubles shared by the unit tests.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{EngineConfig, WaitBackend};
use crate::hw::wait::PollWait;
use crate::orchestrator::Orchestrator;
use crate::platform::{CpuTopology, Platform, RegisterAccess, RegisterError};

thread_local! {
    static PINNED: Cell<Option<u32>> = const { Cell::new(None) };
}

/// Register file with fixed values; unknown registers are unmapped.
#[derive(Default)]
pub struct MockRegisters {
    values: Mutex<HashMap<(u32, u32), u64>>,
    /// Cores each read actually ran on, as the fake topology saw it.
    pub read_on: Mutex<Vec<Option<u32>>>,
}

impl MockRegisters {
    pub fn set(&self, core: u32, register: u32, value: u64) {
        self.values.lock().unwrap().insert((core, register), value);
    }
}

impl RegisterAccess for MockRegisters {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn read(&self, core: u32, register: u32) -> Result<u64, RegisterError> {
        self.read_on.lock().unwrap().push(PINNED.with(|p| p.get()));
        self.values
            .lock()
            .unwrap()
            .get(&(core, register))
            .copied()
            .ok_or(RegisterError::Unmapped { core, register })
    }
}

/// `online` cores; pinning to anything in `unpinnable` fails.
pub struct FakeTopology {
    pub online: usize,
    pub unpinnable: HashSet<u32>,
}

impl CpuTopology for FakeTopology {
    fn online_cores(&self) -> usize {
        self.online
    }

    fn pin_current_thread(&self, core: u32) -> io::Result<()> {
        if self.unpinnable.contains(&core) || core as usize >= self.online {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        PINNED.with(|p| p.set(Some(core)));
        Ok(())
    }

    fn is_current_thread_pinned_to(&self, core: u32) -> bool {
        PINNED.with(|p| p.get()) == Some(core)
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        wait_backend: WaitBackend::Poll,
        poll_interval_us: 100,
        ..EngineConfig::default()
    }
}

/// Orchestrator over a mock register file and a fake topology.
pub fn orchestrator(
    online: usize,
    unpinnable: &[u32],
    config: EngineConfig,
) -> (Arc<Orchestrator>, Arc<MockRegisters>) {
    let registers = Arc::new(MockRegisters::default());
    let platform = Platform {
        registers: registers.clone(),
        wait: Arc::new(PollWait::new(config.poll_interval())),
        topology: Arc::new(FakeTopology {
            online,
            unpinnable: unpinnable.iter().copied().collect(),
        }),
    };
    (Orchestrator::new(config, platform), registers)
}

/// Spin until `f` holds or two seconds pass.
pub fn wait_until(mut f: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    f()
}
