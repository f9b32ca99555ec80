//! Register reads: live when the core is awake, cached while it idles.
//!
//! Reading a register on an idling core would wake it, so the broker never
//! does. A waiting core is answered from the sample cache its worker fills on
//! every re-arm; with no sample the answer is a zeroed, not-ready response
//! and the register is added to the core's interest list so the worker starts
//! sampling it.

use std::io;
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::hw::msr::{MSR_IA32_APERF, MSR_IA32_MPERF};
use crate::orchestrator::Orchestrator;
use crate::platform::RegisterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub core: u32,
    pub register: u32,
}

/// Where a [`RegisterResponse`] value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadSource {
    /// Read on the core just now.
    Live,
    /// Last value a worker sampled while the core idled.
    Cached,
    /// No value: see `ready`.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub core: u32,
    pub register: u32,
    pub value: u64,
    /// `false` means `value` is zero and carries no information.
    pub ready: bool,
    pub source: ReadSource,
}

impl RegisterResponse {
    fn live(core: u32, register: u32, value: u64) -> Self {
        Self {
            core,
            register,
            value,
            ready: true,
            source: ReadSource::Live,
        }
    }

    fn cached(core: u32, register: u32, value: u64) -> Self {
        Self {
            source: ReadSource::Cached,
            ..Self::live(core, register, value)
        }
    }

    pub fn unavailable(core: u32, register: u32) -> Self {
        Self {
            core,
            register,
            value: 0,
            ready: false,
            source: ReadSource::Unavailable,
        }
    }
}

/// APERF and MPERF of one core, read back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AperfMperf {
    pub core: u32,
    pub aperf: RegisterResponse,
    pub mperf: RegisterResponse,
}

#[derive(Clone)]
pub struct RegisterBroker {
    orchestrator: Arc<Orchestrator>,
}

impl RegisterBroker {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Answer one read. Hardware failures come back as not-ready responses.
    pub fn read(&self, core: u32, register: u32) -> RegisterResponse {
        let Some(slot) = self.orchestrator.slot(core) else {
            log::debug!("read {register:#x}: core {core} has no slot");
            return RegisterResponse::unavailable(core, register);
        };

        if slot.is_waiting() {
            return match self.orchestrator.cache().lookup(core, register) {
                Some(value) => RegisterResponse::cached(core, register, value),
                None => {
                    if slot.register_interest(register) {
                        log::debug!("core {core}: now sampling {register:#x} for readers");
                    }
                    RegisterResponse::unavailable(core, register)
                }
            };
        }

        match self.read_live(core, register) {
            Ok(value) => RegisterResponse::live(core, register, value),
            Err(e) => {
                log::warn!("{e}");
                RegisterResponse::unavailable(core, register)
            }
        }
    }

    pub fn read_request(&self, request: &RegisterRequest) -> RegisterResponse {
        self.read(request.core, request.register)
    }

    pub fn read_aperf_mperf(&self, core: u32) -> AperfMperf {
        AperfMperf {
            core,
            aperf: self.read(core, MSR_IA32_APERF),
            mperf: self.read(core, MSR_IA32_MPERF),
        }
    }

    /// Read on `core`, from this thread if it is already pinned there and
    /// from a short-lived pinned thread otherwise.
    fn read_live(&self, core: u32, register: u32) -> Result<u64, RegisterError> {
        let platform = self.orchestrator.platform();
        if platform.topology.is_current_thread_pinned_to(core) {
            return platform.registers.read(core, register);
        }

        thread::scope(|s| -> Result<u64, RegisterError> {
            let reader = thread::Builder::new()
                .name(format!("coreidle-read-{core}"))
                .spawn_scoped(s, || -> Result<u64, RegisterError> {
                    platform
                        .topology
                        .pin_current_thread(core)
                        .map_err(|source| RegisterError::Affinity { core, source })?;
                    platform.registers.read(core, register)
                })
                .map_err(|source| RegisterError::Io {
                    core,
                    register,
                    source,
                })?;
            reader.join().unwrap_or_else(|_| {
                Err(RegisterError::Io {
                    core,
                    register,
                    source: io::Error::other("register reader panicked"),
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CoreMask, IdleCommand, IdleRequest};
    use crate::launcher::LaunchHandle;
    use crate::testing::{orchestrator, test_config, wait_until};

    fn park(orch: &Arc<Orchestrator>, mask: u64, duration_us: u32) -> LaunchHandle {
        let request = IdleRequest {
            core_mask: CoreMask::from_u64(mask),
            state: 6,
            duration_us,
        };
        let cmd = IdleCommand::validate(&request, orch.online_cores(), 15_000_000).unwrap();
        orch.launcher().launch(cmd).unwrap()
    }

    #[test]
    fn idle_core_reads_live_on_that_core() {
        let (orch, regs) = orchestrator(4, &[], test_config());
        regs.set(2, MSR_IA32_MPERF, 0xABCD);
        let resp = orch.broker().read(2, MSR_IA32_MPERF);
        assert_eq!(resp, RegisterResponse::live(2, MSR_IA32_MPERF, 0xABCD));
        assert_eq!(regs.read_on.lock().unwrap().last(), Some(&Some(2)));
    }

    #[test]
    fn unmapped_register_is_not_ready() {
        let (orch, _) = orchestrator(2, &[], test_config());
        let resp = orch.broker().read(0, 0x1234);
        assert!(!resp.ready);
        assert_eq!(resp.value, 0);
        assert_eq!(resp.source, ReadSource::Unavailable);
    }

    #[test]
    fn unknown_core_is_not_ready() {
        let (orch, _) = orchestrator(2, &[], test_config());
        assert_eq!(
            orch.broker().read(9, MSR_IA32_MPERF),
            RegisterResponse::unavailable(9, MSR_IA32_MPERF)
        );
    }

    #[test]
    fn pin_failure_is_not_ready() {
        let (orch, regs) = orchestrator(2, &[1], test_config());
        regs.set(1, MSR_IA32_MPERF, 5);
        assert!(!orch.broker().read(1, MSR_IA32_MPERF).ready);
    }

    #[test]
    fn waiting_core_is_served_from_samples() {
        let (orch, regs) = orchestrator(2, &[], test_config());
        regs.set(0, MSR_IA32_MPERF, 777);
        let handle = park(&orch, 0b1, 300_000);

        assert!(wait_until(|| orch.cache().lookup(0, MSR_IA32_MPERF).is_some()));
        let resp = orch.broker().read(0, MSR_IA32_MPERF);
        assert_eq!(resp, RegisterResponse::cached(0, MSR_IA32_MPERF, 777));

        handle.join().unwrap();
        // Awake again: live read.
        regs.set(0, MSR_IA32_MPERF, 778);
        assert_eq!(orch.broker().read(0, MSR_IA32_MPERF).source, ReadSource::Live);
        assert_eq!(orch.broker().read(0, MSR_IA32_MPERF).value, 778);
    }

    #[test]
    fn miss_on_waiting_core_registers_interest() {
        let (orch, regs) = orchestrator(2, &[], test_config());
        regs.set(1, 0x611, 42);
        let handle = park(&orch, 0b10, 300_000);
        assert!(wait_until(|| orch.slot(1).unwrap().is_waiting()));

        let first = orch.broker().read(1, 0x611);
        assert_eq!(first, RegisterResponse::unavailable(1, 0x611));
        assert_eq!(orch.slot(1).unwrap().interest(), vec![0x611]);

        assert!(wait_until(|| orch.broker().read(1, 0x611).ready));
        assert_eq!(orch.broker().read(1, 0x611).value, 42);
        handle.join().unwrap();
    }

    #[test]
    fn flood_of_misses_keeps_interest_bounded() {
        use crate::slot::MAX_INTEREST_PER_CORE;

        let (orch, _) = orchestrator(1, &[], test_config());
        let handle = park(&orch, 0b1, 1_000_000);
        assert!(wait_until(|| orch.slot(0).unwrap().is_waiting()));

        for register in 0x1000..0x1000 + 20_000 {
            let resp = orch.broker().read(0, register);
            assert!(!resp.ready);
        }
        assert_eq!(
            orch.slot(0).unwrap().interest().len(),
            MAX_INTEREST_PER_CORE
        );

        handle.join().unwrap();
        assert!(orch.slot(0).unwrap().interest().is_empty());
    }

    #[test]
    fn aperf_mperf_pair() {
        let (orch, regs) = orchestrator(1, &[], test_config());
        regs.set(0, MSR_IA32_APERF, 10);
        regs.set(0, MSR_IA32_MPERF, 20);
        let pair = orch.broker().read_aperf_mperf(0);
        assert_eq!(pair.aperf.value, 10);
        assert_eq!(pair.mperf.value, 20);
        assert!(pair.aperf.ready && pair.mperf.ready);
    }
}
