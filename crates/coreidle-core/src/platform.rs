//! Hardware seams: register access, the wait primitive, and CPU topology.
//!
//! Everything core-local goes through one of the three traits here so the
//! orchestration logic can run against real hardware or against test doubles.
//! [`Platform::native`] picks the implementations for the current machine.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::hw::affinity::LinuxTopology;
use crate::hw::msr::DevMsr;
use crate::hw::wait::select_wait_primitive;
use crate::trigger::TriggerRegion;

/// Failure reading one register.
#[derive(Debug)]
pub enum RegisterError {
    /// No register access on this platform or build.
    Unsupported,
    /// The register does not exist on this core (the kernel answers `EIO`).
    Unmapped { core: u32, register: u32 },
    /// Core id is not present on this machine.
    NoSuchCore(u32),
    /// Could not pin a thread onto the target core.
    Affinity { core: u32, source: io::Error },
    /// Any other I/O failure from the access path.
    Io {
        core: u32,
        register: u32,
        source: io::Error,
    },
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "register access is not supported on this platform"),
            Self::Unmapped { core, register } => {
                write!(f, "register {register:#x} is not mapped on core {core}")
            }
            Self::NoSuchCore(core) => write!(f, "core {core} is not online"),
            Self::Affinity { core, source } => write!(f, "cannot pin to core {core}: {source}"),
            Self::Io {
                core,
                register,
                source,
            } => write!(f, "reading {register:#x} on core {core}: {source}"),
        }
    }
}

impl std::error::Error for RegisterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Affinity { source, .. } | Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Synchronous read of one hardware register.
///
/// Callers run the read from a thread pinned to `core`; implementations may
/// rely on that.
pub trait RegisterAccess: Send + Sync {
    /// Short identifier for logs and status output.
    fn name(&self) -> &'static str;

    /// Read `register` on `core`.
    fn read(&self, core: u32, register: u32) -> Result<u64, RegisterError>;
}

/// Core-local monitor/wait pair.
pub trait WaitPrimitive: Send + Sync {
    fn name(&self) -> &'static str;

    /// Arm the address monitor on the region's watched line.
    fn monitor(&self, region: &TriggerRegion);

    /// Block until the monitored line is written or a platform event fires.
    ///
    /// May return spuriously; callers re-check the region after every return.
    fn wait(&self, hint: u32);
}

/// Core enumeration and thread pinning.
pub trait CpuTopology: Send + Sync {
    /// Number of logical cores currently online.
    fn online_cores(&self) -> usize;

    /// Bind the calling thread to exactly `core`.
    fn pin_current_thread(&self, core: u32) -> io::Result<()>;

    /// Whether the calling thread may only run on `core`.
    fn is_current_thread_pinned_to(&self, core: u32) -> bool;
}

/// The set of hardware implementations an orchestrator runs against.
#[derive(Clone)]
pub struct Platform {
    pub registers: Arc<dyn RegisterAccess>,
    pub wait: Arc<dyn WaitPrimitive>,
    pub topology: Arc<dyn CpuTopology>,
}

impl Platform {
    /// Implementations for the machine we are running on.
    pub fn native(config: &EngineConfig) -> Self {
        let wait = select_wait_primitive(config.wait_backend, config.poll_interval());
        log::debug!("wait primitive: {}", wait.name());
        Self {
            registers: Arc::new(DevMsr::new(&config.msr_root)),
            wait,
            topology: Arc::new(LinuxTopology),
        }
    }

    /// One-line description, e.g. `msr=dev-msr wait=umwait`.
    pub fn describe(&self) -> String {
        format!(
            "msr={} wait={} cores={}",
            self.registers.name(),
            self.wait.name(),
            self.topology.online_cores()
        )
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("registers", &self.registers.name())
            .field("wait", &self.wait.name())
            .field("online_cores", &self.topology.online_cores())
            .finish()
    }
}
