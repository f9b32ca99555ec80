//! Model-specific register access through the Linux `msr` driver.
//!
//! `/dev/cpu/<n>/msr` is a device where an 8-byte read at offset `R` returns
//! MSR `R` of CPU `n`. Reads need `CAP_SYS_RAWIO` and the `msr` module.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::platform::{RegisterAccess, RegisterError};

/// Time-stamp counter.
pub const IA32_TIME_STAMP_COUNTER: u32 = 0x10;
/// Maximum-performance clock count (counts in C0 at the nominal rate).
pub const MSR_IA32_MPERF: u32 = 0xE7;
/// Actual-performance clock count.
pub const MSR_IA32_APERF: u32 = 0xE8;
pub const MSR_CORE_C3_RESIDENCY: u32 = 0x3FC;
pub const MSR_CORE_C6_RESIDENCY: u32 = 0x3FD;
pub const MSR_CORE_C7_RESIDENCY: u32 = 0x3FE;

/// Parse a register address: `0xE7`, `e7h` or decimal `231`.
pub fn parse_register(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(hex) = s.strip_suffix('h').or_else(|| s.strip_suffix('H')) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| format!("'{s}' is not a register address"))
}

/// Reads MSRs from `<root>/<core>/msr`, keeping one open handle per core.
pub struct DevMsr {
    root: PathBuf,
    files: Mutex<HashMap<u32, Arc<File>>>,
}

impl DevMsr {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the device node for core 0 exists.
    pub fn is_available(&self) -> bool {
        self.device_path(0).exists()
    }

    fn device_path(&self, core: u32) -> PathBuf {
        self.root.join(core.to_string()).join("msr")
    }

    fn open(&self, core: u32) -> Result<Arc<File>, RegisterError> {
        let mut files = self.files.lock().unwrap();
        if let Some(file) = files.get(&core) {
            return Ok(Arc::clone(file));
        }
        let path = self.device_path(core);
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RegisterError::NoSuchCore(core),
            _ => RegisterError::Io {
                core,
                register: 0,
                source: e,
            },
        })?;
        let file = Arc::new(file);
        files.insert(core, Arc::clone(&file));
        Ok(file)
    }
}

impl RegisterAccess for DevMsr {
    fn name(&self) -> &'static str {
        "dev-msr"
    }

    #[cfg(unix)]
    fn read(&self, core: u32, register: u32) -> Result<u64, RegisterError> {
        use std::os::unix::fs::FileExt;

        let file = self.open(core)?;
        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, u64::from(register))
            .map_err(|e| match e.raw_os_error() {
                Some(libc::EIO) => RegisterError::Unmapped { core, register },
                _ if e.kind() == io::ErrorKind::UnexpectedEof => {
                    RegisterError::Unmapped { core, register }
                }
                _ => RegisterError::Io {
                    core,
                    register,
                    source: e,
                },
            })?;
        Ok(u64::from_le_bytes(buf))
    }

    #[cfg(not(unix))]
    fn read(&self, _core: u32, _register: u32) -> Result<u64, RegisterError> {
        Err(RegisterError::Unsupported)
    }
}
