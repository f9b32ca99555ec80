//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hw::msr::{
    MSR_CORE_C3_RESIDENCY, MSR_CORE_C6_RESIDENCY, MSR_CORE_C7_RESIDENCY, MSR_IA32_APERF,
    MSR_IA32_MPERF,
};
use crate::state::MAX_DURATION_US;

/// Which wait primitive workers use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitBackend {
    /// `umwait` when the CPU has WAITPKG, polling otherwise.
    #[default]
    Auto,
    /// User-level UMONITOR/UMWAIT.
    Umwait,
    /// Sleep-and-recheck loop. Works everywhere, never enters a C-state.
    Poll,
}

impl std::str::FromStr for WaitBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "umwait" => Ok(Self::Umwait),
            "poll" => Ok(Self::Poll),
            other => Err(format!("unknown wait backend '{other}' (auto, umwait, poll)")),
        }
    }
}

/// Tunables for an [`Orchestrator`](crate::orchestrator::Orchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest idle duration a command may ask for.
    ///
    /// **Default:** `15_000_000` (15 s)
    pub max_duration_us: u32,

    /// Process-wide number of register sample slots.
    ///
    /// **Default:** `50`
    pub sample_cache_capacity: usize,

    /// Registers every worker samples on each re-arm cycle.
    ///
    /// **Default:** MPERF, APERF and the core C3/C6/C7 residency counters.
    pub tracked_registers: Vec<u32>,

    /// Directory holding `<core>/msr` device nodes.
    ///
    /// **Default:** `/dev/cpu`
    pub msr_root: PathBuf,

    /// **Default:** [`WaitBackend::Auto`]
    pub wait_backend: WaitBackend,

    /// Sleep between re-checks for the polling wait backend.
    ///
    /// **Default:** `50`
    pub poll_interval_us: u64,

    /// Snapshot residency counters when a worker starts and exits.
    ///
    /// **Default:** `false`
    pub collect_residency: bool,

    /// How long a launch waits for a worker's first arm before tripping anyway.
    ///
    /// **Default:** `1000`
    pub arm_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_duration_us: MAX_DURATION_US,
            sample_cache_capacity: 50,
            tracked_registers: vec![
                MSR_IA32_MPERF,
                MSR_IA32_APERF,
                MSR_CORE_C3_RESIDENCY,
                MSR_CORE_C6_RESIDENCY,
                MSR_CORE_C7_RESIDENCY,
            ],
            msr_root: PathBuf::from("/dev/cpu"),
            wait_backend: WaitBackend::Auto,
            poll_interval_us: 50,
            collect_residency: false,
            arm_timeout_ms: 1000,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us.max(1))
    }

    pub fn arm_timeout(&self) -> Duration {
        Duration::from_millis(self.arm_timeout_ms)
    }
}

/// Load an engine config from a JSON file. Missing fields take their defaults.
pub fn load_config_from_path(path: &Path) -> std::io::Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)?;
    let config = serde_json::from_str::<EngineConfig>(&raw).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("failed to parse config JSON: {e}"),
        )
    })?;
    if config.max_duration_us > MAX_DURATION_US {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("max_duration_us may not exceed {MAX_DURATION_US}"),
        ));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_duration_us, 15_000_000);
        assert_eq!(config.sample_cache_capacity, 50);
        assert_eq!(config.tracked_registers.len(), 5);
        assert_eq!(config.wait_backend, WaitBackend::Auto);
        assert!(!config.collect_residency);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"sample_cache_capacity": 8, "wait_backend": "poll", "msr_root": "/tmp/cpu"}}"#
        )
        .unwrap();
        let config = load_config_from_path(file.path()).unwrap();
        assert_eq!(config.sample_cache_capacity, 8);
        assert_eq!(config.wait_backend, WaitBackend::Poll);
        assert_eq!(config.msr_root, PathBuf::from("/tmp/cpu"));
        assert_eq!(config.max_duration_us, MAX_DURATION_US);
    }

    #[test]
    fn rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = load_config_from_path(file.path()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_ceiling_above_hard_limit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_duration_us": 20000000}}"#).unwrap();
        assert!(load_config_from_path(file.path()).is_err());
    }

    #[test]
    fn backend_names() {
        assert_eq!("poll".parse::<WaitBackend>(), Ok(WaitBackend::Poll));
        assert_eq!("umwait".parse::<WaitBackend>(), Ok(WaitBackend::Umwait));
        assert!("mwait".parse::<WaitBackend>().is_err());
    }
}
