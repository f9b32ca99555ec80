pub mod aperf_mperf;
pub mod cores;
pub mod idle;
pub mod read;
pub mod serve;

use std::io;
use std::path::PathBuf;

use clap::Args;
use coreidle_core::{
    CommandEndpoint, EngineConfig, IdleState, Orchestrator, WaitBackend, load_config_from_path,
};
use serde::Serialize;

/// Engine options shared by every subcommand. Flags win over the config file.
#[derive(Args, Debug, Default)]
pub struct EngineArgs {
    /// Engine config JSON; fields left out take their defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding <core>/msr device nodes (default: /dev/cpu)
    #[arg(long, global = true)]
    pub msr_root: Option<PathBuf>,

    /// Wait primitive: auto, umwait or poll
    #[arg(long, global = true)]
    pub wait_backend: Option<WaitBackend>,

    /// Snapshot residency counters around every worker's wait
    #[arg(long, global = true)]
    pub residency: bool,
}

/// Resolve the engine config: file (or defaults), then flag overrides.
pub fn engine_config(args: &EngineArgs) -> io::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(path)?,
        None => EngineConfig::default(),
    };
    if let Some(root) = &args.msr_root {
        config.msr_root = root.clone();
    }
    if let Some(backend) = args.wait_backend {
        config.wait_backend = backend;
    }
    if args.residency {
        config.collect_residency = true;
    }
    Ok(config)
}

/// Build an endpoint on the native platform, or exit with the config error.
pub fn make_endpoint(args: &EngineArgs) -> CommandEndpoint {
    let config = match engine_config(args) {
        Ok(config) => config,
        Err(e) => {
            let path = args
                .config
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            eprintln!("Error: cannot load config {path}: {e}");
            std::process::exit(1);
        }
    };
    CommandEndpoint::new(Orchestrator::native(config))
}

/// Parse a state name, falling back to a raw id so the engine can refuse it.
pub fn parse_state(s: &str) -> Result<u8, String> {
    match s.parse::<IdleState>() {
        Ok(state) => Ok(state.id()),
        Err(e) => s.trim().parse::<u8>().map_err(|_| e),
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Error: cannot encode JSON: {e}");
            std::process::exit(1);
        }
    }
}
