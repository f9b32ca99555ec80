//! CLI for coreidle: park CPU cores in a chosen C-state and read their counters.

mod commands;

use clap::{Parser, Subcommand};
use coreidle_core::CoreMask;
use coreidle_core::hw::msr::parse_register;

use commands::EngineArgs;

#[derive(Parser)]
#[command(name = "coreidle")]
#[command(about = "coreidle: park CPU cores in a chosen C-state and read their counters")]
#[command(version = coreidle_core::VERSION)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    /// Log at debug level (RUST_LOG still wins when set)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show online cores, the register and wait backends, and per-core worker state
    Cores {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Park cores in an idle state for a fixed time.
    /// Stays in the foreground until every core has been released.
    Idle {
        /// Core list, e.g. 0,2,4-7
        #[arg(long, conflicts_with = "mask", required_unless_present = "mask")]
        cores: Option<CoreMask>,

        /// Hex core mask, e.g. 0x5 for cores 0 and 2
        #[arg(long)]
        mask: Option<CoreMask>,

        /// Target state: active, c1, c3, c6, c7 or a raw state id
        #[arg(long, default_value = "c1")]
        state: String,

        /// How long to stay idle, in microseconds
        #[arg(long)]
        duration_us: u32,

        /// Print the launch report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read one model-specific register on one core
    Read {
        #[arg(long)]
        core: u32,

        /// Register address: 0xE7, E7h or decimal
        #[arg(long, value_parser = parse_register)]
        register: u32,

        /// Print the response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read APERF and MPERF on one core
    AperfMperf {
        #[arg(long)]
        core: u32,

        /// Print the pair as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP control plane
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port
        #[arg(long, default_value = "8044")]
        port: u16,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Cores { json } => commands::cores::run(&cli.engine, json),
        Commands::Idle {
            cores,
            mask,
            state,
            duration_us,
            json,
        } => {
            // clap guarantees exactly one of the two.
            let core_mask = cores.or(mask).unwrap_or_default();
            commands::idle::run(&cli.engine, core_mask, &state, duration_us, json)
        }
        Commands::Read {
            core,
            register,
            json,
        } => commands::read::run(&cli.engine, core, register, json),
        Commands::AperfMperf { core, json } => {
            commands::aperf_mperf::run(&cli.engine, core, json)
        }
        Commands::Serve { host, port } => commands::serve::run(&cli.engine, &host, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use coreidle_core::WaitBackend;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_idle_needs_cores_or_mask() {
        assert!(Cli::try_parse_from(["coreidle", "idle", "--duration-us", "10"]).is_err());
        assert!(
            Cli::try_parse_from([
                "coreidle", "idle", "--cores", "0", "--mask", "0x1", "--duration-us", "10"
            ])
            .is_err()
        );
    }

    #[test]
    fn test_idle_with_hex_mask_and_global_flags() {
        let cli = Cli::try_parse_from([
            "coreidle",
            "idle",
            "--mask",
            "0x5",
            "--state",
            "c6",
            "--duration-us",
            "2000",
            "--wait-backend",
            "poll",
        ])
        .unwrap();
        assert_eq!(cli.engine.wait_backend, Some(WaitBackend::Poll));
        match cli.command {
            Commands::Idle {
                cores,
                mask,
                state,
                duration_us,
                ..
            } => {
                assert!(cores.is_none());
                assert_eq!(mask.unwrap().cores().collect::<Vec<_>>(), vec![0, 2]);
                assert_eq!(state, "c6");
                assert_eq!(duration_us, 2000);
            }
            _ => panic!("expected idle"),
        }
    }

    #[test]
    fn test_read_accepts_register_suffix_form() {
        let cli = Cli::try_parse_from(["coreidle", "read", "--core", "1", "--register", "E7h"])
            .unwrap();
        match cli.command {
            Commands::Read { core, register, .. } => assert_eq!((core, register), (1, 0xE7)),
            _ => panic!("expected read"),
        }
    }
}
