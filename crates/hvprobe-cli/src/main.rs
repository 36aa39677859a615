//! CLI for the hvprobe detection battery.
//!
//! Runs the battery, or a single timing fingerprint, against one of the
//! simulated machine profiles and prints the result as JSON on stdout.
//!
//! # Usage
//!
//! ```bash
//! # Basic battery on a simulated KVM guest
//! hvprobe battery --profile kvm
//!
//! # Advanced scope with a config file
//! hvprobe battery --profile hyperv --scope advanced --config probe.json
//!
//! # One fixed-duration fingerprint, cross-core clock on core 1
//! hvprobe measure --op cpuid --long --timekeeper-core 1
//!
//! # List profiles and operations
//! hvprobe list
//! ```
//!
//! Logging goes to stderr through `env_logger`; the default filter is
//! `warn`, override with `RUST_LOG`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use hvprobe::clock::TimekeeperThread;
use hvprobe::sim::{SimCpu, SimProfile};
use hvprobe::{measure_operation, run_battery, BatteryScope, CanonicalOp, Platform, ProbeConfig, ProbeError};
use log::{debug, error};

#[derive(Parser)]
#[command(name = "hvprobe")]
#[command(about = "Probe a (simulated) x86 core for signs of virtualization")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Machine {
    /// Simulated machine profile.
    #[arg(short, long, default_value = "bare-metal-intel")]
    profile: String,

    /// JSON probe configuration; missing keys take their defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RNG seed, overriding the config file.
    #[arg(long)]
    seed: Option<u64>,

    /// Run the cross-core clock on its own thread.
    #[arg(long)]
    timekeeper: bool,

    /// Pin the cross-core clock to this core (implies --timekeeper).
    #[arg(long)]
    timekeeper_core: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detection battery and print the report.
    Battery {
        #[command(flatten)]
        machine: Machine,

        /// "basic" or "advanced".
        #[arg(short, long, default_value = "basic")]
        scope: BatteryScope,
    },

    /// Fingerprint one canonical operation.
    Measure {
        #[command(flatten)]
        machine: Machine,

        /// nop, alu, cpuid, smi or xsetbv.
        #[arg(short, long)]
        op: CanonicalOp,

        /// Repeat the operation for the fixed-duration window.
        #[arg(short, long)]
        long: bool,
    },

    /// List machine profiles and canonical operations.
    List,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Battery { machine, scope } => cmd_battery(&machine, scope),
        Commands::Measure { machine, op, long } => cmd_measure(&machine, op, long),
        Commands::List => {
            cmd_list();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("hvprobe: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(machine: &Machine) -> Result<ProbeConfig, ProbeError> {
    let mut config = match &machine.config {
        Some(path) => ProbeConfig::load(path)?,
        None => ProbeConfig::default(),
    };
    if machine.seed.is_some() {
        config.seed = machine.seed;
    }
    config.validate()?;
    Ok(config)
}

fn spawn_timekeeper(machine: &Machine) -> Result<Option<TimekeeperThread>, ProbeError> {
    if !machine.timekeeper && machine.timekeeper_core.is_none() {
        return Ok(None);
    }
    let thread = TimekeeperThread::spawn(machine.timekeeper_core)?;
    debug!("timekeeper thread started");
    Ok(Some(thread))
}

/// Build the simulated core and a platform around it, then hand both to
/// `body`.
fn with_platform<T>(
    machine: &Machine,
    body: impl FnOnce(&Platform<'_, SimCpu>) -> Result<T, ProbeError>,
) -> Result<T, ProbeError> {
    let profile = SimProfile::from_name(&machine.profile)?;
    let cpu = SimCpu::new(profile);
    let timekeeper = spawn_timekeeper(machine)?;

    let mut platform = Platform::new(&cpu, &cpu);
    if let Some(thread) = &timekeeper {
        platform = platform.with_timekeeper(thread.clock());
    }
    let out = body(&platform);
    drop(platform);
    if let Some(thread) = timekeeper {
        thread.stop();
    }
    out
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), ProbeError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_battery(machine: &Machine, scope: BatteryScope) -> Result<(), ProbeError> {
    let config = load_config(machine)?;
    let report = with_platform(machine, |platform| run_battery(platform, scope, &config))?;
    print_json(&report)
}

fn cmd_measure(machine: &Machine, op: CanonicalOp, long: bool) -> Result<(), ProbeError> {
    let config = load_config(machine)?;
    let evidence = with_platform(machine, |platform| measure_operation(platform, op, long, &config))?;
    print_json(&evidence)
}

fn cmd_list() {
    println!("profiles:");
    for name in SimProfile::NAMES {
        println!("  {name}");
    }
    println!("operations:");
    for op in CanonicalOp::ALL {
        println!("  {:<8} {}", op.name(), op.long_name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_battery_and_measure() {
        let cli = Cli::try_parse_from(["hvprobe", "battery", "--profile", "kvm", "--scope", "advanced"]).unwrap();
        match cli.command {
            Commands::Battery { machine, scope } => {
                assert_eq!(machine.profile, "kvm");
                assert_eq!(scope, BatteryScope::Advanced);
            }
            _ => panic!("expected battery"),
        }

        let cli = Cli::try_parse_from(["hvprobe", "measure", "--op", "cpuid", "--long"]).unwrap();
        match cli.command {
            Commands::Measure { op, long, .. } => {
                assert_eq!(op, CanonicalOp::Cpuid);
                assert!(long);
            }
            _ => panic!("expected measure"),
        }
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!(Cli::try_parse_from(["hvprobe", "measure", "--op", "hlt"]).is_err());
    }

    #[test]
    fn timekeeper_flags_start_and_stop_a_thread() {
        let cli = Cli::try_parse_from(["hvprobe", "measure", "--op", "nop", "--timekeeper"]).unwrap();
        let Commands::Measure { machine, .. } = cli.command else {
            panic!("expected measure");
        };
        let thread = spawn_timekeeper(&machine).unwrap().expect("timekeeper requested");
        thread.stop();

        let cli = Cli::try_parse_from(["hvprobe", "measure", "--op", "nop"]).unwrap();
        let Commands::Measure { machine, .. } = cli.command else {
            panic!("expected measure");
        };
        assert!(spawn_timekeeper(&machine).unwrap().is_none());
    }

    #[test]
    fn seed_flag_overrides_config() {
        let cli = Cli::try_parse_from(["hvprobe", "battery", "--seed", "11"]).unwrap();
        let Commands::Battery { machine, .. } = cli.command else {
            panic!("expected battery");
        };
        assert_eq!(load_config(&machine).unwrap().seed, Some(11));
    }
}
