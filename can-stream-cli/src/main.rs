//! CAN Stream Logger CLI Application
//!
//! Command-line front end for the can-stream-logger library. It adds:
//! - TOML configuration with command-line overrides
//! - A virtual CAN bus, optionally fed by cyclic simulated frames
//! - CSV log files on the first USB drive (or a fallback directory)
//! - An operator console on stdin

use anyhow::{Context, Result};
use can_stream_logger::{CanClient, Job, LogPublisher, PublishSink, VirtualBus};
use clap::Parser;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

mod config;
mod console;
mod simulation;
mod storage;

use config::AppConfig;
use console::Console;
use simulation::Simulator;

/// CAN Stream Logger - Listen to a CAN bus and log the latest values periodically
#[derive(Parser, Debug)]
#[command(name = "can-stream-cli")]
#[command(about = "Listen to a CAN bus and log periodic snapshots to CSV", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Override the listener job (log or publish)
    #[arg(long, value_enum)]
    job: Option<JobArg>,

    /// Override the fallback output directory for log files
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Feed the bus with the configured cyclic frames
    #[arg(long)]
    simulate: bool,

    /// Override the configured bitrate
    #[arg(long, value_name = "BPS")]
    bitrate: Option<u32>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum JobArg {
    Log,
    Publish,
}

impl From<JobArg> for Job {
    fn from(arg: JobArg) -> Self {
        match arg {
            JobArg::Log => Job::Log,
            JobArg::Publish => Job::Publish,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    log::info!("########## CAN Stream Logger v{} ##########", env!("CARGO_PKG_VERSION"));
    log::info!("Using logger library v{}", can_stream_logger::VERSION);

    log::info!("Loading configuration from: {:?}", args.config);
    let mut config = config::load_config(&args.config)?;
    apply_overrides(&mut config, &args);
    config.validate()?;
    log::debug!("Configuration loaded successfully");

    run(config)
}

fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(job) = args.job {
        config.logger.job = job.into();
    }
    if let Some(dir) = &args.output_dir {
        config.storage.output_dir = dir.clone();
    }
    if let Some(bitrate) = args.bitrate {
        config.network.bitrate = bitrate;
    }
    if args.simulate {
        config.simulation.enabled = true;
    }
}

fn run(config: AppConfig) -> Result<()> {
    let publisher: Option<Arc<dyn PublishSink>> = match config.logger.job {
        Job::Publish => Some(Arc::new(LogPublisher) as Arc<dyn PublishSink>),
        Job::Log => None,
    };
    let client = CanClient::new(config.can_messages.clone(), config.logger.clone(), publisher)
        .context("Failed to set up the CAN client")?;

    log::info!(
        "Connecting to {} channel {} at {} bit/s",
        config.network.bustype,
        config.network.channel,
        config.network.bitrate
    );
    let bus = VirtualBus::new(config.network.channel.clone());
    client.rebind(bus.connect())?;

    let mut simulator = if config.simulation.enabled {
        Some(Simulator::start(&bus, &config.simulation.frames)?)
    } else {
        None
    };

    client.start()?;
    println!("{}", console::HELP);

    let console = Console::new(&client, &bus, &config.storage);
    let outcome = console.run(io::stdin().lock());

    log::info!("Stopped listening. Cleaning up..");
    if let Some(simulator) = simulator.as_mut() {
        simulator.stop();
    }
    client.shutdown();
    outcome
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        toml::from_str("[network]\nchannel = \"vcan0\"\n").unwrap()
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "can-stream-cli",
            "--config",
            "truck.toml",
            "--job",
            "publish",
            "--simulate",
            "-vv",
        ]);
        assert_eq!(args.config, PathBuf::from("truck.toml"));
        assert!(matches!(args.job, Some(JobArg::Publish)));
        assert!(args.simulate);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_overrides_apply() {
        let args = Args::parse_from([
            "can-stream-cli",
            "--job",
            "publish",
            "--output-dir",
            "/tmp/logs",
            "--bitrate",
            "250000",
            "--simulate",
        ]);
        let mut config = base_config();
        apply_overrides(&mut config, &args);
        assert_eq!(config.logger.job, Job::Publish);
        assert_eq!(config.storage.output_dir, PathBuf::from("/tmp/logs"));
        assert_eq!(config.network.bitrate, 250_000);
        assert!(config.simulation.enabled);
    }

    #[test]
    fn test_no_overrides_keep_config() {
        let args = Args::parse_from(["can-stream-cli"]);
        let mut config = base_config();
        apply_overrides(&mut config, &args);
        assert_eq!(config.logger.job, Job::Log);
        assert!(!config.simulation.enabled);
        assert_eq!(args.config, PathBuf::from("config.toml"));
    }
}
