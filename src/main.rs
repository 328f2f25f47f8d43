//! CLI Entry Point for infer-daq
//!
//! Runs the two-channel acquisition and inference pipeline against the built-in mock
//! devices, or prints the effective configuration.
//!
//! # Usage
//!
//! Run until Ctrl-C, logging raw windows and results to CSV:
//! ```bash
//! infer-daq run --config infer-daq.toml --raw-to-file --result-to-file
//! ```
//!
//! Run 500 windows per channel and drive results onto the output device:
//! ```bash
//! infer-daq run --windows 500 --result-to-device
//! ```
//!
//! Show the configuration after file and environment overrides:
//! ```bash
//! infer-daq config --config infer-daq.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use infer_daq::hardware::{MockAcquisition, MockInference, MockOutput};
use infer_daq::{logging, ChannelDevices, ChannelId, Pipeline, PipelineConfig, PipelineError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "infer-daq")]
#[command(about = "Dual-channel real-time acquisition and inference pipeline", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "infer-daq.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until the devices run dry or Ctrl-C
    Run {
        /// Persist raw windows to CSV
        #[arg(long)]
        raw_to_file: bool,

        /// Forward raw windows to the output device
        #[arg(long)]
        raw_to_device: bool,

        /// Persist inference results to CSV
        #[arg(long)]
        result_to_file: bool,

        /// Drive inference results onto the output device
        #[arg(long)]
        result_to_device: bool,

        /// Stop each channel after this many windows (0 = run until Ctrl-C)
        #[arg(long)]
        windows: Option<u64>,

        /// Override the configured log level
        #[arg(long)]
        log_level: Option<String>,

        /// Print the run report as JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = PipelineConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            raw_to_file,
            raw_to_device,
            result_to_file,
            result_to_device,
            windows,
            log_level,
            json,
        } => {
            let sinks = &mut config.sinks;
            sinks.raw_to_file |= raw_to_file;
            sinks.raw_to_device |= raw_to_device;
            sinks.result_to_file |= result_to_file;
            sinks.result_to_device |= result_to_device;
            if let Some(windows) = windows {
                config.acquisition.window_limit = windows;
            }
            if let Some(level) = log_level {
                config.application.log_level = level;
            }
            config.validate()?;
            run(config, json)
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn mock_devices(config: &PipelineConfig, channel: ChannelId) -> ChannelDevices {
    let acquisition = MockAcquisition::synthetic(channel.number() as u64)
        .with_window_limit(config.acquisition.window_limit)
        .with_interval(Duration::from_millis(config.acquisition.window_interval_ms));

    ChannelDevices {
        acquisition: Box::new(acquisition),
        output: Some(Box::new(MockOutput::new())),
        engine: Box::new(MockInference::features()),
    }
}

fn run(config: PipelineConfig, json: bool) -> Result<ExitCode> {
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(app = %config.application.name, "Starting pipeline");

    let devices = ChannelId::ALL.map(|channel| mock_devices(&config, channel));
    let pipeline = Pipeline::new(config);

    let shutdown = pipeline.shutdown_token();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received...");
        shutdown.trigger();
    })?;

    let report = pipeline.run(devices)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }

    match report.failure() {
        Some(PipelineError::RunFailed(causes)) => {
            for cause in &causes {
                warn!("{}", cause);
            }
            Ok(ExitCode::FAILURE)
        }
        Some(other) => {
            warn!("{}", other);
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}
