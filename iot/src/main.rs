//! IoT daemon - device registry with group temperature queries
//!
//! CLI entry point for running the registry and simulating group queries.

use std::fs;

use clap::{CommandFactory, Parser};
use colored::Colorize;
use eyre::{Context, Result};
use rand::Rng;
use tracing::{debug, info};

use iotdaemon::cli::{Cli, Command, OutputFormat, get_log_dir, get_log_path};
use iotdaemon::config::Config;
use iotdaemon::domain::TemperatureReading;
use iotdaemon::query::{GroupQuery, RespondAllTemperatures};
use iotdaemon::system::IotSystem;
use iotdaemon::Watchable;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_dir = get_log_dir();
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(get_log_path()).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    // Setup logging with priority: CLI > config > INFO default
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Start) => {
            debug!("main: matched Start command");
            cmd_start(&config).await
        }
        Some(Command::Simulate {
            group,
            devices,
            empty,
            stop,
            timeout_ms,
            format,
        }) => {
            debug!(%group, devices, ?empty, ?stop, ?timeout_ms, %format, "main: matched Simulate command");
            cmd_simulate(&config, &group, devices, &empty, &stop, timeout_ms, format).await
        }
        None => {
            debug!("main: no command specified, printing help");
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Run the registry until Ctrl-C
async fn cmd_start(config: &Config) -> Result<()> {
    debug!("cmd_start: called");
    let system = IotSystem::start(config);
    println!("IoT daemon running, logging to {}", get_log_path().display());
    println!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    debug!("cmd_start: ctrl_c received, initiating shutdown");

    system.shutdown().await?;
    println!("IoT daemon stopped");
    Ok(())
}

/// Register devices, record readings, stop some devices and query the group
async fn cmd_simulate(
    config: &Config,
    group_id: &str,
    devices: usize,
    empty: &[String],
    stop: &[String],
    timeout_ms: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    debug!(%group_id, devices, "cmd_simulate: called");
    let system = IotSystem::start(config);
    let manager = system.manager().clone();
    let timeout = timeout_ms
        .map(std::time::Duration::from_millis)
        .unwrap_or_else(|| system.query_timeout());

    let mut request_id = 0;
    for n in 1..=devices {
        let device_id = format!("device-{}", n);
        let device = manager
            .track_device(group_id, &device_id)
            .await
            .context(format!("Failed to register {}", device_id))?;

        if !empty.contains(&device_id) {
            let value = rand::rng().random_range(15.0..30.0);
            device
                .record_temperature(request_id, value)
                .await
                .context(format!("Failed to record temperature on {}", device_id))?;
            debug!(%device_id, value, "cmd_simulate: recorded temperature");
        }
        request_id += 1;
    }

    let response = if stop.is_empty() {
        manager
            .query_group(request_id, group_id, timeout)
            .await
            .context(format!("Failed to query group {}", group_id))?
    } else {
        // Snapshot first so stopped devices are still part of the query
        let group = manager
            .group(group_id)
            .await?
            .ok_or_else(|| eyre::eyre!("Unknown group: {}", group_id))?;
        let snapshot = group.snapshot().await?;

        for device_id in stop {
            match snapshot.get(device_id) {
                Some(device) => {
                    device.stop().await?;
                    device.terminated().await;
                    debug!(%device_id, "cmd_simulate: stopped device");
                }
                None => eprintln!("Warning: no device named '{}' in {}", device_id, group_id),
            }
        }

        GroupQuery::run(request_id, snapshot, timeout).await
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Text => print_response(group_id, &response),
    }

    system.shutdown().await
}

fn print_response(group_id: &str, response: &RespondAllTemperatures) {
    println!(
        "{} {} (request {})",
        "Group".bold(),
        group_id.bold(),
        response.request_id
    );

    if response.temperatures.is_empty() {
        println!("  {}", "no devices".dimmed());
        return;
    }

    let width = response.temperatures.keys().map(|id| id.len()).max().unwrap_or(0);
    for (device_id, reading) in &response.temperatures {
        let status = match reading {
            TemperatureReading::Temperature(_) => reading.to_string().green(),
            TemperatureReading::NotAvailable => reading.to_string().yellow(),
            TemperatureReading::DeviceNotAvailable => reading.to_string().red(),
            TemperatureReading::TimedOut => reading.to_string().magenta(),
        };
        println!("  {:width$}  {}", device_id, status, width = width);
    }

    println!(
        "{} of {} devices answered",
        response.answered(),
        response.temperatures.len()
    );
}
