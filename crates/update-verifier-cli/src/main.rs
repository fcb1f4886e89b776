/*
 * SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chassis_sim::{FleetConfig, SimulatedChassis};
use clap::{Parser, ValueEnum};
use eyre::WrapErr;
use prettytable::{Table, row};
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use update_verifier::{
    BatchCoordinator, BatchReport, Clock, DeviceId, ImageRef, ScaledClock, Slot, UpdateRequest,
    VerifierConfig,
};

#[derive(Debug, Parser)]
#[command(
    name = "fw-update-verify",
    about = "Start and verify dual-slot firmware updates on a simulated chassis",
    version
)]
struct Options {
    /// Verifier configuration (TOML). Values can be overridden with
    /// FW_VERIFY__* environment variables.
    #[arg(long, env = "FW_VERIFY_CONFIG")]
    config: Option<PathBuf>,

    /// Simulated fleet description (TOML)
    #[arg(long)]
    fleet: PathBuf,

    #[arg(long, value_enum, default_value_t = SlotArg::Primary)]
    slot: SlotArg,

    /// Firmware image handed to every device
    #[arg(long, default_value = "/fw/psu/image.hex")]
    image: String,

    /// Number of devices to select from the inventory (defaults to the
    /// configured batch size)
    #[arg(long, conflicts_with = "devices")]
    count: Option<usize>,

    /// Explicit device to update, can be repeated
    #[arg(long = "device", value_name = "ID")]
    devices: Vec<String>,

    /// Simulated seconds per wall clock second
    #[arg(long, default_value_t = 60)]
    time_scale: u32,

    /// Print the report as JSON instead of a table
    #[arg(long)]
    json: bool,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SlotArg {
    Primary,
    Secondary,
}

impl From<SlotArg> for Slot {
    fn from(slot: SlotArg) -> Self {
        match slot {
            SlotArg::Primary => Slot::Primary,
            SlotArg::Secondary => Slot::Secondary,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, eyre::Report> {
    let options = Options::parse();
    let _guard = init_logging(&options)?;

    let config = VerifierConfig::load(options.config.as_deref())?;
    let fleet = FleetConfig::load(&options.fleet)?;
    tracing::info!(
        devices = fleet.devices.len(),
        time_scale = options.time_scale,
        "Loaded simulated fleet"
    );

    let clock: Arc<dyn Clock> = Arc::new(ScaledClock::new(options.time_scale));
    let chassis = Arc::new(SimulatedChassis::new(fleet, clock.clone()));
    let coordinator = BatchCoordinator::new(
        chassis.clone(),
        chassis.clone(),
        chassis,
        clock,
        config.clone(),
    );

    let slot = Slot::from(options.slot);
    let image = ImageRef::new(options.image.clone());
    let kind = config.device_kind;
    let request_factory =
        |device_id: &DeviceId| UpdateRequest::new(device_id.clone(), kind, slot, image.clone());

    let report = if options.devices.is_empty() {
        coordinator
            .select_and_run(options.count.unwrap_or(config.batch_size), request_factory)
            .await?
    } else {
        let devices: Vec<DeviceId> = options
            .devices
            .iter()
            .map(|id| DeviceId::new(id.as_str()))
            .collect();
        coordinator
            .run_batch(&devices, request_factory, config.poll, config.minimum_reserve)
            .await?
    };

    if options.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).wrap_err("Failed to serialize report")?
        );
    } else {
        print_report(&report);
    }

    Ok(if report.result {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_logging(
    options: &Options,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, eyre::Report> {
    let env_filter = || -> Result<EnvFilter, eyre::Report> {
        Ok(EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .parse(&options.log_level)
            .wrap_err_with(|| format!("Invalid log level {:?}", options.log_level))?
            .add_directive("tokio=warn".parse()?)
            .add_directive("runtime=warn".parse()?))
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_filter(env_filter()?);

    let Some(log_file) = &options.log_file else {
        tracing_subscriber::registry().with(console_layer).try_init()?;
        return Ok(None);
    };

    let directory = log_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = log_file
        .file_name()
        .ok_or_else(|| eyre::eyre!("Invalid log file path {}", log_file.display()))?;
    let file_appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer)
        .with_filter(env_filter()?);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;
    Ok(Some(guard))
}

fn print_report(report: &BatchReport) {
    let mut table = Table::new();
    table.set_titles(row![
        "Device",
        "Verdict",
        "Revision Before",
        "Revision After",
        "Last Stage",
        "Samples",
        "Diagnostic"
    ]);

    for (device_id, outcome) in &report.outcomes {
        let record = outcome.record.as_ref();
        table.add_row(row![
            device_id,
            outcome.verdict.label(),
            record.map(|r| r.revision_before.as_str()).unwrap_or("-"),
            record
                .and_then(|r| r.revision_after.as_deref())
                .unwrap_or("-"),
            record.map(|r| r.stage.as_str()).unwrap_or("-"),
            record.map_or(0, |r| r.samples.len()),
            outcome.diagnostic
        ]);
    }

    table.printstd();

    let counts = report.counts();
    println!(
        "Result: {} ({} passed, {} failed, {} timed out, {} skipped) in {}s",
        if report.result { "PASSED" } else { "FAILED" },
        counts.passed,
        counts.failed,
        counts.timed_out,
        counts.skipped,
        (report.finished_at - report.started_at).num_seconds()
    );
    let infrastructure = report.infrastructure_failures();
    if !infrastructure.is_empty() {
        println!(
            "Infrastructure failures (not firmware defects): {}",
            infrastructure
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
}
