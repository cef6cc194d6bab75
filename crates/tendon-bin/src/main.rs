//! `tendon-rig`: command-line front end for the tendon actuator rig.
//!
//! # Usage
//!
//! Describe the configured backend and its limits:
//! ```bash
//! tendon-rig --config rig.toml info
//! ```
//!
//! List the test catalogue with parameter ranges:
//! ```bash
//! tendon-rig tests
//! ```
//!
//! Run a test, overriding parameters:
//! ```bash
//! tendon-rig run endurance --set num_cycles=500 --set position_end=7000
//! ```
//!
//! Continue an interrupted endurance run:
//! ```bash
//! tendon-rig run endurance --resume checkpoints/checkpoint_<run id>.json
//! ```
//!
//! Ctrl-C during a run requests a stop; the run ends at its next phase
//! boundary with actuation disabled.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tendon_core::RigConfig;
use tendon_experiment::{
    catalogue, CheckpointStore, ParamKind, ProgressUpdate, RunStatus, TestConfig, TestEngine,
    TestKind,
};
use tendon_hardware::{create_from_config, CalibrationStore, DeviceHandle, SafetyConfig, SafetyMonitor};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tendon-rig")]
#[command(about = "Safety-monitored test execution for tendon actuator rigs", long_about = None)]
struct Cli {
    /// Rig configuration file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and describe the backend, limits and calibration
    Info,

    /// List available tests and their parameters
    Tests {
        /// Print the catalogue as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a test to completion
    Run {
        /// Test kind (torque, hysteresis, stiffness, hold, endurance)
        kind: TestKind,

        /// Parameter override, repeatable
        #[arg(long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,

        /// Checkpoint file of an interrupted run to continue
        #[arg(long, value_name = "CHECKPOINT", conflicts_with = "set")]
        resume: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RigConfig::load(cli.config.as_deref()).context("loading rig configuration")?;

    match cli.command {
        Commands::Info => show_info(&config).await,
        Commands::Tests { json } => list_tests(&config, json),
        Commands::Run { kind, set, resume } => run(&config, kind, &set, resume.as_deref()).await,
    }
}

async fn connect(config: &RigConfig) -> Result<DeviceHandle> {
    let handle = create_from_config(config)?;
    let calibration = CalibrationStore::new(&config.calibration_dir)
        .load_all()
        .await
        .context("loading calibration")?;
    handle.set_calibration(calibration);
    handle
        .connect()
        .await
        .with_context(|| format!("connecting to {} backend", config.backend.kind()))?;
    Ok(handle)
}

async fn show_info(config: &RigConfig) -> Result<()> {
    let handle = connect(config).await?;
    let platform = handle.platform_info();
    let sample = handle.get_sensors().await?;
    handle.disconnect().await?;

    println!("Platform:   {}", platform.name);
    println!("Transport:  {:?}", platform.transport);
    println!("Protocol:   {}", platform.protocol_version);
    println!("Capabilities:");
    for capability in &platform.capabilities {
        println!("  - {capability:?}");
    }
    let limits = config.limits;
    println!("Limits:");
    println!("  current      <= {} mA", limits.current_max);
    println!("  position     {}..={} counts", limits.position_min, limits.position_max);
    println!("  tendon force <= {} mN", limits.force_tendon_max);
    println!("  tip force    <= {} mN", limits.force_tip_max);
    println!("Sensors:    {}", serde_json::to_string(&sample)?);
    Ok(())
}

fn describe(kind: &ParamKind) -> String {
    match kind {
        ParamKind::Float { min, max, default } => format!("{min}..={max} (default {default})"),
        ParamKind::Int { min, max, default } => format!("{min}..={max} (default {default})"),
        ParamKind::Enum { choices, default } => {
            format!("one of {} (default {default})", choices.join("|"))
        }
        ParamKind::Bool { default } => format!("true|false (default {default})"),
    }
}

fn list_tests(config: &RigConfig, json: bool) -> Result<()> {
    let entries = catalogue(&config.limits);
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        println!("{} ({})", entry.name, entry.kind.id());
        println!("  {}", entry.description);
        if let Some(duration) = &entry.default_duration {
            println!("  default run time: {duration}");
        }
        for param in entry.parameters {
            let unit = param.unit.map(|u| format!(" {u}")).unwrap_or_default();
            println!(
                "    {:<22} {}{unit}  {}",
                param.name,
                describe(&param.kind),
                param.description
            );
        }
        println!();
    }
    Ok(())
}

/// Parse `--set` overrides against the schema of `kind`.
fn build_config(kind: TestKind, assignments: &[String]) -> Result<TestConfig> {
    let mut config = TestConfig::new();
    config.apply_assignments(kind.schema(), assignments.iter().map(String::as_str))?;
    Ok(config)
}

fn log_progress(update: &ProgressUpdate) {
    if update.warning {
        warn!(status = %update.status, "{}", update.message);
    } else {
        info!(
            status = %update.status,
            progress = format_args!("{:.1}%", update.fraction * 100.0),
            "{}",
            update.message
        );
    }
}

async fn run(
    config: &RigConfig,
    kind: TestKind,
    assignments: &[String],
    resume: Option<&Path>,
) -> Result<()> {
    let checkpoint = match resume {
        Some(path) => {
            let checkpoint = CheckpointStore::load(path)
                .await
                .with_context(|| format!("reading checkpoint {}", path.display()))?;
            if checkpoint.kind != kind {
                bail!(
                    "checkpoint {} belongs to a {} run, not {kind}",
                    path.display(),
                    checkpoint.kind
                );
            }
            Some(checkpoint)
        }
        None => None,
    };
    let test_config = build_config(kind, assignments)?;

    let handle = connect(config).await?;
    handle.start_streaming(config.streaming.rate_hz).await?;
    let monitor = SafetyMonitor::new(
        handle.clone(),
        config.limits,
        SafetyConfig::from(&config.safety),
    );
    monitor.start().await;
    let engine = TestEngine::new(handle.clone(), config.limits)
        .with_safety(monitor.clone())
        .with_checkpoints(CheckpointStore::new(&config.checkpoint_dir));

    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
    let outcome = {
        let execution = async {
            match &checkpoint {
                Some(checkpoint) => engine.resume_test(checkpoint, &tx).await,
                None => engine.run_test(kind, &test_config, &tx).await,
            }
        };
        tokio::pin!(execution);
        loop {
            tokio::select! {
                outcome = &mut execution => break outcome,
                Some(update) = rx.recv() => log_progress(&update),
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupt received, stopping the run");
                    if let Err(err) = engine.stop() {
                        warn!(error = %err, "Nothing to stop");
                    }
                }
            }
        }
    };
    while let Ok(update) = rx.try_recv() {
        log_progress(&update);
    }

    monitor.stop().await;
    if let Err(err) = handle.stop_streaming().await {
        warn!(error = %err, "Streaming did not stop cleanly");
    }
    if let Err(err) = handle.disconnect().await {
        warn!(error = %err, "Disconnect failed");
    }

    let state = outcome?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    match state.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Aborted if state.checkpoint.is_some() => bail!(
            "run {} aborted; resume with --resume {}",
            state.run_id,
            config
                .checkpoint_dir
                .join(format!("checkpoint_{}.json", state.run_id))
                .display()
        ),
        status => bail!("run {} ended {status}: {}", state.run_id, state.message),
    }
}
