/* src/main.rs */
#![warn(missing_docs)]
//! # Kinetra CLI - Real-Time Diffusion-Policy Inference Engine
//!
//! Command-line interface for the Kinetra serving stack: run the closed-loop
//! inference server against a trained policy bundle, drive one-shot
//! predictions from observation files, benchmark sampling latency, and
//! inspect checkpoint bundles.
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kinetra::kinetra_core::{
    ExecContext, FusionEncoderConfig, PolicyBundle, PolicyConfig, UniformResampler,
};
use kinetra::servo_link::{
    PayloadMap, ResponseServer, ServoLoop, ServoLoopConfig, TensorPayload, DEFAULT_HOST,
    DEFAULT_PORT,
};
use kinetra::timescope::TimeScope;

// =====================================================================================
// CLI CONFIGURATION & ARGUMENTS
// =====================================================================================

/// Kinetra CLI - Real-Time Diffusion-Policy Inference Engine
#[derive(Parser, Debug)]
#[command(
    name = "kinetra",
    version = env!("CARGO_PKG_VERSION"),
    author = "Lord Xyn <lord.xyn@arcmoon.studios>",
    about = "Closed-loop diffusion-policy inference server for dexterous robot control"
)]
struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "json", global = true)]
    output_format: OutputFormat,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the closed-loop inference server
    Serve {
        /// Server bind address
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,

        /// Server port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Path to the trained policy bundle
        #[arg(long)]
        checkpoint: PathBuf,

        /// Override the bundle's denoising iteration count
        #[arg(long)]
        inference_steps: Option<usize>,

        /// Point count every received cloud is resampled to
        #[arg(long, default_value = "4096")]
        target_points: usize,
    },

    /// Run one prediction from an observation file
    Predict {
        /// Path to the trained policy bundle
        #[arg(long)]
        checkpoint: PathBuf,

        /// JSON observation payload (modality-keyed tensors)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (stdout if not specified)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Point count every received cloud is resampled to
        #[arg(long, default_value = "4096")]
        target_points: usize,
    },

    /// Benchmark sampling latency with a seeded policy
    Bench {
        /// Number of timed prediction cycles
        #[arg(short, long, default_value = "50")]
        iterations: usize,

        /// Denoising iterations per prediction
        #[arg(long, default_value = "10")]
        inference_steps: usize,

        /// Synthetic point count per observation frame
        #[arg(long, default_value = "4096")]
        points: usize,

        /// Seed for the synthetic policy weights
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },

    /// Summarize a policy bundle
    Info {
        /// Path to the trained policy bundle
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

/// Log verbosity selection
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    /// Trace-level logging
    Trace,
    /// Debug-level logging
    Debug,
    /// Info-level logging
    Info,
    /// Warn-level logging
    Warn,
    /// Error-level logging
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Output serialization formats
#[derive(Debug, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Pretty-printed JSON
    Json,
    /// YAML
    Yaml,
    /// Plain text summary
    Text,
}

// =====================================================================================
// APPLICATION CONFIGURATION
// =====================================================================================

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AppConfig {
    /// Serving loop settings
    serving: ServingConfig,

    /// Log sink settings
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServingConfig {
    pub predict_threshold_us: u64,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            predict_threshold_us: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggingConfig {
    pub file_logging: bool,
    pub log_directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_logging: false,
            log_directory: PathBuf::from("logs"),
        }
    }
}

// =====================================================================================
// SERVE COMMAND IMPLEMENTATION
// =====================================================================================

/// Execute the serve command
async fn cmd_serve(
    host: String,
    port: u16,
    checkpoint: PathBuf,
    inference_steps: Option<usize>,
    target_points: usize,
    app: &AppConfig,
) -> Result<()> {
    info!("Starting Kinetra inference server");
    info!("Address: {}:{}", host, port);

    let mut bundle = {
        let _scope = TimeScope::new("init policy");
        PolicyBundle::load(&checkpoint)
            .with_context(|| format!("Failed to load policy bundle: {}", checkpoint.display()))?
    };
    if let Some(steps) = inference_steps {
        bundle.config.num_inference_steps = steps;
    }
    info!(
        "Bundle created {}, {} inference steps, wrist={}",
        bundle.created_at,
        bundle.config.num_inference_steps,
        bundle.config.profile.use_wrist
    );

    let policy = bundle
        .into_policy(ExecContext::default())
        .context("Failed to assemble policy from bundle")?;
    let mut servo = ServoLoop::new(
        policy,
        Box::new(UniformResampler::default()),
        ServoLoopConfig {
            target_points,
            predict_threshold: Duration::from_micros(app.serving.predict_threshold_us),
        },
    );

    let mut server = ResponseServer::bind(&host, port)
        .await
        .with_context(|| format!("Failed to bind {host}:{port}"))?;
    info!("init server done");

    tokio::select! {
        result = servo.run(&mut server) => {
            result.context("serving loop terminated")?;
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

// =====================================================================================
// PREDICT COMMAND IMPLEMENTATION
// =====================================================================================

/// Execute one file-driven prediction
async fn cmd_predict(
    checkpoint: PathBuf,
    input: PathBuf,
    output: Option<PathBuf>,
    target_points: usize,
    output_format: OutputFormat,
) -> Result<()> {
    let bundle = PolicyBundle::load(&checkpoint)
        .with_context(|| format!("Failed to load policy bundle: {}", checkpoint.display()))?;
    let policy = bundle.into_policy(ExecContext::default())?;

    let payload: PayloadMap = serde_json::from_str(
        &fs::read_to_string(&input)
            .with_context(|| format!("Failed to read observation file: {}", input.display()))?,
    )
    .context("Failed to parse observation payload")?;

    let servo = ServoLoop::new(
        policy,
        Box::new(UniformResampler::default()),
        ServoLoopConfig {
            target_points,
            ..Default::default()
        },
    );
    let obs = servo.build_observation(&payload)?;

    let start = Instant::now();
    let predicted = servo.policy().predict_action(&obs, None)?;
    let elapsed = start.elapsed();

    let action = predicted.action.index_axis(ndarray::Axis(0), 0).to_owned();
    let result = PredictionResult {
        n_action_steps: action.shape()[0],
        action_dim: action.shape()[1],
        action: TensorPayload::from_array2(&action),
        prediction_time_ms: elapsed.as_millis() as u64,
    };

    let rendered = match output_format {
        OutputFormat::Json => serde_json::to_string_pretty(&result)?,
        OutputFormat::Yaml => serde_yaml::to_string(&result)?,
        OutputFormat::Text => format!(
            "Action steps: {}\nAction dim: {}\nPrediction time: {} ms\n",
            result.n_action_steps, result.action_dim, result.prediction_time_ms
        ),
    };

    match output {
        Some(path) => {
            fs::write(&path, rendered)
                .with_context(|| format!("Failed to write output to: {}", path.display()))?;
            info!("Prediction written to: {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct PredictionResult {
    n_action_steps: usize,
    action_dim: usize,
    action: TensorPayload,
    prediction_time_ms: u64,
}

// =====================================================================================
// BENCHMARK COMMAND IMPLEMENTATION
// =====================================================================================

/// Execute the latency benchmark
async fn cmd_bench(
    iterations: usize,
    inference_steps: usize,
    points: usize,
    seed: u64,
    output_format: OutputFormat,
) -> Result<()> {
    use ndarray::{Array3, Array4};

    info!("Benchmarking sampling latency");
    info!(
        "Iterations: {}, inference steps: {}, points: {}",
        iterations, inference_steps, points
    );
    anyhow::ensure!(iterations > 0, "iterations must be positive");

    let config = PolicyConfig {
        num_inference_steps: inference_steps,
        ..Default::default()
    };
    let bundle = PolicyBundle::seeded(config, FusionEncoderConfig::default(), 256, 64, seed)?;
    let policy = bundle.into_policy(ExecContext::default())?;

    let obs = kinetra::kinetra_core::ObservationBatch {
        point_cloud: Some(Array4::from_shape_fn((1, 2, points, 3), |(_, t, n, c)| {
            ((t * 31 + n * 7 + c) % 13) as f32 * 0.1
        })),
        agent_pos: Some(Array3::from_elem((1, 2, 20), 0.25)),
        ..Default::default()
    };

    // Warm-up cycle outside the timed window.
    let _ = policy.predict_action(&obs, None)?;

    let mut latencies_us = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let start = Instant::now();
        let predicted = policy.predict_action(&obs, None)?;
        latencies_us.push(start.elapsed().as_micros() as u64);
        std::hint::black_box(predicted.action);
    }
    latencies_us.sort_unstable();

    let total: u64 = latencies_us.iter().sum();
    let report = BenchReport {
        iterations,
        inference_steps,
        points,
        mean_us: total / iterations as u64,
        p50_us: latencies_us[iterations / 2],
        p99_us: latencies_us[(iterations * 99 / 100).min(iterations - 1)],
        max_us: *latencies_us.last().expect("non-empty latencies"),
    };

    let rendered = match output_format {
        OutputFormat::Json => serde_json::to_string_pretty(&report)?,
        OutputFormat::Yaml => serde_yaml::to_string(&report)?,
        OutputFormat::Text => format!(
            "mean={}us p50={}us p99={}us max={}us over {} iterations\n",
            report.mean_us, report.p50_us, report.p99_us, report.max_us, report.iterations
        ),
    };
    println!("{rendered}");
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct BenchReport {
    iterations: usize,
    inference_steps: usize,
    points: usize,
    mean_us: u64,
    p50_us: u64,
    p99_us: u64,
    max_us: u64,
}

// =====================================================================================
// INFO COMMAND IMPLEMENTATION
// =====================================================================================

/// Summarize a policy bundle
async fn cmd_info(checkpoint: PathBuf, output_format: OutputFormat) -> Result<()> {
    let bundle = PolicyBundle::load(&checkpoint)
        .with_context(|| format!("Failed to load policy bundle: {}", checkpoint.display()))?;

    let summary = BundleSummary {
        created_at: bundle.created_at.to_rfc3339(),
        action_shape: bundle.config.action_shape.clone(),
        horizon: bundle.config.horizon,
        n_action_steps: bundle.config.n_action_steps,
        n_obs_steps: bundle.config.n_obs_steps,
        num_inference_steps: bundle.config.num_inference_steps,
        obs_as_global_cond: bundle.config.obs_as_global_cond,
        use_wrist: bundle.config.profile.use_wrist,
        use_depth: bundle.config.profile.use_depth,
        normalized_fields: {
            let mut fields: Vec<String> = bundle.normalizer.fields().map(str::to_string).collect();
            fields.sort();
            fields
        },
    };

    let rendered = match output_format {
        OutputFormat::Json => serde_json::to_string_pretty(&summary)?,
        OutputFormat::Yaml => serde_yaml::to_string(&summary)?,
        OutputFormat::Text => format!("{summary:#?}\n"),
    };
    println!("{rendered}");
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct BundleSummary {
    created_at: String,
    action_shape: Vec<usize>,
    horizon: usize,
    n_action_steps: usize,
    n_obs_steps: usize,
    num_inference_steps: usize,
    obs_as_global_cond: bool,
    use_wrist: bool,
    use_depth: bool,
    normalized_fields: Vec<String>,
}

// =====================================================================================
// MAIN APPLICATION ENTRY POINT
// =====================================================================================

/// Setup logging configuration
fn setup_logging(
    args: &Args,
    app: &AppConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::from(args.log_level.clone())
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if app.logging.file_logging {
        let appender = tracing_appender::rolling::daily(&app.logging.log_directory, "kinetra.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
        Ok(None)
    }
}

/// Load application configuration
fn load_config(config_path: Option<&Path>) -> Result<AppConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            if path.extension().and_then(|s| s.to_str()) == Some("yaml") {
                serde_yaml::from_str(&content).with_context(|| "Failed to parse YAML config")
            } else {
                serde_json::from_str(&content).with_context(|| "Failed to parse JSON config")
            }
        }
        None => Ok(AppConfig::default()),
    }
}

// =====================================================================================
// MAIN FUNCTION
// =====================================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let app_config = load_config(args.config.as_deref())?;

    // Setup logging; the guard must outlive every subcommand
    let _log_guard = setup_logging(&args, &app_config)?;

    // Dispatch subcommands
    match &args.command {
        Commands::Serve {
            host,
            port,
            checkpoint,
            inference_steps,
            target_points,
        } => {
            cmd_serve(
                host.clone(),
                *port,
                checkpoint.clone(),
                *inference_steps,
                *target_points,
                &app_config,
            )
            .await?;
        }
        Commands::Predict {
            checkpoint,
            input,
            output,
            target_points,
        } => {
            cmd_predict(
                checkpoint.clone(),
                input.clone(),
                output.clone(),
                *target_points,
                args.output_format.clone(),
            )
            .await?;
        }
        Commands::Bench {
            iterations,
            inference_steps,
            points,
            seed,
        } => {
            cmd_bench(
                *iterations,
                *inference_steps,
                *points,
                *seed,
                args.output_format.clone(),
            )
            .await?;
        }
        Commands::Info { checkpoint } => {
            cmd_info(checkpoint.clone(), args.output_format.clone()).await?;
        }
    }

    Ok(())
}

// =====================================================================================
// PRODUCTION TESTING & VALIDATION
// =====================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_serve_command() {
        let args = Args::try_parse_from([
            "kinetra",
            "serve",
            "--checkpoint",
            "policy.kntr",
            "--port",
            "18000",
        ])
        .unwrap();
        match args.command {
            Commands::Serve { port, .. } => assert_eq!(port, 18000),
            _ => panic!("expected serve command"),
        }
    }

    #[test]
    fn cli_rejects_unknown_subcommand() {
        assert!(Args::try_parse_from(["kinetra", "train"]).is_err());
    }

    #[test]
    fn default_config_has_millisecond_threshold() {
        let config = AppConfig::default();
        assert_eq!(config.serving.predict_threshold_us, 1000);
        assert!(!config.logging.file_logging);
    }

    #[test]
    fn config_loading_falls_back_to_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.serving.predict_threshold_us, 1000);
    }
}
