use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use slotline::StageEvent;
use slotline_daemon::config::{load_config, DaemonConfig};
use slotline_daemon::runner;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "slotline", about = "Runs slot-pool pipelines")]
struct Cli {
    /// Daemon configuration (JSON); defaults are used when it does not exist
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build and run a pipeline until Ctrl-C or the configured duration
    Run {
        /// Pipeline description (YAML), overrides the config
        #[arg(short, long)]
        pipeline: Option<PathBuf>,
        /// Stop after this many milliseconds, overrides the config
        #[arg(short, long)]
        duration_ms: Option<u64>,
    },
    /// Validate a pipeline description by building it
    Check {
        #[arg(short, long)]
        pipeline: Option<PathBuf>,
    },
    /// Print the description of the pipeline as built
    Emit {
        #[arg(short, long)]
        pipeline: Option<PathBuf>,
    },
    /// List registered stage types
    Stages,
}

fn apply_overrides(config: &mut DaemonConfig, pipeline: &Option<PathBuf>) {
    if let Some(pipeline) = pipeline {
        config.pipeline = pipeline.clone();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mut config, source) = load_config(&cli.config)?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    config.log_source(source, &cli.config);

    match cli.command {
        Command::Run {
            pipeline,
            duration_ms,
        } => {
            apply_overrides(&mut config, &pipeline);
            if duration_ms.is_some() {
                config.run_duration_ms = duration_ms;
            }
            run(config).await
        }
        Command::Check { pipeline } => {
            apply_overrides(&mut config, &pipeline);
            let pipeline = runner::build(&config)?;
            println!(
                "{}: {} stages, {} connections",
                config.pipeline.display(),
                pipeline.stages().len(),
                pipeline.connections().len()
            );
            Ok(())
        }
        Command::Emit { pipeline } => {
            apply_overrides(&mut config, &pipeline);
            print!("{}", runner::emit(&config)?);
            Ok(())
        }
        Command::Stages => {
            let registry = runner::builtin_registry(&config);
            for name in registry.names() {
                if let Some(kind) = registry.kind_of(name) {
                    println!("{:<16} {}", name, kind);
                }
            }
            Ok(())
        }
    }
}

async fn run(config: DaemonConfig) -> Result<()> {
    tracing::info!("slotline daemon starting...");
    let pipeline = runner::start(&config)?;

    // --- Event Forwarding Task ---
    let events = pipeline.events();
    let forwarder = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match event {
                StageEvent::Started { stage_id } => tracing::debug!("Stage '{}' is up", stage_id),
                StageEvent::CallbackFailed { stage_id, message } => {
                    tracing::warn!("Stage '{}' call failed: {}", stage_id, message)
                }
                StageEvent::Stopped { stage_id, stats } => tracing::debug!(
                    "Stage '{}' stopped after {} iterations",
                    stage_id,
                    stats.iterations
                ),
            }
        }
    });

    // --- Graceful Shutdown ---
    match config.run_duration_ms {
        Some(ms) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                    tracing::info!("Run duration of {} ms elapsed.", ms);
                }
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    tracing::info!("Shutdown signal received.");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutdown signal received.");
        }
    }

    tracing::info!("Stopping pipeline...");
    let stats = tokio::task::spawn_blocking(move || runner::stop(pipeline)).await?;
    forwarder.abort();
    for (id, stats) in stats {
        println!("{:<16} {:>10} iterations {:>6} failed", id, stats.iterations, stats.failures);
    }
    tracing::info!("slotline daemon stopped gracefully.");
    Ok(())
}
