//! Loading, checking and running pipelines for the command line.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use slotline::{
    register_builtin_stages, BuiltinOptions, Pipeline, PipelineDescription, Registry, StageStats,
};

use crate::config::DaemonConfig;

/// Registry with every built-in stage, sized and rooted per `config`.
pub fn builtin_registry(config: &DaemonConfig) -> Registry {
    let mut registry = Registry::new();
    register_builtin_stages(
        &mut registry,
        &BuiltinOptions {
            capacity: config.default_capacity,
            recordings_dir: config.recordings_dir.clone(),
        },
    );
    registry
}

pub fn load_description(path: &Path) -> Result<PipelineDescription> {
    PipelineDescription::from_file(path)
        .with_context(|| format!("Failed to load pipeline description '{}'", path.display()))
}

/// Builds the pipeline without starting it.
pub fn build(config: &DaemonConfig) -> Result<Pipeline> {
    let description = load_description(&config.pipeline)?;
    description
        .build(&builtin_registry(config))
        .with_context(|| format!("Invalid pipeline '{}'", config.pipeline.display()))
}

/// The description of the pipeline as built: defaults filled in, parents first.
pub fn emit(config: &DaemonConfig) -> Result<String> {
    let pipeline = build(config)?;
    let description = PipelineDescription::from_pipeline(&pipeline)?;
    Ok(description.to_yaml()?)
}

pub fn start(config: &DaemonConfig) -> Result<Pipeline> {
    let pipeline = build(config)?;
    pipeline.run().context("Failed to start pipeline")?;
    info!(
        "Pipeline '{}' started with {} stages.",
        config.pipeline.display(),
        pipeline.stages().len()
    );
    Ok(pipeline)
}

/// Stops the pipeline and logs per-stage counters.
pub fn stop(pipeline: Pipeline) -> Vec<(String, StageStats)> {
    pipeline.shutdown();
    let stats = pipeline.stats();
    for (id, stats) in &stats {
        info!(
            "Stage '{}': {} iterations, {} failed",
            id, stats.iterations, stats.failures
        );
    }
    stats
}
