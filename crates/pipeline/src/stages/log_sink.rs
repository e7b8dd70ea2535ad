//! Consumer that reports values through `tracing`.

use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::parse_params;
use crate::connection::Connection;
use crate::error::{PipelineResult, StageError};
use crate::slot::Strategy;
use crate::stage::{Stage, StageParams};

pub const NAME: &str = "log_sink";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSinkParams {
    /// Log one out of every `every` values.
    pub every: u64,
}

impl Default for LogSinkParams {
    fn default() -> Self {
        Self { every: 1 }
    }
}

pub fn create(
    params: &StageParams,
    strategy: Strategy,
    input: Arc<Connection<f64>>,
) -> PipelineResult<Stage<f64, ()>> {
    let LogSinkParams { every } = parse_params(NAME, params)?;
    if every == 0 {
        return Err(StageError::BadParam(format!("{}: every must be at least 1", NAME)).into());
    }

    let mut received = 0u64;
    Stage::consumer(NAME, strategy, input, move |value| {
        if received % every == 0 {
            info!("[{}] task {}: {}", NAME, value.task_id(), *value);
        }
        received += 1;
        Ok(())
    })
}
