//! Producer of uniformly distributed random integers.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::parse_params;
use crate::connection::Connection;
use crate::error::{PipelineResult, StageError};
use crate::stage::{Stage, StageParams};

pub const NAME: &str = "random_source";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RandomSourceParams {
    /// Inclusive lower bound.
    pub min: i64,
    /// Inclusive upper bound.
    pub max: i64,
    /// Fixed seed for reproducible runs.
    pub seed: Option<u64>,
    /// Pause after each published value. Zero produces as fast as
    /// consumers allow.
    pub interval_ms: u64,
}

impl Default for RandomSourceParams {
    fn default() -> Self {
        Self {
            min: 0,
            max: 100,
            seed: None,
            interval_ms: 10,
        }
    }
}

pub fn create(
    params: &StageParams,
    output: Arc<Connection<i64>>,
) -> PipelineResult<Stage<(), i64>> {
    let params: RandomSourceParams = parse_params(NAME, params)?;
    if params.min > params.max {
        return Err(StageError::BadParam(format!(
            "{}: min {} is greater than max {}",
            NAME, params.min, params.max
        ))
        .into());
    }

    let mut rng = match params.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let interval = Duration::from_millis(params.interval_ms);
    let (min, max) = (params.min, params.max);

    Stage::producer(NAME, output, move |mut slot| {
        *slot = rng.gen_range(min..=max);
        slot.commit();
        if !interval.is_zero() {
            thread::sleep(interval);
        }
        Ok(())
    })
}
