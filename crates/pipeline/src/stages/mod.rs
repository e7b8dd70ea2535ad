//! Built-in pipeline stages

pub mod csv_sink;
pub mod int_to_double;
pub mod log_sink;
pub mod random_source;

use serde::de::DeserializeOwned;
use std::path::PathBuf;

use crate::error::StageError;
use crate::registry::Registry;
use crate::stage::StageParams;

/// Output capacity for built-in producing stages when a description omits it.
pub const DEFAULT_CAPACITY: usize = 16;

/// Knobs shared by all built-in stage factories.
#[derive(Debug, Clone)]
pub struct BuiltinOptions {
    pub capacity: usize,
    /// Where `csv_sink` writes when its `path` param is absent.
    pub recordings_dir: PathBuf,
}

impl Default for BuiltinOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            recordings_dir: PathBuf::from("./recordings"),
        }
    }
}

/// Register all built-in stages with the registry
pub fn register_builtin_stages(registry: &mut Registry, options: &BuiltinOptions) {
    registry.register_producer(random_source::NAME, options.capacity, random_source::create);
    registry.register_producer_consumer(
        int_to_double::NAME,
        options.capacity,
        int_to_double::create,
    );
    let recordings_dir = options.recordings_dir.clone();
    registry.register_consumer(csv_sink::NAME, move |params, strategy, input| {
        csv_sink::create(params, strategy, input, &recordings_dir)
    });
    registry.register_consumer(log_sink::NAME, log_sink::create);
}

/// Decodes a stage's free-form params into its typed parameter struct.
pub(crate) fn parse_params<P: DeserializeOwned>(
    stage: &str,
    params: &StageParams,
) -> Result<P, StageError> {
    serde_json::from_value(serde_json::Value::Object(params.clone().into_iter().collect()))
        .map_err(|e| StageError::BadParam(format!("{}: {}", stage, e)))
}
