//! Converts integer samples to scaled floating point values.

use serde::Deserialize;
use std::sync::Arc;

use super::parse_params;
use crate::connection::Connection;
use crate::error::PipelineResult;
use crate::slot::Strategy;
use crate::stage::{Stage, StageParams};

pub const NAME: &str = "int_to_double";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntToDoubleParams {
    pub scale: f64,
    pub offset: f64,
}

impl Default for IntToDoubleParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset: 0.0,
        }
    }
}

pub fn create(
    params: &StageParams,
    strategy: Strategy,
    input: Arc<Connection<i64>>,
    output: Arc<Connection<f64>>,
) -> PipelineResult<Stage<i64, f64>> {
    let IntToDoubleParams { scale, offset } = parse_params(NAME, params)?;

    Stage::producer_consumer(NAME, strategy, input, output, move |sample, mut value| {
        *value = *sample as f64 * scale + offset;
        value.commit();
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{InConnection, OutConnection};
    use crate::stage::AnyStage;
    use serde_json::json;

    #[test]
    fn test_scales_values() {
        let ints = Arc::new(Connection::<i64>::new("ints", 2).unwrap());
        let doubles = Arc::new(Connection::<f64>::new("doubles", 2).unwrap());
        let params: StageParams =
            serde_json::from_value(json!({"scale": 0.5, "offset": 1.0})).unwrap();
        let stage =
            create(&params, Strategy::Oldest, Arc::clone(&ints), Arc::clone(&doubles)).unwrap();
        let mut reader = InConnection::new(Arc::clone(&doubles), Strategy::Oldest).unwrap();
        let writer = OutConnection::new(Arc::clone(&ints)).unwrap();
        stage.run().unwrap();

        let mut slot = writer.acquire().unwrap();
        *slot = 10;
        slot.commit();

        let value = reader.acquire().map(|slot| *slot);
        ints.shutdown();
        doubles.shutdown();
        stage.shutdown();

        assert_eq!(value, Some(6.0));
    }

    #[test]
    fn test_defaults_to_identity() {
        let params: IntToDoubleParams = parse_params(NAME, &StageParams::new()).unwrap();
        assert_eq!(params.scale, 1.0);
        assert_eq!(params.offset, 0.0);
    }
}
