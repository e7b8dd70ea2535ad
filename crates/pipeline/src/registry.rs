//! Stage registry for creating pipeline stage instances.
//!
//! A [`Registry`] maps a stage type name to everything needed to build that
//! stage from a declarative description: its kind, a constructor for the
//! connection it produces into, and a constructor for the stage itself.
//! Registries are plain values; whoever assembles a pipeline owns one.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::connection::{AnyConnection, Connection};
use crate::error::{PipelineError, PipelineResult};
use crate::slot::Strategy;
use crate::stage::{AnyStage, Stage, StageKind, StageParams};

/// Everything a stage constructor gets handed by the loader.
pub struct StageWiring<'a> {
    pub id: &'a str,
    pub params: &'a StageParams,
    pub strategy: Option<Strategy>,
    pub input: Option<Arc<dyn AnyConnection>>,
    pub output: Option<Arc<dyn AnyConnection>>,
}

type ConnectionFactory =
    Box<dyn Fn(&str, usize) -> PipelineResult<Arc<dyn AnyConnection>> + Send + Sync>;
type StageFactory =
    Box<dyn Fn(&str, StageWiring<'_>) -> PipelineResult<Arc<dyn AnyStage>> + Send + Sync>;

struct RegistryEntry {
    kind: StageKind,
    capacity: Option<usize>,
    make_connection: Option<ConnectionFactory>,
    make_stage: StageFactory,
}

/// A registry for stage factories.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, RegistryEntry>,
}

fn typed<T: Send + Sync + 'static>(
    connection: Arc<dyn AnyConnection>,
    stage_type: &str,
) -> PipelineResult<Arc<Connection<T>>> {
    let name = connection.name().to_string();
    connection
        .into_any()
        .downcast::<Connection<T>>()
        .map_err(|_| PipelineError::ConnectionTypeMismatch {
            connection: name,
            stage_type: stage_type.to_string(),
        })
}

fn required(
    connection: Option<Arc<dyn AnyConnection>>,
    stage: &str,
    which: &'static str,
) -> PipelineResult<Arc<dyn AnyConnection>> {
    connection.ok_or_else(|| PipelineError::MissingConnection {
        stage: stage.to_string(),
        which,
    })
}

fn required_strategy(strategy: Option<Strategy>, stage: &str) -> PipelineResult<Strategy> {
    strategy.ok_or_else(|| {
        PipelineError::config(format!("stage '{}' needs a consumption strategy", stage))
    })
}

fn connection_factory<T>() -> ConnectionFactory
where
    T: Default + Send + Sync + 'static,
{
    Box::new(|name: &str, capacity: usize| {
        let connection: Arc<dyn AnyConnection> = Arc::new(Connection::<T>::new(name, capacity)?);
        Ok(connection)
    })
}

fn finish<In, Out>(stage: Stage<In, Out>, wiring: &StageWiring<'_>) -> Arc<dyn AnyStage>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    Arc::new(stage.with_id(wiring.id).with_params(wiring.params.clone()))
}

impl Registry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage that only produces `Out`, into a connection of
    /// `capacity` slots unless the description overrides it.
    pub fn register_producer<Out, F>(&mut self, name: &str, capacity: usize, factory: F)
    where
        Out: Default + Send + Sync + 'static,
        F: Fn(&StageParams, Arc<Connection<Out>>) -> PipelineResult<Stage<(), Out>>
            + Send
            + Sync
            + 'static,
    {
        let make_stage: StageFactory = Box::new(move |stage_type: &str, wiring: StageWiring<'_>| {
            let output = required(wiring.output.clone(), wiring.id, "output")?;
            let output = typed::<Out>(output, stage_type)?;
            let stage = factory(wiring.params, output)?;
            Ok(finish(stage, &wiring))
        });
        self.insert(
            name,
            RegistryEntry {
                kind: StageKind::Producer,
                capacity: Some(capacity),
                make_connection: Some(connection_factory::<Out>()),
                make_stage,
            },
        );
    }

    /// Registers a stage that only consumes `In`.
    pub fn register_consumer<In, F>(&mut self, name: &str, factory: F)
    where
        In: Send + Sync + 'static,
        F: Fn(&StageParams, Strategy, Arc<Connection<In>>) -> PipelineResult<Stage<In, ()>>
            + Send
            + Sync
            + 'static,
    {
        let make_stage: StageFactory = Box::new(move |stage_type: &str, wiring: StageWiring<'_>| {
            let strategy = required_strategy(wiring.strategy, wiring.id)?;
            let input = required(wiring.input.clone(), wiring.id, "input")?;
            let input = typed::<In>(input, stage_type)?;
            let stage = factory(wiring.params, strategy, input)?;
            Ok(finish(stage, &wiring))
        });
        self.insert(
            name,
            RegistryEntry {
                kind: StageKind::Consumer,
                capacity: None,
                make_connection: None,
                make_stage,
            },
        );
    }

    /// Registers a stage that consumes `In` and produces `Out`.
    pub fn register_producer_consumer<In, Out, F>(
        &mut self,
        name: &str,
        capacity: usize,
        factory: F,
    ) where
        In: Send + Sync + 'static,
        Out: Default + Send + Sync + 'static,
        F: Fn(
                &StageParams,
                Strategy,
                Arc<Connection<In>>,
                Arc<Connection<Out>>,
            ) -> PipelineResult<Stage<In, Out>>
            + Send
            + Sync
            + 'static,
    {
        let make_stage: StageFactory = Box::new(move |stage_type: &str, wiring: StageWiring<'_>| {
            let strategy = required_strategy(wiring.strategy, wiring.id)?;
            let input = required(wiring.input.clone(), wiring.id, "input")?;
            let input = typed::<In>(input, stage_type)?;
            let output = required(wiring.output.clone(), wiring.id, "output")?;
            let output = typed::<Out>(output, stage_type)?;
            let stage = factory(wiring.params, strategy, input, output)?;
            Ok(finish(stage, &wiring))
        });
        self.insert(
            name,
            RegistryEntry {
                kind: StageKind::ProducerConsumer,
                capacity: Some(capacity),
                make_connection: Some(connection_factory::<Out>()),
                make_stage,
            },
        );
    }

    fn insert(&mut self, name: &str, entry: RegistryEntry) {
        debug!("Registered {} stage type '{}'", entry.kind, name);
        if self.entries.insert(name.to_string(), entry).is_some() {
            debug!("Stage type '{}' was registered before; replaced", name);
        }
    }

    fn entry(&self, name: &str) -> PipelineResult<&RegistryEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| PipelineError::UnknownStageType {
                stage_type: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The kind recorded for a stage type.
    pub fn kind_of(&self, name: &str) -> Option<StageKind> {
        self.entries.get(name).map(|entry| entry.kind)
    }

    /// Default output capacity of a producing stage type.
    pub fn default_capacity(&self, name: &str) -> Option<usize> {
        self.entries.get(name).and_then(|entry| entry.capacity)
    }

    /// Get all registered stage types, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds the output connection for a producing stage type.
    pub fn create_connection(
        &self,
        name: &str,
        connection_name: &str,
        capacity: Option<usize>,
    ) -> PipelineResult<Arc<dyn AnyConnection>> {
        let entry = self.entry(name)?;
        let make = entry.make_connection.as_ref().ok_or_else(|| {
            PipelineError::config(format!("stage type '{}' does not produce", name))
        })?;
        let capacity = capacity.or(entry.capacity).unwrap_or(1);
        make(connection_name, capacity)
    }

    /// Builds a stage of type `name` from already created connections.
    pub fn create_stage(
        &self,
        name: &str,
        wiring: StageWiring<'_>,
    ) -> PipelineResult<Arc<dyn AnyStage>> {
        let entry = self.entry(name)?;
        (entry.make_stage)(name, wiring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_producer("ints", 4, |_params, output: Arc<Connection<i64>>| {
            Stage::producer("ints", output, |slot| {
                slot.commit();
                Ok(())
            })
        });
        registry.register_consumer("int_sink", |_params, strategy, input: Arc<Connection<i64>>| {
            Stage::consumer("int_sink", strategy, input, |_slot| Ok(()))
        });
        registry.register_consumer(
            "text_sink",
            |_params, strategy, input: Arc<Connection<String>>| {
                Stage::consumer("text_sink", strategy, input, |_slot| Ok(()))
            },
        );
        registry
    }

    fn wiring<'a>(
        id: &'a str,
        params: &'a StageParams,
        strategy: Option<Strategy>,
        input: Option<Arc<dyn AnyConnection>>,
        output: Option<Arc<dyn AnyConnection>>,
    ) -> StageWiring<'a> {
        StageWiring {
            id,
            params,
            strategy,
            input,
            output,
        }
    }

    #[test]
    fn test_lookup() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["int_sink", "ints", "text_sink"]);
        assert_eq!(registry.kind_of("ints"), Some(StageKind::Producer));
        assert_eq!(registry.default_capacity("ints"), Some(4));
        assert_eq!(registry.default_capacity("int_sink"), None);
        assert!(!registry.contains("missing"));
    }

    #[test]
    fn test_unknown_stage_type() {
        let registry = registry();
        let params = StageParams::new();
        let result = registry.create_stage("missing", wiring("x", &params, None, None, None));
        assert!(matches!(
            result,
            Err(PipelineError::UnknownStageType { .. })
        ));
    }

    #[test]
    fn test_builds_wired_stages() {
        let registry = registry();
        let params = StageParams::new();
        let connection = registry.create_connection("ints", "src.out", Some(8)).unwrap();
        assert_eq!(connection.capacity(), 8);

        let producer = registry
            .create_stage(
                "ints",
                wiring("src", &params, None, None, Some(Arc::clone(&connection))),
            )
            .unwrap();
        let consumer = registry
            .create_stage(
                "int_sink",
                wiring(
                    "dst",
                    &params,
                    Some(Strategy::Oldest),
                    Some(Arc::clone(&connection)),
                    None,
                ),
            )
            .unwrap();

        assert_eq!(producer.id(), "src");
        assert_eq!(consumer.id(), "dst");
        assert_eq!(consumer.strategy(), Some(Strategy::Oldest));
        assert!(connection.has_producer());
        assert_eq!(connection.consumer_count(), 1);
    }

    #[test]
    fn test_element_type_mismatch() {
        let registry = registry();
        let params = StageParams::new();
        let connection = registry.create_connection("ints", "src.out", None).unwrap();
        let result = registry.create_stage(
            "text_sink",
            wiring("dst", &params, Some(Strategy::Oldest), Some(connection), None),
        );
        assert!(matches!(
            result,
            Err(PipelineError::ConnectionTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_consumer_needs_strategy_and_input() {
        let registry = registry();
        let params = StageParams::new();
        let connection = registry.create_connection("ints", "src.out", None).unwrap();

        let no_strategy = registry.create_stage(
            "int_sink",
            wiring("dst", &params, None, Some(connection), None),
        );
        assert!(matches!(
            no_strategy,
            Err(PipelineError::InvalidConfiguration { .. })
        ));

        let no_input = registry.create_stage(
            "int_sink",
            wiring("dst", &params, Some(Strategy::Newest), None, None),
        );
        assert!(matches!(
            no_input,
            Err(PipelineError::MissingConnection { which: "input", .. })
        ));
    }

    #[test]
    fn test_consumers_do_not_create_connections() {
        let registry = registry();
        assert!(registry
            .create_connection("int_sink", "dst.out", None)
            .is_err());
    }
}
