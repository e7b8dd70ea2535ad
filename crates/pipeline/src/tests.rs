//! End-to-end tests for the pipeline.

use proptest::prelude::{prop_assert, prop_assert_eq, prop_oneof, proptest, Just, ProptestConfig};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

use crate::config::PipelineDescription;
use crate::connection::{Connection, InConnection, OutConnection};
use crate::error::PipelineError;
use crate::registry::Registry;
use crate::slot::Strategy;
use crate::pipeline::Pipeline;
use crate::stage::{StageEvent, StageKind, StageState};
use crate::stages::{register_builtin_stages, BuiltinOptions};

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

fn builtin_registry(recordings: &Path) -> Registry {
    let mut registry = Registry::new();
    register_builtin_stages(
        &mut registry,
        &BuiltinOptions {
            capacity: 8,
            recordings_dir: recordings.to_path_buf(),
        },
    );
    registry
}

fn four_stage_yaml(recordings: &Path) -> String {
    format!(
        r#"
stages:
  - name: random_source
    id: source
    type: producer
    capacity: 8
    params:
      min: 0
      max: 10
      seed: 42
      interval_ms: 1
  - name: int_to_double
    id: convert
    type: producerConsumer
    capacity: 4
    strategy: fifo
    parentId: source
    params:
      scale: 0.5
  - name: csv_sink
    id: recorder
    type: consumer
    strategy: fifo
    parentId: convert
    params:
      path: '{}'
      prefix: e2e
  - name: log_sink
    id: printer
    type: consumer
    strategy: lifo
    parentId: convert
    params:
      every: 10
"#,
        recordings.display()
    )
}

#[test]
fn test_four_stage_pipeline_end_to_end() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let registry = builtin_registry(dir.path());
    let description = PipelineDescription::from_yaml(&four_stage_yaml(dir.path())).unwrap();

    let pipeline = description.build(&registry).unwrap();
    assert_eq!(pipeline.stages().len(), 4);
    assert_eq!(pipeline.connections().len(), 2);
    let convert_out = pipeline
        .stage_by_id("convert")
        .unwrap()
        .output_connection()
        .unwrap();
    assert_eq!(convert_out.consumer_count(), 2);

    pipeline.run().unwrap();
    thread::sleep(Duration::from_millis(200));
    pipeline.shutdown();

    for stage in pipeline.stages() {
        assert_eq!(stage.state(), StageState::Joined, "{}", stage.id());
        assert!(stage.stats().iterations > 0, "{}", stage.id());
        assert_eq!(stage.stats().failures, 0, "{}", stage.id());
    }

    // Stage threads have exited, so the sink's writer has been flushed.
    let files: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1, "{:?}", files);
    let contents = fs::read_to_string(&files[0]).unwrap();
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some("task_id,value"));

    let rows: Vec<(u64, f64)> = lines
        .map(|line| {
            let (task_id, value) = line.split_once(',').unwrap();
            (task_id.parse().unwrap(), value.parse().unwrap())
        })
        .collect();
    assert!(!rows.is_empty());
    assert!(rows.windows(2).all(|w| w[0].0 < w[1].0));
    assert!(rows.iter().all(|(_, v)| (0.0..=5.0).contains(v) && (v * 2.0).fract() == 0.0));
}

#[test]
fn test_four_stage_description_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let registry = builtin_registry(dir.path());
    let description = PipelineDescription::from_yaml(&four_stage_yaml(dir.path())).unwrap();
    let pipeline = description.build(&registry).unwrap();

    let emitted = PipelineDescription::from_pipeline(&pipeline).unwrap();
    emitted.validate().unwrap();
    assert_eq!(emitted.stages[0].id, "source");
    assert_eq!(emitted.stages[1].id, "convert");

    let mut expected = description.stages.clone();
    let mut actual = emitted.stages.clone();
    expected.sort_by(|a, b| a.id.cmp(&b.id));
    actual.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(actual, expected);

    // The emitted document builds an equivalent pipeline again.
    let original = wiring(&pipeline);
    drop(pipeline);
    let reloaded = PipelineDescription::from_yaml(&emitted.to_yaml().unwrap()).unwrap();
    let rebuilt = reloaded.build(&registry).unwrap();
    assert_eq!(wiring(&rebuilt), original);
}

type StageShape = (String, String, StageKind, Option<Strategy>, Option<String>);

/// Id, name, kind, strategy and parent id of every stage, sorted by id.
fn wiring(pipeline: &Pipeline) -> Vec<StageShape> {
    let mut shapes: Vec<StageShape> = pipeline
        .stages()
        .iter()
        .map(|stage| {
            let parent = stage.input_connection().and_then(|input| {
                pipeline
                    .stages()
                    .iter()
                    .find(|s| s.output_connection().map(|o| o.id()) == Some(input.id()))
                    .map(|s| s.id().to_string())
            });
            (
                stage.id().to_string(),
                stage.name().to_string(),
                stage.kind(),
                stage.strategy(),
                parent,
            )
        })
        .collect();
    shapes.sort_by(|a, b| a.0.cmp(&b.0));
    shapes
}

#[test]
fn test_builtin_registry_contents() {
    let dir = tempfile::tempdir().unwrap();
    let registry = builtin_registry(dir.path());
    assert_eq!(
        registry.names(),
        vec!["csv_sink", "int_to_double", "log_sink", "random_source"]
    );
}

#[test]
fn test_builtin_param_errors_surface_at_build() {
    let dir = tempfile::tempdir().unwrap();
    let registry = builtin_registry(dir.path());
    let yaml = four_stage_yaml(dir.path()).replace("max: 10", "max: -10");
    let result = PipelineDescription::from_yaml(&yaml)
        .unwrap()
        .build(&registry);
    assert!(matches!(
        result,
        Err(PipelineError::InvalidConfiguration { .. })
    ));
}

#[test]
fn test_events_report_every_stage() {
    let dir = tempfile::tempdir().unwrap();
    let registry = builtin_registry(dir.path());
    let pipeline = PipelineDescription::from_yaml(&four_stage_yaml(dir.path()))
        .unwrap()
        .build(&registry)
        .unwrap();
    let events = pipeline.events();

    pipeline.run().unwrap();
    thread::sleep(Duration::from_millis(50));
    pipeline.shutdown();

    let stopped: Vec<String> = events
        .try_iter()
        .filter_map(|event| match event {
            StageEvent::Stopped { stage_id, .. } => Some(stage_id),
            _ => None,
        })
        .collect();
    for id in ["source", "convert", "recorder", "printer"] {
        assert!(stopped.iter().any(|s| s == id), "{} missing from {:?}", id, stopped);
    }
}

/// Produces `count` values (payload == task id) and records what each
/// consumer observed.
fn fan_out(capacity: usize, strategies: &[Strategy], count: u64) -> Vec<Vec<(u64, u64)>> {
    let connection = Arc::new(Connection::<u64>::new("fan-out", capacity).unwrap());
    let producer = OutConnection::new(Arc::clone(&connection)).unwrap();
    let mut readers: Vec<InConnection<u64>> = strategies
        .iter()
        .map(|s| InConnection::new(Arc::clone(&connection), *s).unwrap())
        .collect();

    let seen: Vec<Arc<Mutex<Vec<(u64, u64)>>>> =
        strategies.iter().map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

    let handles: Vec<_> = readers
        .drain(..)
        .zip(seen.iter().cloned())
        .map(|(mut reader, seen)| {
            thread::spawn(move || {
                while let Some(slot) = reader.acquire() {
                    seen.lock().unwrap().push((slot.task_id(), *slot));
                }
            })
        })
        .collect();

    for expected in 1..=count {
        let mut slot = producer.acquire().unwrap();
        *slot = expected;
        assert_eq!(slot.commit(), expected);
    }
    thread::sleep(Duration::from_millis(10));
    connection.shutdown();
    for handle in handles {
        handle.join().unwrap();
    }

    seen.iter().map(|s| s.lock().unwrap().clone()).collect()
}

fn strategy() -> impl proptest::strategy::Strategy<Value = Strategy> {
    prop_oneof![Just(Strategy::Oldest), Just(Strategy::Newest)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_consumers_see_increasing_subsequence(
        capacity in 1usize..6,
        strategies in proptest::collection::vec(strategy(), 1..5),
        count in 1u64..80,
    ) {
        let observed = fan_out(capacity, &strategies, count);
        for seen in observed {
            for (task_id, payload) in &seen {
                prop_assert_eq!(task_id, payload);
                prop_assert!(*task_id >= 1 && *task_id <= count);
            }
            prop_assert!(seen.windows(2).all(|w| w[0].0 < w[1].0), "{:?}", seen);
        }
    }
}
