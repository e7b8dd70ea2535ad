use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use slotline_daemon::config::DaemonConfig;
use slotline_daemon::runner;

const PIPELINE: &str = r#"
stages:
  - name: random_source
    id: source
    type: producer
    params:
      seed: 1
      interval_ms: 1
  - name: int_to_double
    id: scale
    type: producerConsumer
    strategy: fifo
    parentId: source
  - name: csv_sink
    id: recorder
    type: consumer
    strategy: fifo
    parentId: scale
"#;

fn config_in(dir: &Path, yaml: &str) -> DaemonConfig {
    let pipeline = dir.join("pipeline.yaml");
    fs::write(&pipeline, yaml).unwrap();
    DaemonConfig {
        pipeline,
        run_duration_ms: Some(100),
        default_capacity: 4,
        recordings_dir: dir.join("recordings"),
        ..DaemonConfig::default()
    }
}

#[test]
fn runs_and_records() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), PIPELINE);

    let pipeline = runner::start(&config).unwrap();
    assert!(pipeline.is_running());
    thread::sleep(Duration::from_millis(100));
    let stats = runner::stop(pipeline);

    assert_eq!(stats.len(), 3);
    assert!(stats.iter().all(|(_, s)| s.iterations > 0 && s.failures == 0));

    let recordings: Vec<_> = fs::read_dir(dir.path().join("recordings"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(recordings.len(), 1);
    let contents = fs::read_to_string(&recordings[0]).unwrap();
    assert!(contents.starts_with("task_id,value\n"));
    assert!(contents.lines().count() > 1);
}

#[test]
fn emit_fills_in_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), PIPELINE);

    let yaml = runner::emit(&config).unwrap();
    let emitted = slotline::PipelineDescription::from_yaml(&yaml).unwrap();
    let ids: Vec<&str> = emitted.stages.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["source", "scale", "recorder"]);
    assert_eq!(emitted.stages[0].capacity, Some(4));
    assert_eq!(emitted.stages[1].capacity, Some(4));
    assert_eq!(emitted.stages[2].capacity, None);
}

#[test]
fn reports_bad_pipelines() {
    let dir = tempfile::tempdir().unwrap();

    let config = config_in(dir.path(), &PIPELINE.replace("parentId: scale", "parentId: nowhere"));
    let err = runner::build(&config).unwrap_err();
    assert!(format!("{:#}", err).contains("nowhere"), "{:#}", err);

    let missing = DaemonConfig {
        pipeline: dir.path().join("missing.yaml"),
        ..DaemonConfig::default()
    };
    let err = runner::build(&missing).unwrap_err();
    assert!(format!("{:#}", err).contains("missing.yaml"), "{:#}", err);
}

#[test]
fn default_pipeline_builds() {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig {
        pipeline: Path::new(env!("CARGO_MANIFEST_DIR")).join("../../pipelines/default.yaml"),
        recordings_dir: dir.path().to_path_buf(),
        ..DaemonConfig::default()
    };
    let pipeline = runner::build(&config).unwrap();
    assert_eq!(pipeline.stages().len(), 4);
}
