//! CSV sink stage for recording values to files.

use chrono::Local;
use serde::Deserialize;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::parse_params;
use crate::connection::Connection;
use crate::error::{PipelineResult, StageError};
use crate::slot::Strategy;
use crate::stage::{Stage, StageParams};

pub const NAME: &str = "csv_sink";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct CsvSinkParams {
    /// Output directory; the registry's recordings directory when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Start a new file once the current one is this old.
    #[serde(default)]
    pub max_recording_length_minutes: Option<u32>,
}

fn default_prefix() -> String {
    "values".to_string()
}

/// Writer state owned by the stage body.
///
/// The file is opened lazily on the first value, so building a pipeline
/// never leaves empty recordings behind. Buffered rows are flushed when the
/// sink is dropped, which happens when the stage thread exits.
pub struct CsvSink {
    dir: PathBuf,
    prefix: String,
    max_length: Option<Duration>,
    writer: Option<BufWriter<File>>,
    started: Option<Instant>,
}

impl CsvSink {
    pub fn new(
        dir: PathBuf,
        prefix: String,
        max_length: Option<Duration>,
    ) -> Result<Self, StageError> {
        if !dir.exists() {
            create_dir_all(&dir).map_err(|e| {
                StageError::Io(format!(
                    "Failed to create recordings directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(Self {
            dir,
            prefix,
            max_length,
            writer: None,
            started: None,
        })
    }

    fn open(&self) -> Result<BufWriter<File>, StageError> {
        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let mut attempt = 0u32;
        loop {
            let filename = if attempt == 0 {
                format!("{}_{}.csv", self.prefix, timestamp)
            } else {
                format!("{}_{}_{}.csv", self.prefix, timestamp, attempt)
            };
            let full_path = self.dir.join(filename);
            match OpenOptions::new().write(true).create_new(true).open(&full_path) {
                Ok(file) => {
                    info!("Recording to {}", full_path.display());
                    let mut writer = BufWriter::new(file);
                    writeln!(writer, "task_id,value")?;
                    return Ok(writer);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => {
                    return Err(StageError::Io(format!(
                        "Failed to create CSV file {}: {}",
                        full_path.display(),
                        e
                    )))
                }
            }
        }
    }

    /// Appends one row, rotating the file first if it is too old.
    pub fn write(&mut self, task_id: u64, value: f64) -> Result<(), StageError> {
        if let (Some(started), Some(max)) = (self.started, self.max_length) {
            if started.elapsed() >= max {
                debug!("Rotating CSV recording in {}", self.dir.display());
                self.close();
            }
        }

        if self.writer.is_none() {
            self.writer = Some(self.open()?);
            self.started = Some(Instant::now());
        }
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{},{}", task_id, value)?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush CSV recording: {}", e);
            }
        }
        self.started = None;
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn create(
    params: &StageParams,
    strategy: Strategy,
    input: Arc<Connection<f64>>,
    recordings_dir: &Path,
) -> PipelineResult<Stage<f64, ()>> {
    let params: CsvSinkParams = parse_params(NAME, params)?;
    let dir = params
        .path
        .unwrap_or_else(|| recordings_dir.to_path_buf());
    let max_length = params
        .max_recording_length_minutes
        .map(|minutes| Duration::from_secs(u64::from(minutes) * 60));
    let mut sink = CsvSink::new(dir, params.prefix, max_length)?;

    Stage::consumer(NAME, strategy, input, move |value| {
        sink.write(value.task_id(), *value)
    })
}
