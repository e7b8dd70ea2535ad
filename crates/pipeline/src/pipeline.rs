//! Pipeline container: owns stages and connections and drives their lifecycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::AnyConnection;
use crate::error::{PipelineError, PipelineResult};
use crate::stage::{AnyStage, StageEvent, StageStats};

/// Bound of the lifecycle event channel. Events past it are dropped.
pub const EVENT_CAPACITY: usize = 1024;

/// A set of wired stages and the connections between them.
///
/// Stages are started in insertion order. Shutdown closes every connection
/// first, so blocked stages wake up, and then joins the stages.
pub struct Pipeline {
    stages: Vec<Arc<dyn AnyStage>>,
    connections: Vec<Arc<dyn AnyConnection>>,
    events_tx: flume::Sender<StageEvent>,
    events_rx: flume::Receiver<StageEvent>,
    running: AtomicBool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        let (events_tx, events_rx) = flume::bounded(EVENT_CAPACITY);
        Self {
            stages: Vec::new(),
            connections: Vec::new(),
            events_tx,
            events_rx,
            running: AtomicBool::new(false),
        }
    }

    fn ensure_idle(&self, what: &str) -> PipelineResult<()> {
        if self.is_running() {
            return Err(PipelineError::InvalidState(format!(
                "cannot add {} to a running pipeline",
                what
            )));
        }
        Ok(())
    }

    /// Adds a stage. Stage ids must be unique within a pipeline.
    pub fn add_stage(&mut self, stage: Arc<dyn AnyStage>) -> PipelineResult<()> {
        self.ensure_idle("a stage")?;
        if self.stages.iter().any(|s| s.id() == stage.id()) {
            return Err(PipelineError::config(format!(
                "stage id '{}' is already part of the pipeline",
                stage.id()
            )));
        }
        stage.attach_events(self.events_tx.clone());
        debug!("Added {} stage '{}' ({})", stage.kind(), stage.name(), stage.id());
        self.stages.push(stage);
        Ok(())
    }

    pub fn add_connection(&mut self, connection: Arc<dyn AnyConnection>) -> PipelineResult<()> {
        self.ensure_idle("a connection")?;
        if self.connections.iter().any(|c| c.id() == connection.id()) {
            return Err(PipelineError::config(format!(
                "connection '{}' is already part of the pipeline",
                connection.name()
            )));
        }
        debug!("Added connection '{}' ({})", connection.name(), connection.id());
        self.connections.push(connection);
        Ok(())
    }

    /// Starts every stage in insertion order.
    ///
    /// If a stage fails to start, the stages started before it keep running
    /// until [`Pipeline::shutdown`] (or drop).
    pub fn run(&self) -> PipelineResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipelineError::InvalidState(
                "pipeline is already running".to_string(),
            ));
        }
        info!(
            "Starting pipeline with {} stages and {} connections",
            self.stages.len(),
            self.connections.len()
        );
        for stage in &self.stages {
            stage.run()?;
        }
        Ok(())
    }

    /// Closes all connections, then stops and joins all stages. Idempotent.
    pub fn shutdown(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        if was_running {
            info!("Shutting down pipeline...");
        }
        for connection in &self.connections {
            connection.shutdown();
        }
        for stage in &self.stages {
            stage.shutdown();
        }
        if was_running {
            info!("Pipeline stopped.");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stages(&self) -> &[Arc<dyn AnyStage>] {
        &self.stages
    }

    pub fn connections(&self) -> &[Arc<dyn AnyConnection>] {
        &self.connections
    }

    /// First stage whose type name is `name`.
    pub fn stage(&self, name: &str) -> PipelineResult<Arc<dyn AnyStage>> {
        self.stages
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| PipelineError::StageNotFound {
                name: name.to_string(),
            })
    }

    pub fn stage_by_id(&self, id: &str) -> PipelineResult<Arc<dyn AnyStage>> {
        self.stages
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or_else(|| PipelineError::StageNotFound {
                name: id.to_string(),
            })
    }

    /// Receiver for lifecycle events of every added stage.
    pub fn events(&self) -> flume::Receiver<StageEvent> {
        self.events_rx.clone()
    }

    /// Per-stage counters, keyed by stage id, in insertion order.
    pub fn stats(&self) -> Vec<(String, StageStats)> {
        self.stages
            .iter()
            .map(|s| (s.id().to_string(), s.stats()))
            .collect()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "stages",
                &self.stages.iter().map(|s| s.id()).collect::<Vec<_>>(),
            )
            .field(
                "connections",
                &self.connections.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("running", &self.is_running())
            .finish()
    }
}
