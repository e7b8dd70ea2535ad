//! Stage trait objects and the per-stage driving loop.
//!
//! A stage owns one worker thread. Each iteration it leases a slot from its
//! input connection (if any), leases a slot from its output connection (if
//! any) and hands both leases to the stage body. Leases release themselves
//! when the body is done with them, also when it fails or panics, so a
//! faulty call never strands a slot.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{
    AnyConnection, Connection, ConsumptionSlot, InConnection, OutConnection, ProductionSlot,
};
use crate::error::{PipelineError, PipelineResult, StageError};
use crate::slot::Strategy;

/// Stage parameters as a flexible key-value map
pub type StageParams = HashMap<String, serde_json::Value>;

/// How a stage is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageKind {
    Producer,
    Consumer,
    ProducerConsumer,
}

impl StageKind {
    pub fn consumes(self) -> bool {
        matches!(self, StageKind::Consumer | StageKind::ProducerConsumer)
    }

    pub fn produces(self) -> bool {
        matches!(self, StageKind::Producer | StageKind::ProducerConsumer)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Producer => "producer",
            StageKind::Consumer => "consumer",
            StageKind::ProducerConsumer => "producerConsumer",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a stage. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Created,
    Running,
    ShutdownRequested,
    Joined,
}

/// Counters maintained by the driving loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    /// Calls into the stage body.
    pub iterations: u64,
    /// Calls that returned an error or panicked.
    pub failures: u64,
}

/// Lifecycle notifications sent by stage threads.
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    Started { stage_id: String },
    CallbackFailed { stage_id: String, message: String },
    Stopped { stage_id: String, stats: StageStats },
}

pub type ProduceFn<Out> = Box<dyn FnMut(ProductionSlot<'_, Out>) -> Result<(), StageError> + Send>;
pub type ConsumeFn<In> = Box<dyn FnMut(ConsumptionSlot<'_, In>) -> Result<(), StageError> + Send>;
pub type TransformFn<In, Out> = Box<
    dyn FnMut(ConsumptionSlot<'_, In>, ProductionSlot<'_, Out>) -> Result<(), StageError> + Send,
>;

/// The user logic of a stage, shaped by its wiring.
///
/// A body receives its leases by value. Committing the production lease
/// publishes the payload; letting it drop discards it.
pub enum StageBody<In, Out> {
    Produce(ProduceFn<Out>),
    Consume(ConsumeFn<In>),
    Transform(TransformFn<In, Out>),
}

impl<In, Out> StageBody<In, Out> {
    pub fn produce<F>(body: F) -> Self
    where
        F: FnMut(ProductionSlot<'_, Out>) -> Result<(), StageError> + Send + 'static,
    {
        StageBody::Produce(Box::new(body))
    }

    pub fn consume<F>(body: F) -> Self
    where
        F: FnMut(ConsumptionSlot<'_, In>) -> Result<(), StageError> + Send + 'static,
    {
        StageBody::Consume(Box::new(body))
    }

    pub fn transform<F>(body: F) -> Self
    where
        F: FnMut(ConsumptionSlot<'_, In>, ProductionSlot<'_, Out>) -> Result<(), StageError>
            + Send
            + 'static,
    {
        StageBody::Transform(Box::new(body))
    }

    pub fn kind(&self) -> StageKind {
        match self {
            StageBody::Produce(_) => StageKind::Producer,
            StageBody::Consume(_) => StageKind::Consumer,
            StageBody::Transform(_) => StageKind::ProducerConsumer,
        }
    }

    fn invoke(
        &mut self,
        consumed: Option<ConsumptionSlot<'_, In>>,
        produced: Option<ProductionSlot<'_, Out>>,
    ) -> Result<(), StageError> {
        match (self, consumed, produced) {
            (StageBody::Produce(f), None, Some(out)) => (**f)(out),
            (StageBody::Consume(f), Some(input), None) => (**f)(input),
            (StageBody::Transform(f), Some(input), Some(out)) => (**f)(input, out),
            _ => Err(StageError::Processing(
                "leases do not match the stage body".to_string(),
            )),
        }
    }
}

/// Element-type independent view of a stage, as stored by a pipeline.
pub trait AnyStage: Send + Sync {
    /// Type name of the stage (its registry key).
    fn name(&self) -> &str;
    /// Unique instance id.
    fn id(&self) -> &str;
    fn kind(&self) -> StageKind;
    fn strategy(&self) -> Option<Strategy>;
    fn params(&self) -> &StageParams;
    fn input_connection(&self) -> Option<Arc<dyn AnyConnection>>;
    fn output_connection(&self) -> Option<Arc<dyn AnyConnection>>;
    /// Spawns the worker thread.
    fn run(&self) -> PipelineResult<()>;
    /// Signals the worker and joins it. Idempotent.
    fn shutdown(&self);
    fn is_shutdown(&self) -> bool;
    fn state(&self) -> StageState;
    fn stats(&self) -> StageStats;
    /// Routes this stage's lifecycle events to `events`.
    fn attach_events(&self, events: flume::Sender<StageEvent>);
}

/// State shared between a stage handle and its worker thread.
#[derive(Default)]
struct StageControl {
    stop: AtomicBool,
    iterations: AtomicU64,
    failures: AtomicU64,
    events: Mutex<Option<flume::Sender<StageEvent>>>,
}

impl StageControl {
    fn emit(&self, event: StageEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            // Lossy like the data path: a full or abandoned event channel
            // must never stall a stage.
            let _ = tx.try_send(event);
        }
    }

    fn stats(&self) -> StageStats {
        StageStats {
            iterations: self.iterations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

struct Worker<In, Out> {
    input: Option<InConnection<In>>,
    output: Option<OutConnection<Out>>,
    body: StageBody<In, Out>,
}

impl<In, Out> Worker<In, Out> {
    fn run(self, stage_id: &str, control: &StageControl) {
        info!("Stage thread '{}' started.", stage_id);
        control.emit(StageEvent::Started {
            stage_id: stage_id.to_string(),
        });

        let Worker {
            mut input,
            output,
            mut body,
        } = self;

        while !control.stop.load(Ordering::Acquire) {
            let consumed = match input.as_mut() {
                Some(input) => match input.acquire_until(&control.stop) {
                    Some(slot) => Some(slot),
                    None => break,
                },
                None => None,
            };
            let produced = match output.as_ref() {
                Some(output) => match output.acquire_until(&control.stop) {
                    Some(slot) => Some(slot),
                    None => break,
                },
                None => None,
            };

            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| body.invoke(consumed, produced)));
            control.iterations.fetch_add(1, Ordering::Relaxed);

            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => {
                    warn!("Stage '{}' returned an error: {}", stage_id, e);
                    e.to_string()
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("Stage '{}' panicked: {}", stage_id, message);
                    message
                }
            };
            control.failures.fetch_add(1, Ordering::Relaxed);
            control.emit(StageEvent::CallbackFailed {
                stage_id: stage_id.to_string(),
                message,
            });
        }

        let stats = control.stats();
        info!(
            "Stage thread '{}' finished after {} iterations ({} failed).",
            stage_id, stats.iterations, stats.failures
        );
        control.emit(StageEvent::Stopped {
            stage_id: stage_id.to_string(),
            stats,
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A running unit wired to at most one input and one output connection.
///
/// Pure producers are `Stage<(), Out>`, pure consumers `Stage<In, ()>`.
pub struct Stage<In, Out> {
    name: String,
    id: String,
    kind: StageKind,
    strategy: Option<Strategy>,
    params: StageParams,
    input: Option<Arc<Connection<In>>>,
    output: Option<Arc<Connection<Out>>>,
    worker: Mutex<Option<Worker<In, Out>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<StageState>,
    control: Arc<StageControl>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<In, Out> Stage<In, Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    /// Wires a stage. The body's shape decides which connections are
    /// required; a consuming stage also needs a strategy. Connecting happens
    /// here, so consumer capacity and producer exclusivity fail at
    /// construction time.
    pub fn new(
        name: impl Into<String>,
        strategy: Option<Strategy>,
        input: Option<Arc<Connection<In>>>,
        output: Option<Arc<Connection<Out>>>,
        body: StageBody<In, Out>,
    ) -> PipelineResult<Self> {
        let name = name.into();
        let kind = body.kind();

        if kind.consumes() && input.is_none() {
            return Err(PipelineError::MissingConnection {
                stage: name,
                which: "input",
            });
        }
        if kind.produces() && output.is_none() {
            return Err(PipelineError::MissingConnection {
                stage: name,
                which: "output",
            });
        }
        if !kind.consumes() && input.is_some() {
            return Err(PipelineError::config(format!(
                "{} stage '{}' cannot take an input connection",
                kind, name
            )));
        }
        if !kind.produces() && output.is_some() {
            return Err(PipelineError::config(format!(
                "{} stage '{}' cannot take an output connection",
                kind, name
            )));
        }

        // Producers carry no strategy; it only steers consumption.
        let strategy = if kind.consumes() {
            Some(strategy.ok_or_else(|| {
                PipelineError::config(format!(
                    "stage '{}' consumes and needs a consumption strategy",
                    name
                ))
            })?)
        } else {
            None
        };

        // Attach the producer side first: a failed consumer connect then
        // releases it again on drop.
        let out = output.clone().map(OutConnection::new).transpose()?;
        let inp = match (input.clone(), strategy) {
            (Some(connection), Some(strategy)) => Some(InConnection::new(connection, strategy)?),
            _ => None,
        };

        let id = Uuid::new_v4().to_string();
        debug!("Constructed {} stage '{}' ({})", kind, name, id);

        Ok(Self {
            name,
            id,
            kind,
            strategy,
            params: StageParams::new(),
            input,
            output,
            worker: Mutex::new(Some(Worker {
                input: inp,
                output: out,
                body,
            })),
            handle: Mutex::new(None),
            state: Mutex::new(StageState::Created),
            control: Arc::new(StageControl::default()),
        })
    }

    /// Replaces the generated instance id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_params(mut self, params: StageParams) -> Self {
        self.params = params;
        self
    }

    pub fn input(&self) -> Option<&Arc<Connection<In>>> {
        self.input.as_ref()
    }

    pub fn output(&self) -> Option<&Arc<Connection<Out>>> {
        self.output.as_ref()
    }
}

impl<Out> Stage<(), Out>
where
    Out: Send + Sync + 'static,
{
    /// A stage that only fills `output`.
    pub fn producer<F>(
        name: impl Into<String>,
        output: Arc<Connection<Out>>,
        body: F,
    ) -> PipelineResult<Self>
    where
        F: FnMut(ProductionSlot<'_, Out>) -> Result<(), StageError> + Send + 'static,
    {
        Self::new(name, None, None, Some(output), StageBody::produce(body))
    }
}

impl<In> Stage<In, ()>
where
    In: Send + Sync + 'static,
{
    /// A stage that only drains `input`.
    pub fn consumer<F>(
        name: impl Into<String>,
        strategy: Strategy,
        input: Arc<Connection<In>>,
        body: F,
    ) -> PipelineResult<Self>
    where
        F: FnMut(ConsumptionSlot<'_, In>) -> Result<(), StageError> + Send + 'static,
    {
        Self::new(name, Some(strategy), Some(input), None, StageBody::consume(body))
    }
}

impl<In, Out> Stage<In, Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    /// A stage that reads `input` and writes `output`.
    pub fn producer_consumer<F>(
        name: impl Into<String>,
        strategy: Strategy,
        input: Arc<Connection<In>>,
        output: Arc<Connection<Out>>,
        body: F,
    ) -> PipelineResult<Self>
    where
        F: FnMut(ConsumptionSlot<'_, In>, ProductionSlot<'_, Out>) -> Result<(), StageError>
            + Send
            + 'static,
    {
        Self::new(
            name,
            Some(strategy),
            Some(input),
            Some(output),
            StageBody::transform(body),
        )
    }
}

impl<In, Out> AnyStage for Stage<In, Out>
where
    In: Send + Sync + 'static,
    Out: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    fn strategy(&self) -> Option<Strategy> {
        self.strategy
    }

    fn params(&self) -> &StageParams {
        &self.params
    }

    fn input_connection(&self) -> Option<Arc<dyn AnyConnection>> {
        self.input
            .clone()
            .map(|connection| connection as Arc<dyn AnyConnection>)
    }

    fn output_connection(&self) -> Option<Arc<dyn AnyConnection>> {
        self.output
            .clone()
            .map(|connection| connection as Arc<dyn AnyConnection>)
    }

    fn run(&self) -> PipelineResult<()> {
        let mut state = lock(&self.state);
        match *state {
            StageState::Created => {}
            StageState::Running => {
                return Err(PipelineError::AlreadyRunning {
                    stage: self.id.clone(),
                })
            }
            StageState::ShutdownRequested | StageState::Joined => {
                return Err(PipelineError::InvalidState(format!(
                    "stage '{}' has been shut down",
                    self.id
                )))
            }
        }

        let worker = lock(&self.worker).take().ok_or_else(|| {
            PipelineError::InvalidState(format!("stage '{}' lost its worker", self.id))
        })?;
        let control = Arc::clone(&self.control);
        let stage_id = self.id.clone();

        let handle = thread::Builder::new()
            .name(format!("stage-{}", self.id))
            .spawn(move || worker.run(&stage_id, &control))?;

        *lock(&self.handle) = Some(handle);
        *state = StageState::Running;
        Ok(())
    }

    fn shutdown(&self) {
        self.control.stop.store(true, Ordering::Release);

        {
            let mut state = lock(&self.state);
            match *state {
                StageState::Created => {
                    // Never ran: dropping the worker detaches it from its connections.
                    lock(&self.worker).take();
                    *state = StageState::Joined;
                    return;
                }
                StageState::Running => *state = StageState::ShutdownRequested,
                StageState::ShutdownRequested | StageState::Joined => {}
            }
        }

        // Held across the join so a concurrent caller waits for it too.
        let mut handle = lock(&self.handle);
        if let Some(handle) = handle.take() {
            debug!("Waiting for stage '{}' to shut down...", self.id);
            if let Err(e) = handle.join() {
                error!(
                    "Stage '{}' panicked during shutdown: {}",
                    self.id,
                    panic_message(e.as_ref())
                );
            }
        }
        *lock(&self.state) = StageState::Joined;
    }

    fn is_shutdown(&self) -> bool {
        self.control.stop.load(Ordering::Acquire)
    }

    fn state(&self) -> StageState {
        *lock(&self.state)
    }

    fn stats(&self) -> StageStats {
        self.control.stats()
    }

    fn attach_events(&self, events: flume::Sender<StageEvent>) {
        *lock(&self.control.events) = Some(events);
    }
}

impl<In, Out> Drop for Stage<In, Out> {
    fn drop(&mut self) {
        self.control.stop.store(true, Ordering::Release);
        let handle = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Stage '{}' worker panicked", self.id);
            }
        }
    }
}

impl<In, Out> fmt::Debug for Stage<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("strategy", &self.strategy)
            .field("state", &*lock(&self.state))
            .finish()
    }
}
