//! Bounded single-producer / multi-consumer slot pool.
//!
//! A [`Connection`] owns a fixed array of payload slots. One producer fills
//! slots, up to [`MAX_CONSUMERS`] consumers read them. Delivery is a lossy
//! broadcast: every consumer keeps its own per-slot read state, and the
//! producer may recycle a slot that some consumer never got around to
//! reading. What it may never do is rewrite a slot somebody is reading, and
//! no consumer may read a slot that is being rewritten.
//!
//! All bookkeeping sits behind one mutex with two condition variables. The
//! payloads sit behind one `RwLock` each, which the protocol keeps
//! uncontended.

use std::any::Any;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::slot::{
    ConsumerId, ConsumerState, SlotSnapshot, Strategy, TaskSlot, MAX_CONSUMERS, NO_TASK,
    POLL_INTERVAL,
};

/// Element-type independent view of a connection.
pub trait AnyConnection: Send + Sync {
    fn id(&self) -> Uuid;
    fn name(&self) -> &str;
    fn capacity(&self) -> usize;
    fn consumer_count(&self) -> usize;
    fn has_producer(&self) -> bool;
    fn shutdown(&self);
    fn is_shutdown(&self) -> bool;
    /// Recover the typed connection. Only the registry does this, once per
    /// stage at construction time.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct PoolState {
    slots: Vec<TaskSlot>,
    consumers: usize,
    producer_attached: bool,
    last_task_id: u64,
    shutdown: bool,
}

/// The slot pool shared by one producing stage and its consumers.
pub struct Connection<T> {
    id: Uuid,
    name: String,
    payloads: Box<[RwLock<T>]>,
    state: Mutex<PoolState>,
    consumable: Condvar,
    producible: Condvar,
}

impl<T: Default> Connection<T> {
    /// Creates a pool of `capacity` default-initialised slots.
    pub fn new(name: impl Into<String>, capacity: usize) -> PipelineResult<Self> {
        Self::with_init(name, capacity, T::default)
    }
}

impl<T> Connection<T> {
    /// Creates a pool whose payloads are built by `init`. The payloads are
    /// never reallocated afterwards; producers overwrite them in place.
    pub fn with_init(
        name: impl Into<String>,
        capacity: usize,
        mut init: impl FnMut() -> T,
    ) -> PipelineResult<Self> {
        let name = name.into();
        if capacity == 0 {
            return Err(PipelineError::config(format!(
                "connection '{}' needs at least one slot",
                name
            )));
        }

        let payloads = (0..capacity).map(|_| RwLock::new(init())).collect();
        debug!("Created connection '{}' with {} slots", name, capacity);

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            payloads,
            state: Mutex::new(PoolState {
                slots: vec![TaskSlot::default(); capacity],
                consumers: 0,
                producer_attached: false,
                last_task_id: NO_TASK,
                shutdown: false,
            }),
            consumable: Condvar::new(),
            producible: Condvar::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.payloads.len()
    }

    // A callback that panics while holding a lease unwinds through the lease
    // drop, which takes this lock; the pool has to stay usable afterwards.
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new consumer. Must happen before that consumer's first fetch.
    pub fn connect_consumer(&self) -> PipelineResult<ConsumerId> {
        let mut state = self.lock_state();
        if state.consumers >= MAX_CONSUMERS {
            return Err(PipelineError::ConsumerCapacityExceeded {
                connection: self.name.clone(),
                max: MAX_CONSUMERS,
            });
        }
        let id = ConsumerId(state.consumers);
        state.consumers += 1;
        debug!("Connected {} to '{}'", id, self.name);
        Ok(id)
    }

    pub fn consumer_count(&self) -> usize {
        self.lock_state().consumers
    }

    pub(crate) fn attach_producer(&self) -> PipelineResult<()> {
        let mut state = self.lock_state();
        if state.producer_attached {
            return Err(PipelineError::ProducerAlreadyAttached {
                connection: self.name.clone(),
            });
        }
        state.producer_attached = true;
        Ok(())
    }

    pub(crate) fn detach_producer(&self) {
        self.lock_state().producer_attached = false;
    }

    pub fn has_producer(&self) -> bool {
        self.lock_state().producer_attached
    }

    /// Highest task id published so far, `0` if nothing was produced yet.
    pub fn last_task_id(&self) -> u64 {
        self.lock_state().last_task_id
    }

    /// Blocks until a slot can be written. `None` once the connection is shut down.
    ///
    /// Among eligible slots the one with the smallest task id wins, so slots
    /// are recycled round-robin and never-produced slots go first.
    pub fn acquire_for_production(&self) -> Option<ProductionSlot<'_, T>> {
        self.acquire_for_production_until(None)
    }

    /// Non-blocking [`acquire_for_production`](Self::acquire_for_production).
    pub fn try_acquire_for_production(&self) -> Option<ProductionSlot<'_, T>> {
        let mut state = self.lock_state();
        if state.shutdown {
            return None;
        }
        self.claim_production_slot(&mut state)
    }

    pub(crate) fn acquire_for_production_until(
        &self,
        cancelled: Option<&AtomicBool>,
    ) -> Option<ProductionSlot<'_, T>> {
        let mut state = self.lock_state();
        loop {
            if state.shutdown || is_cancelled(cancelled) {
                return None;
            }
            if let Some(slot) = self.claim_production_slot(&mut state) {
                return Some(slot);
            }
            state = self
                .producible
                .wait_timeout(state, POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn claim_production_slot<'a>(
        &'a self,
        state: &mut MutexGuard<'a, PoolState>,
    ) -> Option<ProductionSlot<'a, T>> {
        let consumers = state.consumers;
        let index = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_producible(consumers))
            .min_by_key(|(_, slot)| slot.task_id)
            .map(|(index, _)| index)?;

        state.slots[index].lock_for_production(consumers);
        // Uncontended: no consumer holds a read lease on this slot.
        let data = self.payloads[index]
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        Some(ProductionSlot {
            connection: self,
            index,
            data: Some(data),
        })
    }

    /// Ends a production lease. On success the slot gets the next sequence
    /// number and becomes `Available` to every consumer; the assigned id is
    /// returned. On failure the slot is emptied and `0` is returned.
    pub fn release_from_production(&self, mut slot: ProductionSlot<'_, T>, succeeded: bool) -> u64 {
        debug_assert!(std::ptr::eq(slot.connection, self));
        slot.finish(succeeded)
    }

    fn finish_production(&self, index: usize, succeeded: bool) -> u64 {
        let mut state = self.lock_state();
        let consumers = state.consumers;
        if succeeded {
            state.last_task_id += 1;
            let task_id = state.last_task_id;
            state.slots[index].publish(task_id, consumers);
            drop(state);
            self.consumable.notify_all();
            task_id
        } else {
            state.slots[index].discard(consumers);
            NO_TASK
        }
    }

    /// Blocks until a slot is `Available` to `consumer` with a task id above
    /// `min_task_id`. `None` once the connection is shut down.
    pub fn acquire_for_consumption(
        &self,
        consumer: ConsumerId,
        strategy: Strategy,
        min_task_id: u64,
    ) -> Option<ConsumptionSlot<'_, T>> {
        self.acquire_for_consumption_until(consumer, strategy, min_task_id, None)
    }

    /// Non-blocking [`acquire_for_consumption`](Self::acquire_for_consumption).
    pub fn try_acquire_for_consumption(
        &self,
        consumer: ConsumerId,
        strategy: Strategy,
        min_task_id: u64,
    ) -> Option<ConsumptionSlot<'_, T>> {
        let mut state = self.lock_state();
        if state.shutdown || !self.knows_consumer(&state, consumer) {
            return None;
        }
        self.claim_consumption_slot(&mut state, consumer, strategy, min_task_id)
    }

    pub(crate) fn acquire_for_consumption_until(
        &self,
        consumer: ConsumerId,
        strategy: Strategy,
        min_task_id: u64,
        cancelled: Option<&AtomicBool>,
    ) -> Option<ConsumptionSlot<'_, T>> {
        let mut state = self.lock_state();
        if !self.knows_consumer(&state, consumer) {
            return None;
        }
        loop {
            if state.shutdown || is_cancelled(cancelled) {
                return None;
            }
            if let Some(slot) =
                self.claim_consumption_slot(&mut state, consumer, strategy, min_task_id)
            {
                return Some(slot);
            }
            state = self
                .consumable
                .wait_timeout(state, POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn knows_consumer(&self, state: &PoolState, consumer: ConsumerId) -> bool {
        if consumer.0 < state.consumers {
            return true;
        }
        warn!(
            "{} was never connected to '{}' ({} consumers)",
            consumer, self.name, state.consumers
        );
        false
    }

    fn claim_consumption_slot<'a>(
        &'a self,
        state: &mut MutexGuard<'a, PoolState>,
        consumer: ConsumerId,
        strategy: Strategy,
        min_task_id: u64,
    ) -> Option<ConsumptionSlot<'a, T>> {
        let candidates = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_consumable(consumer, min_task_id));
        let (index, task_id) = match strategy {
            Strategy::Oldest => candidates.min_by_key(|(_, slot)| slot.task_id),
            Strategy::Newest => candidates.max_by_key(|(_, slot)| slot.task_id),
        }
        .map(|(index, slot)| (index, slot.task_id))?;

        state.slots[index].consumer_state[consumer.0] = ConsumerState::InUse;
        let data = self.payloads[index]
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        Some(ConsumptionSlot {
            connection: self,
            index,
            consumer,
            task_id,
            data: Some(data),
        })
    }

    /// Ends a consumption lease: the slot becomes `Empty` for that consumer only.
    pub fn release_from_consumption(&self, mut slot: ConsumptionSlot<'_, T>) {
        debug_assert!(std::ptr::eq(slot.connection, self));
        slot.finish();
    }

    fn finish_consumption(&self, index: usize, consumer: ConsumerId) {
        let mut state = self.lock_state();
        let slot_state = &mut state.slots[index].consumer_state[consumer.0];
        if *slot_state == ConsumerState::InUse {
            *slot_state = ConsumerState::Empty;
        }
        drop(state);
        self.producible.notify_all();
    }

    /// Wakes every waiter and makes all further acquires return `None`. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        if !state.shutdown {
            state.shutdown = true;
            info!("Connection '{}' shut down", self.name);
        }
        drop(state);
        self.consumable.notify_all();
        self.producible.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock_state().shutdown
    }

    /// Copies the bookkeeping of every slot.
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        let state = self.lock_state();
        state
            .slots
            .iter()
            .map(|slot| SlotSnapshot::of(slot, state.consumers))
            .collect()
    }
}

fn is_cancelled(cancelled: Option<&AtomicBool>) -> bool {
    cancelled.is_some_and(|flag| flag.load(Ordering::Acquire))
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capacity", &self.payloads.len())
            .field("consumers", &state.consumers)
            .field("last_task_id", &state.last_task_id)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl<T: Send + Sync + 'static> AnyConnection for Connection<T> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        Connection::capacity(self)
    }

    fn consumer_count(&self) -> usize {
        Connection::consumer_count(self)
    }

    fn has_producer(&self) -> bool {
        Connection::has_producer(self)
    }

    fn shutdown(&self) {
        Connection::shutdown(self)
    }

    fn is_shutdown(&self) -> bool {
        Connection::is_shutdown(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Write lease on one slot.
///
/// Released exactly once: by [`commit`](Self::commit), by
/// [`discard`](Self::discard), or as a discard when dropped.
pub struct ProductionSlot<'a, T> {
    connection: &'a Connection<T>,
    index: usize,
    data: Option<RwLockWriteGuard<'a, T>>,
}

impl<'a, T> ProductionSlot<'a, T> {
    /// Index of the leased slot inside its pool.
    pub fn slot(&self) -> usize {
        self.index
    }

    /// Publishes the payload and returns its task id.
    pub fn commit(mut self) -> u64 {
        self.finish(true)
    }

    /// Gives the slot back without publishing anything.
    pub fn discard(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, succeeded: bool) -> u64 {
        match self.data.take() {
            Some(guard) => {
                drop(guard);
                self.connection.finish_production(self.index, succeeded)
            }
            None => NO_TASK,
        }
    }
}

impl<T> Deref for ProductionSlot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.data {
            Some(guard) => &**guard,
            None => unreachable!("production lease used after release"),
        }
    }
}

impl<T> DerefMut for ProductionSlot<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.data {
            Some(guard) => &mut **guard,
            None => unreachable!("production lease used after release"),
        }
    }
}

impl<T> Drop for ProductionSlot<'_, T> {
    fn drop(&mut self) {
        if self.data.is_some() {
            debug!(
                "Production lease on '{}' slot {} dropped without commit",
                self.connection.name, self.index
            );
            self.finish(false);
        }
    }
}

/// Read lease on one slot for one consumer. Released by
/// [`release`](Self::release) or on drop.
pub struct ConsumptionSlot<'a, T> {
    connection: &'a Connection<T>,
    index: usize,
    consumer: ConsumerId,
    task_id: u64,
    data: Option<RwLockReadGuard<'a, T>>,
}

impl<'a, T> ConsumptionSlot<'a, T> {
    pub fn slot(&self) -> usize {
        self.index
    }

    /// Sequence number the producer assigned to this payload.
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    pub fn release(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(guard) = self.data.take() {
            drop(guard);
            self.connection.finish_consumption(self.index, self.consumer);
        }
    }
}

impl<T> Deref for ConsumptionSlot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.data {
            Some(guard) => &**guard,
            None => unreachable!("consumption lease used after release"),
        }
    }
}

impl<T> Drop for ConsumptionSlot<'_, T> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// The producing side of a connection. At most one exists per connection.
pub struct OutConnection<T> {
    connection: Arc<Connection<T>>,
}

impl<T> OutConnection<T> {
    pub fn new(connection: Arc<Connection<T>>) -> PipelineResult<Self> {
        connection.attach_producer()?;
        Ok(Self { connection })
    }

    pub fn connection(&self) -> &Arc<Connection<T>> {
        &self.connection
    }

    pub fn acquire(&self) -> Option<ProductionSlot<'_, T>> {
        self.connection.acquire_for_production()
    }

    pub(crate) fn acquire_until(&self, cancelled: &AtomicBool) -> Option<ProductionSlot<'_, T>> {
        self.connection.acquire_for_production_until(Some(cancelled))
    }
}

impl<T> Drop for OutConnection<T> {
    fn drop(&mut self) {
        self.connection.detach_producer();
    }
}

/// One consumer's side of a connection: its id, strategy and read cursor.
pub struct InConnection<T> {
    connection: Arc<Connection<T>>,
    consumer: ConsumerId,
    strategy: Strategy,
    last_task_id: u64,
}

impl<T> InConnection<T> {
    pub fn new(connection: Arc<Connection<T>>, strategy: Strategy) -> PipelineResult<Self> {
        let consumer = connection.connect_consumer()?;
        Ok(Self {
            connection,
            consumer,
            strategy,
            last_task_id: NO_TASK,
        })
    }

    pub fn connection(&self) -> &Arc<Connection<T>> {
        &self.connection
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Task id of the last payload handed to this consumer.
    pub fn last_task_id(&self) -> u64 {
        self.last_task_id
    }

    /// Fetches the next payload newer than anything this consumer has seen.
    pub fn acquire(&mut self) -> Option<ConsumptionSlot<'_, T>> {
        self.fetch(None)
    }

    pub(crate) fn acquire_until(
        &mut self,
        cancelled: &AtomicBool,
    ) -> Option<ConsumptionSlot<'_, T>> {
        self.fetch(Some(cancelled))
    }

    fn fetch(&mut self, cancelled: Option<&AtomicBool>) -> Option<ConsumptionSlot<'_, T>> {
        let slot = self.connection.acquire_for_consumption_until(
            self.consumer,
            self.strategy,
            self.last_task_id,
            cancelled,
        )?;
        self.last_task_id = slot.task_id();
        Some(slot)
    }
}
