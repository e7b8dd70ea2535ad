//! Per-slot bookkeeping for the connection pool.
//!
//! A slot is one reusable payload cell. The payload itself lives in the
//! owning [`Connection`](crate::connection::Connection); this module only
//! tracks who may touch it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Upper bound on consumers attached to a single connection.
pub const MAX_CONSUMERS: usize = 32;

/// Safety-net re-check interval for blocked acquire calls.
///
/// Waiters are normally woken by a condition variable; this only bounds the
/// damage of a missed notification.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sequence number carried by a slot that was never produced or was discarded.
pub const NO_TASK: u64 = 0;

/// State of one slot as seen by one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsumerState {
    /// Nothing to read (drained, discarded or never produced).
    Empty,
    /// Produced and not yet read by this consumer.
    Available,
    /// This consumer currently holds a read lease.
    InUse,
}

/// Which of several available slots a consumer claims first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// Smallest qualifying task id.
    #[serde(rename = "fifo")]
    Oldest,
    /// Largest qualifying task id.
    #[serde(rename = "lifo")]
    Newest,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Oldest => f.write_str("fifo"),
            Strategy::Newest => f.write_str("lifo"),
        }
    }
}

/// Consumer identifier handed out by `Connection::connect_consumer`.
///
/// Ids are dense and stable: `0..MAX_CONSUMERS` in connection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(pub(crate) usize);

impl ConsumerId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

/// Bookkeeping for one slot. Guarded by the connection mutex.
#[derive(Debug, Clone)]
pub(crate) struct TaskSlot {
    pub task_id: u64,
    pub producing_locked: bool,
    pub consumer_state: [ConsumerState; MAX_CONSUMERS],
}

impl Default for TaskSlot {
    fn default() -> Self {
        Self {
            task_id: NO_TASK,
            producing_locked: false,
            consumer_state: [ConsumerState::Empty; MAX_CONSUMERS],
        }
    }
}

impl TaskSlot {
    /// Free for a producer: not being written and not being read by any of
    /// the first `consumers` consumers. Unread `Available` data does not block.
    pub fn is_producible(&self, consumers: usize) -> bool {
        !self.producing_locked
            && self.consumer_state[..consumers]
                .iter()
                .all(|s| *s != ConsumerState::InUse)
    }

    pub fn is_consumable(&self, consumer: ConsumerId, min_task_id: u64) -> bool {
        !self.producing_locked
            && self.consumer_state[consumer.0] == ConsumerState::Available
            && self.task_id > min_task_id
    }

    pub fn lock_for_production(&mut self, consumers: usize) {
        self.producing_locked = true;
        // Nobody may claim a slot while it is being rewritten.
        for state in &mut self.consumer_state[..consumers] {
            *state = ConsumerState::Empty;
        }
    }

    pub fn publish(&mut self, task_id: u64, consumers: usize) {
        self.producing_locked = false;
        self.task_id = task_id;
        for state in &mut self.consumer_state[..consumers] {
            *state = ConsumerState::Available;
        }
    }

    pub fn discard(&mut self, consumers: usize) {
        self.producing_locked = false;
        self.task_id = NO_TASK;
        for state in &mut self.consumer_state[..consumers] {
            *state = ConsumerState::Empty;
        }
    }
}

/// Point-in-time copy of a slot's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub task_id: u64,
    pub producing_locked: bool,
    pub consumer_states: Vec<ConsumerState>,
}

impl SlotSnapshot {
    pub(crate) fn of(slot: &TaskSlot, consumers: usize) -> Self {
        Self {
            task_id: slot.task_id,
            producing_locked: slot.producing_locked,
            consumer_states: slot.consumer_state[..consumers].to_vec(),
        }
    }
}
