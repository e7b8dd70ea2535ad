//! Slot-pool pipelines.
//!
//! Stages run on their own threads and exchange data through bounded
//! connections. A connection is a pool of reusable slots with one producer
//! and up to [`MAX_CONSUMERS`] consumers; every produced slot is offered to
//! every consumer, and a slow consumer only ever misses data, it never
//! slows the producer down or sees a value twice.
//!
//! Pipelines are assembled in code or from a YAML [`PipelineDescription`]
//! resolved against a [`Registry`] of stage types.

pub mod config;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod slot;
pub mod stage;
pub mod stages;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::*;
pub use connection::*;
pub use error::*;
pub use pipeline::*;
pub use registry::*;
pub use slot::*;
pub use stage::*;
pub use stages::{register_builtin_stages, BuiltinOptions, DEFAULT_CAPACITY};
