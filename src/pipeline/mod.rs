//! Pipeline entry points for the ingestion loops.
//!
//! - `Producer`: fetch feeds, drop seen links, publish to the queue
//! - `Consumer`: batch queue messages into date-partitioned objects

pub mod batch;
pub mod consume;
pub mod produce;

pub use crate::models::AckMode;
pub use batch::{Batch, BatchAccumulator, FlushTrigger, PartitionState};
pub use consume::{Consumer, ConsumerStats};
pub use produce::{CycleOutcome, Producer, ProducerState};
