//! Bounded task queues and the adaptive batch processor (spec §4.8,
//! component C8) that drives the traffic pipeline's collection cycle and
//! bulk monitor add/delete.

pub mod batch;
pub mod queue;
pub mod traffic;

pub use batch::{BatchProcessor, JobHandler};
pub use queue::{EnqueueOutcome, Payload, QueueItem, QueueLane, TaskQueue};
pub use traffic::TrafficJobHandler;
