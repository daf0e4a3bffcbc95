//! Stage execution and scheduling for Dubflow.
//!
//! This crate owns everything between the HTTP surface and the external
//! workers: the single-flight global run lock, the progress bus that turns
//! worker output into durable state plus push events, the per-stage runner,
//! and the batch scheduler that walks a task through the stage graph.

pub mod batch;
pub mod bus;
pub mod lock;
pub mod runner;
pub mod subscribers;

#[cfg(test)]
pub(crate) mod testutil;

pub use batch::{BatchRunner, BatchSnapshot, BatchState, BatchTaskRequest};
pub use bus::ProgressBus;
pub use lock::{ExecutionRecord, GlobalRunLock};
pub use runner::StageRunner;
pub use subscribers::{SubscriberRegistry, Subscription, TaskEvent};
