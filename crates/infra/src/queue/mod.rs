//! Task queue for batch units, with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - At-least-once: a unit that fails with an infrastructure error is retried
//! - Retry policy with fixed, linear or exponential backoff
//! - Dead-letter queue for units that exhausted their retries
//! - `purge_pending` removes not-yet-started units of one job
//!
//! ## Components
//!
//! - `Task`: a batch unit plus attempt bookkeeping
//! - `TaskQueue`: the queue boundary (in-memory implementation provided)
//! - `DeadLetterEntry`: failed tasks kept for inspection

pub mod store;
pub mod types;

pub use store::{FailureDisposition, InMemoryTaskQueue, QueueStats, TaskQueue, TaskQueueError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, RetryPolicy, Task, TaskAttemptRecord, TaskId, TaskStatus,
};
