//! Bulk messaging domain module.
//!
//! This crate contains the rules of a bulk send, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage):
//!
//! - `job`: the job record aggregate and its state machine
//! - `batch`: partitioning a resolved recipient list into batch units
//! - `progress`: the read-only projection used for status displays
//! - `action`: user-facing lifecycle actions and their preconditions

pub mod action;
pub mod batch;
pub mod job;
pub mod progress;

pub use action::JobAction;
pub use batch::{BatchSize, BatchUnit, batch_count, partition};
pub use job::{
    BodyFormat, BulkJob, JobCommand, JobEvent, JobStatus, MessagePayload, NewBulkJob,
    RecipientSelection, SUBJECT_MAX_LEN,
};
pub use progress::{ProgressSnapshot, percentage};
