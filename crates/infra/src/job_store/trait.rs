use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use bulkmsg_core::{DomainError, JobId};
use bulkmsg_messaging::{BulkJob, JobCommand, JobEvent};

/// Default history page size.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Durable home of job records.
///
/// Every mutation is one atomic read-modify-write scoped to one record:
/// `execute` decides (via `Aggregate::handle`) and applies against the same
/// state it read, so two concurrent callers can never both observe
/// `remaining_batches == 1` and both complete the job.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Store a freshly created record.
    async fn insert(&self, job: &BulkJob) -> Result<(), JobStoreError>;

    /// Load one consistent snapshot of a record.
    async fn load(&self, id: JobId) -> Result<Option<BulkJob>, JobStoreError>;

    /// Run `command` against the record atomically.
    ///
    /// Returns `Ok(None)` when the record does not exist and
    /// `Err(JobStoreError::Rejected(_))` when the aggregate refused the command.
    async fn execute(&self, id: JobId, command: JobCommand)
    -> Result<Option<Executed>, JobStoreError>;

    /// Delete a record if, and only if, it is in a terminal status.
    ///
    /// Returns the deleted record, `Ok(None)` when missing.
    async fn delete_terminal(&self, id: JobId) -> Result<Option<BulkJob>, JobStoreError>;

    /// Records ordered newest first.
    async fn list(&self, page: PageRequest) -> Result<JobPage, JobStoreError>;
}

/// Outcome of a successful `execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    pub events: Vec<JobEvent>,
    /// The record after the events were applied.
    pub job: BulkJob,
}

impl Executed {
    pub fn completed(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, JobEvent::Completed { .. }))
    }
}

/// Zero-based page of the history listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page,
            per_page: per_page.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        self.page as u64 * self.per_page as u64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPage {
    pub items: Vec<BulkJob>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobStoreError {
    /// The aggregate refused the command (precondition miss, invariant).
    #[error(transparent)]
    Rejected(#[from] DomainError),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// Optimistic concurrency retries were exhausted.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl JobStoreError {
    /// Precondition misses surface to callers as "no matching state".
    pub fn is_no_matching_state(&self) -> bool {
        matches!(self, JobStoreError::Rejected(e) if e.is_invalid_state())
    }
}
