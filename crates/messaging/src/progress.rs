//! Read-only progress projection of a job record.

use serde::{Deserialize, Serialize};

use bulkmsg_core::JobId;

use crate::action::JobAction;
use crate::job::{BulkJob, JobStatus};

/// What a polling client needs to render a job's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub status_code: i16,
    pub status_label: String,
    pub sent_count: u64,
    pub failed_count: u64,
    pub recipient_count: u64,
    pub percentage: u64,
    /// Clients stop polling once this is true.
    pub terminal: bool,
    pub actions: Vec<JobAction>,
}

impl ProgressSnapshot {
    pub fn of(job: &BulkJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            status_code: job.status.code(),
            status_label: job.status.label().to_string(),
            sent_count: job.sent_count,
            failed_count: job.failed_count,
            recipient_count: job.recipient_count,
            percentage: percentage(job.processed(), job.recipient_count),
            terminal: job.status.is_terminal(),
            actions: job.status.available_actions(),
        }
    }
}

/// round((processed / count) * 100), half rounding up, 0 when `count` is 0.
///
/// Not clamped: duplicate deliveries can push the value past 100.
pub fn percentage(processed: u64, count: u64) -> u64 {
    if count == 0 {
        return 0;
    }
    let processed = processed as u128;
    let count = count as u128;
    ((200 * processed + count) / (2 * count)) as u64
}
