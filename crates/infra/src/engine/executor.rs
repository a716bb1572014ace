//! Batch executor: runs one batch unit against the job record.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use bulkmsg_messaging::{BatchUnit, JobCommand, JobStatus};

use crate::job_store::{JobRepository, JobStoreError};

use super::ports::{MessageTransport, OutboundMessage, TransportError};

/// What a unit invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Messages were sent and the tallies accounted.
    Delivered {
        sent: u64,
        failed: u64,
        /// This invocation moved the job to Completed.
        completed_job: bool,
    },
    /// The job was already terminal; nothing was sent but the unit was still counted down.
    Discarded { status: JobStatus },
    /// The job record no longer exists.
    JobMissing,
    /// The unit belongs to an earlier run of the job and was ignored.
    StaleRun { unit_run: u32, current_run: u32 },
}

/// Infrastructure failure: the unit should go back to the queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecuteError {
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    TransportUnavailable(TransportError),
}

pub struct BatchExecutor {
    jobs: Arc<dyn JobRepository>,
    transport: Arc<dyn MessageTransport>,
}

impl BatchExecutor {
    pub fn new(jobs: Arc<dyn JobRepository>, transport: Arc<dyn MessageTransport>) -> Self {
        Self { jobs, transport }
    }

    /// Execute one batch unit.
    ///
    /// 1. Guard: a missing record is a no-op success; a terminal record means
    ///    send nothing but still account the unit with zero tallies.
    /// 2. Queued moves to Processing (a concurrent duplicate is a no-op).
    /// 3. Send to every recipient, counting per-recipient failures locally.
    /// 4. Add the tallies and count the unit down in one atomic step.
    #[instrument(
        skip(self, unit),
        fields(job_id = %unit.job_id, run = unit.run, batch = unit.index, recipients = unit.recipient_ids.len()),
        err
    )]
    pub async fn execute(&self, unit: &BatchUnit) -> Result<BatchOutcome, ExecuteError> {
        let Some(job) = self.jobs.load(unit.job_id).await? else {
            debug!(job_id = %unit.job_id, "job record gone, dropping batch");
            return Ok(BatchOutcome::JobMissing);
        };

        if job.run != unit.run {
            debug!(job_id = %unit.job_id, unit_run = unit.run, current_run = job.run, "stale batch ignored");
            return Ok(BatchOutcome::StaleRun {
                unit_run: unit.run,
                current_run: job.run,
            });
        }

        if job.status.is_terminal() {
            return self.account_discarded(unit, job.status).await;
        }

        if job.status == JobStatus::Queued {
            self.jobs
                .execute(unit.job_id, JobCommand::MarkProcessing { run: unit.run })
                .await?;
        }

        let (sent, failed) = self.send_all(unit).await?;

        let at = Utc::now();
        let executed = self
            .jobs
            .execute(
                unit.job_id,
                JobCommand::RecordBatch {
                    run: unit.run,
                    sent,
                    failed,
                    at,
                },
            )
            .await?;

        let Some(executed) = executed else {
            return Ok(BatchOutcome::JobMissing);
        };

        let completed_job = executed.completed();
        if completed_job {
            tracing::info!(
                job_id = %unit.job_id,
                sent = executed.job.sent_count,
                failed = executed.job.failed_count,
                "bulk message completed"
            );
        }

        Ok(BatchOutcome::Delivered {
            sent,
            failed,
            completed_job,
        })
    }

    async fn send_all(&self, unit: &BatchUnit) -> Result<(u64, u64), ExecuteError> {
        let mut sent = 0u64;
        let mut failed = 0u64;

        for &recipient in &unit.recipient_ids {
            let message = OutboundMessage {
                recipient,
                subject: &unit.payload.subject,
                body: &unit.payload.body,
                format: unit.payload.format,
                sender: unit.sender_id,
            };

            match self.transport.send(message).await {
                Ok(()) => sent += 1,
                Err(e) if e.is_retryable() => {
                    return Err(ExecuteError::TransportUnavailable(e));
                }
                Err(e) => {
                    warn!(job_id = %unit.job_id, recipient = %recipient, error = %e, "delivery failed");
                    failed += 1;
                }
            }
        }

        Ok((sent, failed))
    }

    async fn account_discarded(&self, unit: &BatchUnit, status: JobStatus) -> Result<BatchOutcome, ExecuteError> {
        debug!(job_id = %unit.job_id, %status, "job finished, discarding batch");
        let executed = self
            .jobs
            .execute(
                unit.job_id,
                JobCommand::RecordBatch {
                    run: unit.run,
                    sent: 0,
                    failed: 0,
                    at: Utc::now(),
                },
            )
            .await?;

        Ok(match executed {
            Some(executed) => BatchOutcome::Discarded {
                status: executed.job.status,
            },
            None => BatchOutcome::JobMissing,
        })
    }
}
