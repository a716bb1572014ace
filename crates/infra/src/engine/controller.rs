//! Job lifecycle controller: create, cancel, stop, start, delete.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use bulkmsg_core::{DomainError, JobId, RecipientId, SenderId};
use bulkmsg_messaging::{
    BatchUnit, BulkJob, JobCommand, JobStatus, MessagePayload, NewBulkJob, RecipientSelection,
    batch_count, partition,
};

use crate::config::EngineConfig;
use crate::job_store::{JobRepository, JobStoreError};
use crate::queue::{Task, TaskQueue, TaskQueueError};

use super::ports::{RecipientResolver, ResolveError};

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedJob {
    pub job_id: JobId,
    pub recipient_count: u64,
    pub batch_count: u64,
    pub message: String,
}

/// Result of an admin action. Precondition misses are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied { message: String },
    NoMatchingState { message: String },
    NotFound,
}

impl ActionOutcome {
    fn no_matching_state(reason: impl std::fmt::Display) -> Self {
        ActionOutcome::NoMatchingState {
            message: reason.to_string(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ActionOutcome::Applied { .. })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error("No users match the current filters.")]
    NoRecipients,

    #[error("Too many recipients. The maximum allowed is {max}. Please narrow your filters.")]
    TooManyRecipients { count: usize, max: usize },

    #[error("recipient resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] TaskQueueError),
}

/// Owns every user-initiated transition of a job record.
pub struct LifecycleController {
    jobs: Arc<dyn JobRepository>,
    queue: Arc<dyn TaskQueue>,
    resolver: Arc<dyn RecipientResolver>,
    config: EngineConfig,
}

impl LifecycleController {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        queue: Arc<dyn TaskQueue>,
        resolver: Arc<dyn RecipientResolver>,
        config: EngineConfig,
    ) -> Self {
        Self {
            jobs,
            queue,
            resolver,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolve `selection` and create a job for the result.
    pub async fn create_for_selection(
        &self,
        payload: MessagePayload,
        sender_id: SenderId,
        selection: RecipientSelection,
        filter_description: Option<String>,
    ) -> Result<CreatedJob, EngineError> {
        let recipients = self.resolver.resolve(&selection).await?;
        self.create(NewBulkJob {
            payload,
            sender_id,
            selection,
            filter_description,
            recipients,
        })
        .await
    }

    /// Create a queued job for an already-resolved recipient list and dispatch every batch.
    #[instrument(skip(self, request), fields(sender_id = %request.sender_id), err)]
    pub async fn create(&self, request: NewBulkJob) -> Result<CreatedJob, EngineError> {
        let recipients = request.unique_recipients();
        if recipients.is_empty() {
            return Err(EngineError::NoRecipients);
        }
        if self.config.exceeds_max_recipients(recipients.len()) {
            return Err(EngineError::TooManyRecipients {
                count: recipients.len(),
                max: self.config.max_recipients,
            });
        }

        let job = BulkJob::queued(
            JobId::new(),
            &request,
            recipients.len() as u64,
            self.config.batch_size,
            Utc::now(),
        )?;
        self.jobs.insert(&job).await?;

        info!(
            job_id = %job.id,
            sender_id = %job.sender_id,
            recipients = job.recipient_count,
            subject = %job.payload.subject,
            "bulk message queued"
        );

        let units = partition(
            job.id,
            job.run,
            &recipients,
            self.config.batch_size,
            &job.payload,
            job.sender_id,
        );
        self.dispatch(&job, units).await?;

        Ok(CreatedJob {
            job_id: job.id,
            recipient_count: job.recipient_count,
            batch_count: job.remaining_batches,
            message: format!(
                "Bulk message has been queued for delivery to {} user(s).",
                job.recipient_count
            ),
        })
    }

    /// Queued -> Cancelled, then purge the job's pending units.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn cancel(&self, id: JobId) -> Result<ActionOutcome, EngineError> {
        let outcome = self
            .transition(id, JobCommand::Cancel { at: Utc::now() }, || {
                "Bulk message has been cancelled and pending tasks removed.".to_string()
            })
            .await?;
        if outcome.is_applied() {
            self.purge(id)?;
        }
        Ok(outcome)
    }

    /// Processing -> Stopped, then purge the job's pending units. Running units finish.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn stop(&self, id: JobId) -> Result<ActionOutcome, EngineError> {
        let outcome = self
            .transition(id, JobCommand::Stop { at: Utc::now() }, || {
                "Bulk message has been stopped. Messages already sent remain delivered.".to_string()
            })
            .await?;
        if outcome.is_applied() {
            self.purge(id)?;
        }
        Ok(outcome)
    }

    /// Failed or Stopped -> Queued with a fresh run against the re-resolved selection.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn start(&self, id: JobId) -> Result<ActionOutcome, EngineError> {
        let Some(job) = self.jobs.load(id).await? else {
            return Ok(ActionOutcome::NotFound);
        };
        if !matches!(job.status, JobStatus::Failed | JobStatus::Stopped) {
            return Ok(ActionOutcome::no_matching_state(DomainError::invalid_state(format!(
                "start requires a failed or stopped job, job is {}",
                job.status
            ))));
        }

        let recipients = dedup(self.resolver.resolve(&job.selection).await?);
        if recipients.is_empty() {
            return Err(EngineError::NoRecipients);
        }

        let batches = batch_count(recipients.len(), self.config.batch_size) as u64;
        let command = JobCommand::Restart {
            recipient_count: recipients.len() as u64,
            batch_count: batches,
        };
        let restarted = match self.jobs.execute(id, command).await {
            Ok(Some(executed)) => executed.job,
            Ok(None) => return Ok(ActionOutcome::NotFound),
            Err(e) if e.is_no_matching_state() => return Ok(ActionOutcome::no_matching_state(e)),
            Err(e) => return Err(e.into()),
        };

        // Leftovers of the previous run would only be discarded as stale.
        self.purge(id)?;

        let units = partition(
            restarted.id,
            restarted.run,
            &recipients,
            self.config.batch_size,
            &restarted.payload,
            restarted.sender_id,
        );
        self.dispatch(&restarted, units).await?;

        info!(job_id = %id, run = restarted.run, recipients = restarted.recipient_count, "bulk message restarted");

        Ok(ActionOutcome::Applied {
            message: format!(
                "Message has been re-queued for delivery to {} user(s).",
                restarted.recipient_count
            ),
        })
    }

    /// Delete a terminal job record and purge any residual units.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn delete(&self, id: JobId) -> Result<ActionOutcome, EngineError> {
        match self.jobs.delete_terminal(id).await {
            Ok(Some(_)) => {
                self.purge(id)?;
                info!(job_id = %id, "bulk message deleted");
                Ok(ActionOutcome::Applied {
                    message: "Message log entry has been deleted.".to_string(),
                })
            }
            Ok(None) => Ok(ActionOutcome::NotFound),
            Err(e) if e.is_no_matching_state() => Ok(ActionOutcome::no_matching_state(e)),
            Err(e) => Err(e.into()),
        }
    }

    async fn transition(
        &self,
        id: JobId,
        command: JobCommand,
        message: impl FnOnce() -> String,
    ) -> Result<ActionOutcome, EngineError> {
        match self.jobs.execute(id, command).await {
            Ok(Some(executed)) => {
                info!(job_id = %id, status = %executed.job.status, "bulk message transitioned");
                Ok(ActionOutcome::Applied { message: message() })
            }
            Ok(None) => Ok(ActionOutcome::NotFound),
            Err(e) if e.is_no_matching_state() => Ok(ActionOutcome::no_matching_state(e)),
            Err(e) => Err(e.into()),
        }
    }

    fn purge(&self, id: JobId) -> Result<usize, EngineError> {
        let purged = self.queue.purge_pending(id)?;
        if purged > 0 {
            info!(job_id = %id, purged, "pending batches purged");
        }
        Ok(purged)
    }

    /// Enqueue every unit. If the queue refuses one, the run cannot finish:
    /// drop what was enqueued and fail the job so it can be restarted.
    async fn dispatch(&self, job: &BulkJob, units: Vec<BatchUnit>) -> Result<(), EngineError> {
        for unit in units {
            let task = Task::new(unit).with_retry_policy(self.config.retry_policy.clone());
            if let Err(e) = self.queue.enqueue(task) {
                error!(job_id = %job.id, error = %e, "failed to enqueue batch");
                if let Err(purge_err) = self.queue.purge_pending(job.id) {
                    warn!(job_id = %job.id, error = %purge_err, "failed to purge after dispatch failure");
                }
                let fail = JobCommand::Fail {
                    run: job.run,
                    reason: format!("dispatch failed: {e}"),
                    at: Utc::now(),
                };
                if let Err(fail_err) = self.jobs.execute(job.id, fail).await {
                    warn!(job_id = %job.id, error = %fail_err, "failed to mark job failed");
                }
                return Err(e.into());
            }
        }
        Ok(())
    }
}

fn dedup(recipients: Vec<RecipientId>) -> Vec<RecipientId> {
    let mut seen = std::collections::HashSet::with_capacity(recipients.len());
    recipients.into_iter().filter(|r| seen.insert(*r)).collect()
}
