use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bulkmsg_core::{
    Aggregate, AggregateRoot, DomainError, DomainResult, JobId, RecipientId, SenderId, ValueObject,
};

use crate::batch::{BatchSize, batch_count};

/// Longest subject accepted at creation time.
pub const SUBJECT_MAX_LEN: usize = 255;

/// Job record status.
///
/// The numeric codes are stable and used by persistence and the progress API.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Stopped,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Stopped,
    ];

    pub fn code(self) -> i16 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed => 2,
            JobStatus::Failed => 3,
            JobStatus::Cancelled => 4,
            JobStatus::Stopped => 5,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Completed, Failed, Cancelled and Stopped end a run.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Processing)
    }

    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Processing => "Processing",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
            JobStatus::Stopped => "Stopped",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

/// Format of the message body handed to the transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    #[default]
    Html,
    Plain,
    Markdown,
}

impl BodyFormat {
    /// `body` as plain text: HTML loses its tags, other formats pass through.
    pub fn plain_text(self, body: &str) -> String {
        match self {
            BodyFormat::Html => strip_markup(body),
            BodyFormat::Plain | BodyFormat::Markdown => body.to_string(),
        }
    }

    pub fn code(self) -> i16 {
        match self {
            BodyFormat::Html => 1,
            BodyFormat::Plain => 2,
            BodyFormat::Markdown => 4,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(BodyFormat::Html),
            2 => Some(BodyFormat::Plain),
            4 => Some(BodyFormat::Markdown),
            _ => None,
        }
    }
}

/// Subject, body and body format of a bulk send. Immutable for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub subject: String,
    pub body: String,
    pub format: BodyFormat,
}

impl ValueObject for MessagePayload {}

impl MessagePayload {
    /// Build a validated payload.
    ///
    /// The subject is trimmed and must be 1..=255 characters. The body must
    /// contain visible text once markup is stripped.
    pub fn new(
        subject: impl Into<String>,
        body: impl Into<String>,
        format: BodyFormat,
    ) -> DomainResult<Self> {
        let subject = subject.into().trim().to_string();
        let body = body.into();

        if subject.is_empty() {
            return Err(DomainError::validation("subject cannot be empty"));
        }
        if subject.chars().count() > SUBJECT_MAX_LEN {
            return Err(DomainError::validation(format!(
                "subject cannot exceed {SUBJECT_MAX_LEN} characters"
            )));
        }
        if strip_markup(&body).trim().is_empty() {
            return Err(DomainError::validation("message body cannot be empty"));
        }

        Ok(Self {
            subject,
            body,
            format,
        })
    }

    /// Body with markup removed, used for plain-text fallbacks.
    pub fn plain_text(&self) -> String {
        self.format.plain_text(&self.body)
    }
}

fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&nbsp;", " ")
}

/// How the recipients of a job were selected.
///
/// Persisted with the job so a restart can ask the directory for the same
/// selection again instead of guessing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecipientSelection {
    /// Every active recipient in the directory.
    All,
    /// Directory-specific filter criteria, opaque to the engine.
    Criteria(String),
    /// An explicit list, e.g. from an uploaded file.
    List(Vec<RecipientId>),
}

impl RecipientSelection {
    /// Default display text when the caller does not supply one.
    pub fn describe(&self) -> String {
        match self {
            RecipientSelection::All => "all active users".to_string(),
            RecipientSelection::Criteria(c) => format!("filter: {c}"),
            RecipientSelection::List(ids) => format!("uploaded list ({} entries)", ids.len()),
        }
    }
}

/// Creation request: an already-resolved recipient list plus everything the
/// job record keeps about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBulkJob {
    pub payload: MessagePayload,
    pub sender_id: SenderId,
    pub selection: RecipientSelection,
    pub filter_description: Option<String>,
    pub recipients: Vec<RecipientId>,
}

impl NewBulkJob {
    /// Recipients with duplicates removed, first occurrence wins.
    pub fn unique_recipients(&self) -> Vec<RecipientId> {
        let mut seen = std::collections::HashSet::with_capacity(self.recipients.len());
        self.recipients
            .iter()
            .copied()
            .filter(|r| seen.insert(*r))
            .collect()
    }
}

/// Aggregate root: one bulk send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkJob {
    pub id: JobId,
    pub status: JobStatus,
    /// Run generation, starts at 1 and is bumped by every restart.
    pub run: u32,
    pub recipient_count: u64,
    pub sent_count: u64,
    pub failed_count: u64,
    pub remaining_batches: u64,
    pub payload: MessagePayload,
    pub sender_id: SenderId,
    pub selection: RecipientSelection,
    pub filter_description: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason of the current run, if it failed.
    pub failure_reason: Option<String>,
    pub version: u64,
}

impl BulkJob {
    /// Create a queued job for `recipient_count` recipients split by `batch_size`.
    ///
    /// The caller has already resolved and de-duplicated the recipients.
    pub fn queued(
        id: JobId,
        request: &NewBulkJob,
        recipient_count: u64,
        batch_size: BatchSize,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if recipient_count == 0 {
            return Err(DomainError::invariant("a bulk message needs at least one recipient"));
        }

        let filter_description = request
            .filter_description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| request.selection.describe());

        Ok(Self {
            id,
            status: JobStatus::Queued,
            run: 1,
            recipient_count,
            sent_count: 0,
            failed_count: 0,
            remaining_batches: batch_count(recipient_count as usize, batch_size) as u64,
            payload: request.payload.clone(),
            sender_id: request.sender_id,
            selection: request.selection.clone(),
            filter_description,
            created_at: now,
            completed_at: None,
            failure_reason: None,
            version: 1,
        })
    }

    pub fn processed(&self) -> u64 {
        self.sent_count + self.failed_count
    }

    /// Only terminal jobs may be deleted.
    pub fn ensure_deletable(&self) -> DomainResult<()> {
        if self.status.is_terminal() {
            Ok(())
        } else {
            Err(DomainError::invalid_state(format!(
                "delete requires a finished job, job is {}",
                self.status
            )))
        }
    }
}

impl AggregateRoot for BulkJob {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Commands accepted by the job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobCommand {
    /// A batch of `run` started executing.
    MarkProcessing { run: u32 },
    /// A batch of `run` finished: apply its tallies and count it down.
    RecordBatch {
        run: u32,
        sent: u64,
        failed: u64,
        at: DateTime<Utc>,
    },
    Cancel { at: DateTime<Utc> },
    Stop { at: DateTime<Utc> },
    /// Start a new run against a freshly resolved recipient set.
    Restart {
        recipient_count: u64,
        batch_count: u64,
    },
    /// A batch of `run` gave up; the run cannot complete.
    Fail {
        run: u32,
        reason: String,
        at: DateTime<Utc>,
    },
}

/// Events emitted by the job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEvent {
    ProcessingStarted,
    BatchRecorded {
        sent: u64,
        failed: u64,
        remaining_batches: u64,
    },
    Completed { at: DateTime<Utc> },
    Cancelled { at: DateTime<Utc> },
    Stopped { at: DateTime<Utc> },
    Failed { reason: String, at: DateTime<Utc> },
    Restarted {
        run: u32,
        recipient_count: u64,
        batch_count: u64,
    },
}

impl Aggregate for BulkJob {
    type Command = JobCommand;
    type Event = JobEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            JobEvent::ProcessingStarted => {
                self.status = JobStatus::Processing;
            }
            JobEvent::BatchRecorded {
                sent,
                failed,
                remaining_batches,
            } => {
                self.sent_count += sent;
                self.failed_count += failed;
                self.remaining_batches = *remaining_batches;
            }
            JobEvent::Completed { at } => {
                self.status = JobStatus::Completed;
                self.completed_at = Some(*at);
            }
            JobEvent::Cancelled { at } => {
                self.status = JobStatus::Cancelled;
                self.completed_at = Some(*at);
            }
            JobEvent::Stopped { at } => {
                self.status = JobStatus::Stopped;
                self.completed_at = Some(*at);
            }
            JobEvent::Failed { reason, at } => {
                self.status = JobStatus::Failed;
                self.completed_at = Some(*at);
                self.failure_reason = Some(reason.clone());
            }
            JobEvent::Restarted {
                run,
                recipient_count,
                batch_count,
            } => {
                self.status = JobStatus::Queued;
                self.run = *run;
                self.recipient_count = *recipient_count;
                self.remaining_batches = *batch_count;
                self.sent_count = 0;
                self.failed_count = 0;
                self.completed_at = None;
                self.failure_reason = None;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            JobCommand::MarkProcessing { run } => Ok(self.handle_mark_processing(*run)),
            JobCommand::RecordBatch {
                run,
                sent,
                failed,
                at,
            } => Ok(self.handle_record_batch(*run, *sent, *failed, *at)),
            JobCommand::Cancel { at } => {
                self.require(JobStatus::Queued == self.status, "cancel", "queued")?;
                Ok(vec![JobEvent::Cancelled { at: *at }])
            }
            JobCommand::Stop { at } => {
                self.require(JobStatus::Processing == self.status, "stop", "processing")?;
                Ok(vec![JobEvent::Stopped { at: *at }])
            }
            JobCommand::Restart {
                recipient_count,
                batch_count,
            } => self.handle_restart(*recipient_count, *batch_count),
            JobCommand::Fail { run, reason, at } => {
                // A give-up from an earlier run says nothing about this one.
                if *run != self.run {
                    return Ok(vec![]);
                }
                self.require(!self.status.is_terminal(), "fail", "queued or processing")?;
                Ok(vec![JobEvent::Failed {
                    reason: reason.clone(),
                    at: *at,
                }])
            }
        }
    }
}

impl BulkJob {
    fn require(&self, ok: bool, action: &str, expected: &str) -> DomainResult<()> {
        if ok {
            Ok(())
        } else {
            Err(DomainError::invalid_state(format!(
                "{action} requires a {expected} job, job is {}",
                self.status
            )))
        }
    }

    fn handle_mark_processing(&self, run: u32) -> Vec<JobEvent> {
        if run == self.run && self.status == JobStatus::Queued {
            vec![JobEvent::ProcessingStarted]
        } else {
            vec![]
        }
    }

    fn handle_record_batch(&self, run: u32, sent: u64, failed: u64, at: DateTime<Utc>) -> Vec<JobEvent> {
        // Units of an earlier run must not touch the counters of this one.
        if run != self.run {
            return vec![];
        }

        let mut events = vec![JobEvent::BatchRecorded {
            sent,
            failed,
            remaining_batches: self.remaining_batches.saturating_sub(1),
        }];

        // Only the decrement from 1 to 0 completes, and never over a terminal status.
        if self.remaining_batches == 1 && !self.status.is_terminal() {
            events.push(JobEvent::Completed { at });
        }

        events
    }

    fn handle_restart(&self, recipient_count: u64, batch_count: u64) -> DomainResult<Vec<JobEvent>> {
        self.require(
            matches!(self.status, JobStatus::Failed | JobStatus::Stopped),
            "start",
            "failed or stopped",
        )?;
        if recipient_count == 0 || batch_count == 0 {
            return Err(DomainError::invariant("a restarted run needs at least one recipient"));
        }

        Ok(vec![JobEvent::Restarted {
            run: self.run + 1,
            recipient_count,
            batch_count,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> MessagePayload {
        MessagePayload::new("Maintenance window", "<p>Back at 6pm</p>", BodyFormat::Html).unwrap()
    }

    fn request(recipients: Vec<u64>) -> NewBulkJob {
        NewBulkJob {
            payload: payload(),
            sender_id: SenderId::new(),
            selection: RecipientSelection::All,
            filter_description: None,
            recipients: recipients.into_iter().map(RecipientId::new).collect(),
        }
    }

    fn job_with(recipient_count: u64, batch_size: usize) -> BulkJob {
        let req = request((1..=recipient_count).collect());
        BulkJob::queued(
            JobId::new(),
            &req,
            recipient_count,
            BatchSize::new(batch_size).unwrap(),
            Utc::now(),
        )
        .unwrap()
    }

    fn job_in(status: JobStatus) -> BulkJob {
        let mut job = job_with(120, 50);
        job.status = status;
        job
    }

    fn record(job: &mut BulkJob, sent: u64, failed: u64) -> Vec<JobEvent> {
        let run = job.run;
        job.execute(&JobCommand::RecordBatch {
            run,
            sent,
            failed,
            at: Utc::now(),
        })
        .unwrap()
    }

    #[test]
    fn new_job_is_queued_with_batch_count() {
        let job = job_with(120, 50);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.remaining_batches, 3);
        assert_eq!(job.recipient_count, 120);
        assert_eq!(job.run, 1);
        assert_eq!(job.filter_description, "all active users");
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn new_job_rejects_zero_recipients() {
        let req = request(vec![]);
        let err = BulkJob::queued(JobId::new(), &req, 0, BatchSize::default(), Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn payload_validation() {
        assert!(matches!(
            MessagePayload::new("   ", "body", BodyFormat::Plain),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            MessagePayload::new("s".repeat(256), "body", BodyFormat::Plain),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            MessagePayload::new("Subject", "<p> </p>", BodyFormat::Html),
            Err(DomainError::Validation(_))
        ));
        let ok = MessagePayload::new("  Subject ", "<b>Hi</b>&nbsp;there", BodyFormat::Html).unwrap();
        assert_eq!(ok.subject, "Subject");
        assert_eq!(ok.plain_text(), "Hi there");
    }

    #[test]
    fn plain_text_strips_only_html() {
        assert_eq!(BodyFormat::Html.plain_text("<p>Room <b>4</b></p>"), "Room 4");
        assert_eq!(BodyFormat::Markdown.plain_text("**Room 4**"), "**Room 4**");
        assert_eq!(BodyFormat::Plain.plain_text("a < b"), "a < b");
    }

    #[test]
    fn unique_recipients_keep_first_occurrence_order() {
        let req = request(vec![5, 3, 5, 9, 3, 1]);
        let ids: Vec<u64> = req.unique_recipients().into_iter().map(RecipientId::get).collect();
        assert_eq!(ids, vec![5, 3, 9, 1]);
    }

    #[test]
    fn mark_processing_is_idempotent() {
        let mut job = job_with(10, 5);
        let first = job.execute(&JobCommand::MarkProcessing { run: 1 }).unwrap();
        assert_eq!(first, vec![JobEvent::ProcessingStarted]);
        let second = job.execute(&JobCommand::MarkProcessing { run: 1 }).unwrap();
        assert!(second.is_empty());
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn all_batches_succeed_completes_once() {
        let mut job = job_with(120, 50);
        job.execute(&JobCommand::MarkProcessing { run: 1 }).unwrap();

        assert_eq!(record(&mut job, 50, 0).len(), 1);
        assert_eq!(record(&mut job, 50, 0).len(), 1);
        let last = record(&mut job, 20, 0);

        assert!(matches!(last.last(), Some(JobEvent::Completed { .. })));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.sent_count, 120);
        assert_eq!(job.failed_count, 0);
        assert_eq!(job.remaining_batches, 0);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn duplicate_batch_after_completion_does_not_complete_again() {
        let mut job = job_with(5, 5);
        record(&mut job, 5, 0);
        assert_eq!(job.status, JobStatus::Completed);

        let dup = record(&mut job, 5, 0);
        assert_eq!(dup.len(), 1);
        assert_eq!(job.remaining_batches, 0);
        assert_eq!(job.sent_count, 10);
    }

    #[test]
    fn stopped_job_stays_stopped_when_last_batch_finishes() {
        let mut job = job_with(120, 50);
        job.execute(&JobCommand::MarkProcessing { run: 1 }).unwrap();
        record(&mut job, 50, 0);
        record(&mut job, 49, 1);
        assert_eq!(job.remaining_batches, 1);

        job.execute(&JobCommand::Stop { at: Utc::now() }).unwrap();
        let events = record(&mut job, 20, 0);

        assert_eq!(events.len(), 1);
        assert_eq!(job.status, JobStatus::Stopped);
        assert_eq!(job.remaining_batches, 0);
        assert_eq!(job.sent_count, 119);
    }

    #[test]
    fn stale_run_is_ignored() {
        let mut job = job_in(JobStatus::Stopped);
        job.execute(&JobCommand::Restart {
            recipient_count: 80,
            batch_count: 2,
        })
        .unwrap();
        assert_eq!(job.run, 2);

        let events = job
            .execute(&JobCommand::RecordBatch {
                run: 1,
                sent: 50,
                failed: 0,
                at: Utc::now(),
            })
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(job.remaining_batches, 2);
        assert_eq!(job.sent_count, 0);

        assert!(job.execute(&JobCommand::MarkProcessing { run: 1 }).unwrap().is_empty());
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn restart_resets_counters() {
        let mut job = job_in(JobStatus::Stopped);
        job.sent_count = 70;
        job.failed_count = 3;
        job.completed_at = Some(Utc::now());

        job.execute(&JobCommand::Restart {
            recipient_count: 80,
            batch_count: 2,
        })
        .unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.recipient_count, 80);
        assert_eq!(job.remaining_batches, 2);
        assert_eq!(job.sent_count, 0);
        assert_eq!(job.failed_count, 0);
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn restart_rejects_empty_recipient_set() {
        let job = job_in(JobStatus::Failed);
        let err = job
            .handle(&JobCommand::Restart {
                recipient_count: 0,
                batch_count: 0,
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn lifecycle_actions_only_apply_from_their_precondition() {
        let now = Utc::now();
        for status in JobStatus::ALL {
            let job = job_in(status);

            let cancel = job.handle(&JobCommand::Cancel { at: now });
            assert_eq!(cancel.is_ok(), status == JobStatus::Queued, "cancel from {status}");

            let stop = job.handle(&JobCommand::Stop { at: now });
            assert_eq!(stop.is_ok(), status == JobStatus::Processing, "stop from {status}");

            let start = job.handle(&JobCommand::Restart {
                recipient_count: 10,
                batch_count: 1,
            });
            assert_eq!(
                start.is_ok(),
                matches!(status, JobStatus::Failed | JobStatus::Stopped),
                "start from {status}"
            );

            let delete = job.ensure_deletable();
            assert_eq!(delete.is_ok(), status.is_terminal(), "delete from {status}");

            for err in [cancel.err(), stop.err(), start.err(), delete.err()].into_iter().flatten() {
                assert!(err.is_invalid_state(), "{err:?}");
            }
        }
    }

    #[test]
    fn fail_only_from_active_states() {
        let now = Utc::now();
        for status in JobStatus::ALL {
            let mut job = job_in(status);
            let result = job.execute(&JobCommand::Fail {
                run: job.run,
                reason: "transport unavailable".into(),
                at: now,
            });
            assert_eq!(result.is_ok(), !status.is_terminal(), "fail from {status}");
            if !status.is_terminal() {
                assert_eq!(job.status, JobStatus::Failed);
                assert_eq!(job.failure_reason.as_deref(), Some("transport unavailable"));
            }
        }
    }

    #[test]
    fn fail_from_earlier_run_is_ignored() {
        let mut job = job_with(10, 5);
        job.execute(&JobCommand::MarkProcessing { run: 1 }).unwrap();
        job.execute(&JobCommand::Stop { at: Utc::now() }).unwrap();
        job.execute(&JobCommand::Restart {
            recipient_count: 10,
            batch_count: 2,
        })
        .unwrap();
        assert_eq!(job.run, 2);

        let version = job.version();
        let events = job
            .execute(&JobCommand::Fail {
                run: 1,
                reason: "transport unavailable".into(),
                at: Utc::now(),
            })
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.failure_reason.is_none());
        assert_eq!(job.version(), version);
    }

    #[test]
    fn cancel_sets_completed_at() {
        let mut job = job_with(10, 5);
        let at = Utc::now();
        job.execute(&JobCommand::Cancel { at }).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.completed_at, Some(at));

        // A straggler finishing afterwards leaves the cancellation in place.
        record(&mut job, 5, 0);
        record(&mut job, 5, 0);
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.completed_at, Some(at));
    }

    #[test]
    fn version_increments_per_event() {
        let mut job = job_with(10, 10);
        let v0 = job.version();
        let events = record(&mut job, 10, 0);
        assert_eq!(job.version(), v0 + events.len() as u64);
    }

    #[test]
    fn status_codes_are_stable() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(JobStatus::Stopped.code(), 5);
        assert_eq!(JobStatus::from_code(9), None);
        assert_eq!(BodyFormat::from_code(BodyFormat::Markdown.code()), Some(BodyFormat::Markdown));
    }

    #[test]
    fn selection_serializes_with_kind_tag() {
        let json = serde_json::to_value(RecipientSelection::List(vec![RecipientId::new(4)])).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "list", "value": [4]}));
        let all: RecipientSelection = serde_json::from_value(serde_json::json!({"kind": "all"})).unwrap();
        assert_eq!(all, RecipientSelection::All);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: the final counters do not depend on the order batches finish in.
            #[test]
            fn accounting_is_order_independent(
                tallies in prop::collection::vec((0u64..60, 0u64..60), 1..12),
                seed in any::<u64>(),
            ) {
                let batches = tallies.len();
                let mut forward = job_with(1000, 1000);
                forward.remaining_batches = batches as u64;
                let mut shuffled = forward.clone();

                for (sent, failed) in &tallies {
                    record(&mut forward, *sent, *failed);
                }

                let mut order: Vec<usize> = (0..batches).collect();
                let mut state = seed;
                for i in (1..order.len()).rev() {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    order.swap(i, (state % (i as u64 + 1)) as usize);
                }
                let mut completions = 0;
                for idx in order {
                    let (sent, failed) = tallies[idx];
                    let events = record(&mut shuffled, sent, failed);
                    completions += events.iter().filter(|e| matches!(e, JobEvent::Completed { .. })).count();
                }

                prop_assert_eq!(completions, 1);
                prop_assert_eq!(forward.sent_count, shuffled.sent_count);
                prop_assert_eq!(forward.failed_count, shuffled.failed_count);
                prop_assert_eq!(shuffled.remaining_batches, 0);
                prop_assert_eq!(shuffled.status, JobStatus::Completed);
            }
        }
    }
}
