//! Task queue implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use bulkmsg_core::JobId;

use super::types::{DeadLetterEntry, Task, TaskId, TaskStatus};

/// At-least-once task substrate for batch units.
///
/// Claimed tasks may be retried after an infrastructure failure, and claims
/// are FIFO by enqueue time among ready tasks, so units of one job can still
/// run concurrently and finish in any order.
pub trait TaskQueue: Send + Sync {
    /// Enqueue a new task.
    fn enqueue(&self, task: Task) -> Result<TaskId, TaskQueueError>;

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskQueueError>;

    /// Claim the oldest ready task (pending or retry-waiting) and mark it running.
    fn claim_next(&self) -> Result<Option<Task>, TaskQueueError>;

    /// Mark a running task as done and drop it from the active set.
    fn complete(&self, task_id: TaskId, started_at: DateTime<Utc>) -> Result<(), TaskQueueError>;

    /// Record a failed attempt: schedule a retry or move the task to the dead-letter queue.
    fn record_failure(
        &self,
        task_id: TaskId,
        error: String,
        started_at: DateTime<Utc>,
    ) -> Result<FailureDisposition, TaskQueueError>;

    /// Remove every not-yet-started task of `job_id`, including retry-waiting ones.
    ///
    /// Running tasks are left alone. Returns how many tasks were removed.
    fn purge_pending(&self, job_id: JobId) -> Result<usize, TaskQueueError>;

    /// Number of tasks of `job_id` still waiting to run.
    fn pending_for(&self, job_id: JobId) -> Result<usize, TaskQueueError>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskQueueError>;

    fn stats(&self) -> Result<QueueStats, TaskQueueError>;
}

/// What happened to a task after a failed attempt.
#[derive(Debug, Clone)]
pub enum FailureDisposition {
    /// Will run again no earlier than `next_attempt_at`.
    Retrying {
        attempt: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    },
    /// Retries exhausted.
    DeadLettered(DeadLetterEntry),
}

/// Task queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskQueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub dead_lettered: usize,
    pub purged: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: HashMap<TaskId, Task>,
    dead_letters: HashMap<TaskId, DeadLetterEntry>,
    completed: usize,
    purged: usize,
}

/// In-memory task queue.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    state: RwLock<QueueState>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, QueueState>, TaskQueueError> {
        self.state
            .read()
            .map_err(|_| TaskQueueError::Storage("task queue lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, QueueState>, TaskQueueError> {
        self.state
            .write()
            .map_err(|_| TaskQueueError::Storage("task queue lock poisoned".to_string()))
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn enqueue(&self, task: Task) -> Result<TaskId, TaskQueueError> {
        let mut state = self.write()?;
        if state.tasks.contains_key(&task.id) {
            return Err(TaskQueueError::AlreadyExists(task.id));
        }
        let id = task.id;
        state.tasks.insert(id, task);
        Ok(id)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskQueueError> {
        let state = self.read()?;
        Ok(state.tasks.get(&task_id).cloned())
    }

    fn claim_next(&self) -> Result<Option<Task>, TaskQueueError> {
        let mut state = self.write()?;
        let now = Utc::now();

        let next = state
            .tasks
            .values()
            .filter(|t| t.status.is_waiting() && t.is_ready(now))
            .min_by_key(|t| (t.created_at, t.id.0))
            .map(|t| t.id);

        Ok(next.and_then(|id| {
            state.tasks.get_mut(&id).map(|task| {
                task.mark_running();
                task.clone()
            })
        }))
    }

    fn complete(&self, task_id: TaskId, started_at: DateTime<Utc>) -> Result<(), TaskQueueError> {
        let mut state = self.write()?;
        let mut task = state
            .tasks
            .remove(&task_id)
            .ok_or(TaskQueueError::NotFound(task_id))?;
        task.mark_completed(started_at);
        state.completed += 1;
        Ok(())
    }

    fn record_failure(
        &self,
        task_id: TaskId,
        error: String,
        started_at: DateTime<Utc>,
    ) -> Result<FailureDisposition, TaskQueueError> {
        let mut state = self.write()?;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskQueueError::NotFound(task_id))?;
        task.mark_failed(error.clone(), started_at);

        if !matches!(task.status, TaskStatus::DeadLettered { .. }) {
            return Ok(FailureDisposition::Retrying {
                attempt: task.attempt,
                next_attempt_at: task.scheduled_at,
            });
        }

        let task = state
            .tasks
            .remove(&task_id)
            .ok_or(TaskQueueError::NotFound(task_id))?;
        let entry = DeadLetterEntry::new(task, error);
        state.dead_letters.insert(task_id, entry.clone());
        Ok(FailureDisposition::DeadLettered(entry))
    }

    fn purge_pending(&self, job_id: JobId) -> Result<usize, TaskQueueError> {
        let mut state = self.write()?;
        let before = state.tasks.len();
        state
            .tasks
            .retain(|_, t| !(t.job_id() == job_id && t.status.is_waiting()));
        let removed = before - state.tasks.len();
        state.purged += removed;
        Ok(removed)
    }

    fn pending_for(&self, job_id: JobId) -> Result<usize, TaskQueueError> {
        let state = self.read()?;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.job_id() == job_id && t.status.is_waiting())
            .count())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskQueueError> {
        let state = self.read()?;
        let mut result: Vec<_> = state.dead_letters.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self) -> Result<QueueStats, TaskQueueError> {
        let state = self.read()?;
        let mut stats = QueueStats {
            completed: state.completed,
            dead_lettered: state.dead_letters.len(),
            purged: state.purged,
            ..QueueStats::default()
        };

        for task in state.tasks.values() {
            match &task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Failed { .. } => stats.retrying += 1,
                TaskStatus::Completed | TaskStatus::DeadLettered { .. } => {}
            }
        }

        Ok(stats)
    }
}

impl<Q: TaskQueue + ?Sized> TaskQueue for Arc<Q> {
    fn enqueue(&self, task: Task) -> Result<TaskId, TaskQueueError> {
        (**self).enqueue(task)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskQueueError> {
        (**self).get(task_id)
    }

    fn claim_next(&self) -> Result<Option<Task>, TaskQueueError> {
        (**self).claim_next()
    }

    fn complete(&self, task_id: TaskId, started_at: DateTime<Utc>) -> Result<(), TaskQueueError> {
        (**self).complete(task_id, started_at)
    }

    fn record_failure(
        &self,
        task_id: TaskId,
        error: String,
        started_at: DateTime<Utc>,
    ) -> Result<FailureDisposition, TaskQueueError> {
        (**self).record_failure(task_id, error, started_at)
    }

    fn purge_pending(&self, job_id: JobId) -> Result<usize, TaskQueueError> {
        (**self).purge_pending(job_id)
    }

    fn pending_for(&self, job_id: JobId) -> Result<usize, TaskQueueError> {
        (**self).pending_for(job_id)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskQueueError> {
        (**self).list_dead_letters(limit)
    }

    fn stats(&self) -> Result<QueueStats, TaskQueueError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::queue::types::RetryPolicy;
    use bulkmsg_core::{RecipientId, SenderId};
    use bulkmsg_messaging::{BatchUnit, BodyFormat, MessagePayload};

    fn task_for(job_id: JobId, index: u32) -> Task {
        Task::new(BatchUnit {
            job_id,
            run: 1,
            index,
            recipient_ids: vec![RecipientId::new(index as u64 + 1)],
            payload: MessagePayload::new("Subject", "Body", BodyFormat::Plain).unwrap(),
            sender_id: SenderId::new(),
        })
    }

    #[test]
    fn enqueue_and_claim() {
        let queue = InMemoryTaskQueue::new();
        let job = JobId::new();

        let task_id = queue.enqueue(task_for(job, 0)).unwrap();

        let claimed = queue.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, task_id);
        assert!(matches!(claimed.status, TaskStatus::Running));
        assert_eq!(claimed.attempt, 1);

        assert!(queue.claim_next().unwrap().is_none());
    }

    #[test]
    fn claims_are_fifo() {
        let queue = InMemoryTaskQueue::new();
        let job = JobId::new();
        let first = queue.enqueue(task_for(job, 0)).unwrap();
        let second = queue.enqueue(task_for(job, 1)).unwrap();

        assert_eq!(queue.claim_next().unwrap().unwrap().id, first);
        assert_eq!(queue.claim_next().unwrap().unwrap().id, second);
    }

    #[test]
    fn purge_leaves_running_and_other_jobs() {
        let queue = InMemoryTaskQueue::new();
        let job = JobId::new();
        let other = JobId::new();

        for i in 0..3 {
            queue.enqueue(task_for(job, i)).unwrap();
        }
        queue.enqueue(task_for(other, 0)).unwrap();

        let running = queue.claim_next().unwrap().unwrap();
        assert_eq!(running.job_id(), job);

        assert_eq!(queue.purge_pending(job).unwrap(), 2);
        assert_eq!(queue.pending_for(job).unwrap(), 0);
        assert_eq!(queue.pending_for(other).unwrap(), 1);
        assert!(queue.get(running.id).unwrap().is_some());

        queue.complete(running.id, Utc::now()).unwrap();
        let stats = queue.stats().unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.purged, 2);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn purge_removes_retry_waiting_tasks() {
        let queue = InMemoryTaskQueue::new();
        let job = JobId::new();
        queue
            .enqueue(task_for(job, 0).with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(60))))
            .unwrap();

        let claimed = queue.claim_next().unwrap().unwrap();
        let disposition = queue
            .record_failure(claimed.id, "transport unavailable".into(), Utc::now())
            .unwrap();
        assert!(matches!(disposition, FailureDisposition::Retrying { attempt: 1, .. }));

        // Backoff has not elapsed yet.
        assert!(queue.claim_next().unwrap().is_none());
        assert_eq!(queue.stats().unwrap().retrying, 1);

        assert_eq!(queue.purge_pending(job).unwrap(), 1);
        assert!(queue.get(claimed.id).unwrap().is_none());
    }

    #[test]
    fn dead_letter_flow() {
        let queue = InMemoryTaskQueue::new();
        let job = JobId::new();
        let task_id = queue
            .enqueue(task_for(job, 0).with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO)))
            .unwrap();

        let claimed = queue.claim_next().unwrap().unwrap();
        queue
            .record_failure(claimed.id, "error 1".into(), Utc::now())
            .unwrap();

        let claimed = queue.claim_next().unwrap().unwrap();
        assert_eq!(claimed.attempt, 2);
        let disposition = queue
            .record_failure(claimed.id, "error 2".into(), Utc::now())
            .unwrap();

        match disposition {
            FailureDisposition::DeadLettered(entry) => {
                assert_eq!(entry.task.id, task_id);
                assert_eq!(entry.reason, "error 2");
            }
            other => panic!("expected dead letter, got {other:?}"),
        }

        assert!(queue.get(task_id).unwrap().is_none());
        let dls = queue.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].task.job_id(), job);
        assert_eq!(queue.stats().unwrap().dead_lettered, 1);
    }

    #[test]
    fn completing_unknown_task_is_an_error() {
        let queue = InMemoryTaskQueue::new();
        let missing = TaskId::new();
        assert!(matches!(
            queue.complete(missing, Utc::now()),
            Err(TaskQueueError::NotFound(id)) if id == missing
        ));
    }
}
