//! Worker pool pulling batch units from the task queue.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bulkmsg_messaging::JobCommand;

use crate::job_store::JobRepository;
use crate::queue::{FailureDisposition, Task, TaskQueue};

use super::executor::{BatchExecutor, BatchOutcome};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll for new tasks when idle
    pub poll_interval: Duration,
    /// Number of worker loops
    pub max_concurrent: usize,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_concurrent: 4,
            name: "batch-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running worker pool.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for in-flight tasks to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "batch worker panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }
}

/// Runs the batch executor for every claimed task.
///
/// Success completes the task. An infrastructure error goes back to the
/// queue for a retry; when retries are exhausted the job is failed.
pub struct BatchWorker {
    queue: Arc<dyn TaskQueue>,
    jobs: Arc<dyn JobRepository>,
    executor: Arc<BatchExecutor>,
}

impl BatchWorker {
    pub fn new(queue: Arc<dyn TaskQueue>, jobs: Arc<dyn JobRepository>, executor: Arc<BatchExecutor>) -> Self {
        Self {
            queue,
            jobs,
            executor,
        }
    }

    /// Spawn `max_concurrent` worker loops on the current tokio runtime.
    pub fn spawn(self, config: WorkerConfig) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let worker = Arc::new(self);
        let started = Instant::now();

        let joins = (0..config.max_concurrent.max(1))
            .map(|slot| {
                let worker = worker.clone();
                let config = config.clone();
                let shutdown = shutdown_rx.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    worker.run_loop(slot, config, shutdown, stats, started).await;
                })
            })
            .collect();

        info!(worker = %config.name, loops = config.max_concurrent.max(1), "batch worker started");

        WorkerHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
        }
    }

    async fn run_loop(
        &self,
        slot: usize,
        config: WorkerConfig,
        mut shutdown: watch::Receiver<bool>,
        stats: Arc<Mutex<WorkerStats>>,
        started: Instant,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            lock(&stats).uptime_secs = started.elapsed().as_secs();

            match self.queue.claim_next() {
                Ok(Some(task)) => {
                    debug!(worker = %config.name, slot, task_id = %task.id, job_id = %task.job_id(), "claimed task");
                    lock(&stats).current_running += 1;
                    let result = self.run_task(&task).await;
                    let mut s = lock(&stats);
                    s.current_running = s.current_running.saturating_sub(1);
                    s.tasks_processed += 1;
                    match result {
                        TaskResult::Succeeded => s.tasks_succeeded += 1,
                        TaskResult::Retrying => s.tasks_retried += 1,
                        TaskResult::DeadLettered => s.tasks_dead_lettered += 1,
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(config.poll_interval) => {}
                        changed = shutdown.changed() => {
                            // Handle dropped without an explicit shutdown.
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(worker = %config.name, error = %e, "failed to claim task");
                    tokio::time::sleep(config.poll_interval).await;
                }
            }
        }

        debug!(worker = %config.name, slot, "batch worker loop stopped");
    }

    /// Execute one claimed task and settle it with the queue.
    pub async fn run_task(&self, task: &Task) -> TaskResult {
        let started_at = Utc::now();

        match self.executor.execute(&task.unit).await {
            Ok(outcome) => {
                if let BatchOutcome::Delivered { sent, failed, .. } = &outcome {
                    debug!(task_id = %task.id, sent, failed, "batch delivered");
                }
                if let Err(e) = self.queue.complete(task.id, started_at) {
                    error!(task_id = %task.id, error = %e, "failed to complete task");
                }
                TaskResult::Succeeded
            }
            Err(exec_err) => {
                match self.queue.record_failure(task.id, exec_err.to_string(), started_at) {
                    Ok(FailureDisposition::Retrying { attempt, next_attempt_at }) => {
                        warn!(task_id = %task.id, attempt, ?next_attempt_at, error = %exec_err, "batch will be retried");
                        TaskResult::Retrying
                    }
                    Ok(FailureDisposition::DeadLettered(entry)) => {
                        warn!(task_id = %task.id, job_id = %task.job_id(), reason = %entry.reason, "batch dead-lettered");
                        self.fail_job(task, &entry.reason).await;
                        TaskResult::DeadLettered
                    }
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "failed to record task failure");
                        TaskResult::Retrying
                    }
                }
            }
        }
    }

    async fn fail_job(&self, task: &Task, reason: &str) {
        let command = JobCommand::Fail {
            run: task.unit.run,
            reason: format!("batch {} exhausted retries: {reason}", task.unit.index),
            at: Utc::now(),
        };
        match self.jobs.execute(task.job_id(), command).await {
            Ok(Some(executed)) if !executed.events.is_empty() => {
                info!(job_id = %task.job_id(), run = task.unit.run, "bulk message failed");
                // The run cannot complete any more.
                if let Err(e) = self.queue.purge_pending(task.job_id()) {
                    error!(job_id = %task.job_id(), error = %e, "failed to purge after failure");
                }
            }
            Ok(Some(_)) => {
                debug!(job_id = %task.job_id(), run = task.unit.run, "dead letter from an earlier run, job left as is");
            }
            Ok(None) => {}
            Err(e) if e.is_no_matching_state() => {
                debug!(job_id = %task.job_id(), "job already finished, not failing it");
            }
            Err(e) => error!(job_id = %task.job_id(), error = %e, "failed to mark job failed"),
        }
    }
}

/// How a task attempt ended from the queue's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded,
    Retrying,
    DeadLettered,
}

fn lock(stats: &Mutex<WorkerStats>) -> std::sync::MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
