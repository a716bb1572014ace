//! Bulk job lifecycle engine.
//!
//! ## Components
//!
//! - `LifecycleController`: create, cancel, stop, start, delete
//! - `BatchExecutor`: runs one batch unit and does the completion accounting
//! - `BatchWorker`: pulls units from the task queue and feeds the executor
//! - `ProgressQuery`: read-only status, counters and percentage
//! - `ports`: the recipient resolver and message transport boundaries
//! - `adapters`: in-memory directory and logging transport for development
//!
//! `Engine` wires them together over one job repository and one task queue.

pub mod adapters;
pub mod controller;
pub mod executor;
pub mod ports;
pub mod progress;
pub mod worker;

use std::sync::Arc;

pub use adapters::{DirectoryEntry, InMemoryDirectory, TracingTransport};
pub use controller::{ActionOutcome, CreatedJob, EngineError, LifecycleController};
pub use executor::{BatchExecutor, BatchOutcome, ExecuteError};
pub use ports::{
    MessageTransport, OutboundMessage, RecipientResolver, ResolveError, TransportError,
};
pub use progress::ProgressQuery;
pub use worker::{BatchWorker, TaskResult, WorkerConfig, WorkerHandle, WorkerStats};

use crate::config::EngineConfig;
use crate::job_store::JobRepository;
use crate::queue::TaskQueue;

/// The engine's components, sharing one repository and one queue.
#[derive(Clone)]
pub struct Engine {
    pub controller: Arc<LifecycleController>,
    pub progress: Arc<ProgressQuery>,
    pub executor: Arc<BatchExecutor>,
    pub jobs: Arc<dyn JobRepository>,
    pub queue: Arc<dyn TaskQueue>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        queue: Arc<dyn TaskQueue>,
        resolver: Arc<dyn RecipientResolver>,
        transport: Arc<dyn MessageTransport>,
        config: EngineConfig,
    ) -> Self {
        let controller = Arc::new(LifecycleController::new(
            jobs.clone(),
            queue.clone(),
            resolver,
            config.clone(),
        ));
        let progress = Arc::new(ProgressQuery::new(jobs.clone()));
        let executor = Arc::new(BatchExecutor::new(jobs.clone(), transport));

        Self {
            controller,
            progress,
            executor,
            jobs,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn worker(&self) -> BatchWorker {
        BatchWorker::new(self.queue.clone(), self.jobs.clone(), self.executor.clone())
    }

    /// Start the worker pool sized by the engine configuration.
    pub fn spawn_workers(&self) -> WorkerHandle {
        let config = WorkerConfig::default()
            .with_max_concurrent(self.config.workers)
            .with_poll_interval(self.config.poll_interval);
        self.worker().spawn(config)
    }
}
