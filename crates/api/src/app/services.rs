use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

use bulkmsg_infra::{
    engine::{InMemoryDirectory, TracingTransport},
    job_store::{InMemoryJobRepository, JobRepository, JobStoreError, PostgresJobRepository},
    queue::InMemoryTaskQueue,
    Engine, EngineConfig,
};

/// Size of the development directory when no other directory is wired in.
pub const SEEDED_DIRECTORY_SIZE: u64 = 250;

const MAX_DB_CONNECTIONS: u32 = 10;

/// Everything the handlers need.
///
/// The directory is kept alongside the engine so development setups can
/// suspend or add recipients at runtime.
#[derive(Clone)]
pub struct AppServices {
    pub engine: Engine,
    pub directory: Arc<InMemoryDirectory>,
}

impl AppServices {
    /// In-memory job records.
    pub fn in_memory(directory: Arc<InMemoryDirectory>, config: EngineConfig) -> Self {
        Self::with_jobs(Arc::new(InMemoryJobRepository::new()), directory, config)
    }

    /// Postgres-backed job records; the schema is created when missing.
    pub async fn persistent(
        database_url: &str,
        directory: Arc<InMemoryDirectory>,
        config: EngineConfig,
    ) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_DB_CONNECTIONS)
            .connect(database_url)
            .await
            .map_err(|e| JobStoreError::Storage(format!("failed to connect: {e}")))?;

        let repo = PostgresJobRepository::new(pool);
        repo.ensure_schema().await?;

        let services = Self::with_jobs(Arc::new(repo), directory, config);
        services.warn_unfinished_jobs().await?;
        Ok(services)
    }

    /// The task queue does not survive a restart, so a job left Queued or
    /// Processing by a previous process has no batches behind it. It stays
    /// that way until an operator stops or cancels it.
    pub async fn warn_unfinished_jobs(&self) -> Result<usize, JobStoreError> {
        let unfinished = self.engine.progress.unfinished().await?;
        for job in &unfinished {
            tracing::warn!(
                job_id = %job.id,
                status = %job.status,
                remaining_batches = job.remaining_batches,
                "job has no queued batches after restart; stop or cancel it"
            );
        }
        Ok(unfinished.len())
    }

    fn with_jobs(
        jobs: Arc<dyn JobRepository>,
        directory: Arc<InMemoryDirectory>,
        config: EngineConfig,
    ) -> Self {
        let queue = InMemoryTaskQueue::arc();
        let transport = Arc::new(TracingTransport::new(directory.clone()));
        let engine = Engine::new(jobs, queue, directory.clone(), transport, config);
        Self { engine, directory }
    }
}

/// Pick the job store from the environment: Postgres when `DATABASE_URL`
/// is set, in-memory otherwise.
pub async fn build_services(config: EngineConfig) -> Result<AppServices, JobStoreError> {
    let directory = Arc::new(InMemoryDirectory::seeded(SEEDED_DIRECTORY_SIZE));

    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => {
            tracing::info!("using postgres job store");
            AppServices::persistent(&url, directory, config).await
        }
        _ => {
            tracing::warn!("DATABASE_URL not set; job records are kept in memory");
            Ok(AppServices::in_memory(directory, config))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkmsg_core::SenderId;
    use bulkmsg_messaging::{BodyFormat, MessagePayload, RecipientSelection};

    #[tokio::test]
    async fn counts_jobs_left_without_batches() {
        let services = AppServices::in_memory(Arc::new(InMemoryDirectory::seeded(3)), EngineConfig::default());
        assert_eq!(services.warn_unfinished_jobs().await.unwrap(), 0);

        let payload = MessagePayload::new("Notice", "Body", BodyFormat::Plain).unwrap();
        let created = services
            .engine
            .controller
            .create_for_selection(payload, SenderId::new(), RecipientSelection::All, None)
            .await
            .unwrap();
        assert_eq!(services.warn_unfinished_jobs().await.unwrap(), 1);

        services.engine.controller.cancel(created.job_id).await.unwrap();
        assert_eq!(services.warn_unfinished_jobs().await.unwrap(), 0);
    }
}
