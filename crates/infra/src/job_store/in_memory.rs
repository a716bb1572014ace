use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use bulkmsg_core::{Aggregate, JobId};
use bulkmsg_messaging::{BulkJob, JobCommand};

use super::r#trait::{Executed, JobPage, JobRepository, JobStoreError, PageRequest};

/// In-memory job repository for tests/dev.
///
/// A single write lock spans the whole handle-and-apply step of `execute`,
/// which is what makes each record mutation atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, BulkJob>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, BulkJob>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job repository lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, BulkJob>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job repository lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, job: &BulkJob) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<BulkJob>, JobStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn execute(
        &self,
        id: JobId,
        command: JobCommand,
    ) -> Result<Option<Executed>, JobStoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        let events = job.execute(&command)?;
        Ok(Some(Executed {
            events,
            job: job.clone(),
        }))
    }

    async fn delete_terminal(&self, id: JobId) -> Result<Option<BulkJob>, JobStoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get(&id) else {
            return Ok(None);
        };
        job.ensure_deletable()?;
        Ok(jobs.remove(&id))
    }

    async fn list(&self, page: PageRequest) -> Result<JobPage, JobStoreError> {
        let jobs = self.read()?;
        let mut all: Vec<&BulkJob> = jobs.values().collect();
        // JobId is UUIDv7, so it breaks created_at ties in creation order.
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let items = all
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.per_page as usize)
            .cloned()
            .collect();

        Ok(JobPage {
            items,
            total: jobs.len() as u64,
            page: page.page,
            per_page: page.per_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use super::*;
    use bulkmsg_core::{DomainError, RecipientId, SenderId};
    use bulkmsg_messaging::{
        BatchSize, BodyFormat, JobStatus, MessagePayload, NewBulkJob, RecipientSelection,
    };

    fn job(recipients: u64, batch_size: usize) -> BulkJob {
        let request = NewBulkJob {
            payload: MessagePayload::new("Subject", "Body", BodyFormat::Plain).unwrap(),
            sender_id: SenderId::new(),
            selection: RecipientSelection::All,
            filter_description: None,
            recipients: (1..=recipients).map(RecipientId::new).collect(),
        };
        BulkJob::queued(
            JobId::new(),
            &request,
            recipients,
            BatchSize::new(batch_size).unwrap(),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn insert_load_and_reject_duplicates() {
        let repo = InMemoryJobRepository::new();
        let job = job(10, 5);
        repo.insert(&job).await.unwrap();

        assert_eq!(repo.load(job.id).await.unwrap(), Some(job.clone()));
        assert_eq!(
            repo.insert(&job).await,
            Err(JobStoreError::AlreadyExists(job.id))
        );
        assert_eq!(repo.load(JobId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn execute_missing_record_is_none() {
        let repo = InMemoryJobRepository::new();
        let result = repo
            .execute(JobId::new(), JobCommand::MarkProcessing { run: 1 })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn rejected_commands_leave_record_untouched() {
        let repo = InMemoryJobRepository::new();
        let job = job(10, 5);
        repo.insert(&job).await.unwrap();

        let err = repo
            .execute(job.id, JobCommand::Stop { at: Utc::now() })
            .await
            .unwrap_err();
        assert!(err.is_no_matching_state());
        assert_eq!(repo.load(job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn delete_only_terminal_records() {
        let repo = InMemoryJobRepository::new();
        let job = job(10, 5);
        repo.insert(&job).await.unwrap();

        let err = repo.delete_terminal(job.id).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Rejected(DomainError::InvalidState(_))));

        repo.execute(job.id, JobCommand::Cancel { at: Utc::now() })
            .await
            .unwrap();
        let deleted = repo.delete_terminal(job.id).await.unwrap().unwrap();
        assert_eq!(deleted.status, JobStatus::Cancelled);
        assert!(repo.load(job.id).await.unwrap().is_none());
        assert!(repo.delete_terminal(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_newest_first_and_paginated() {
        let repo = InMemoryJobRepository::new();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..25 {
            let mut j = job(1, 1);
            j.created_at = base + Duration::seconds(i);
            ids.push(j.id);
            repo.insert(&j).await.unwrap();
        }

        let first = repo.list(PageRequest::default()).await.unwrap();
        assert_eq!(first.total, 25);
        assert_eq!(first.items.len(), 20);
        assert_eq!(first.items[0].id, ids[24]);

        let second = repo.list(PageRequest::new(1, 20)).await.unwrap();
        assert_eq!(second.items.len(), 5);
        assert_eq!(second.items[4].id, ids[0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_batches_complete_exactly_once() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let job = job(200, 1);
        repo.insert(&job).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..200 {
            let repo = repo.clone();
            let id = job.id;
            handles.push(tokio::spawn(async move {
                repo.execute(
                    id,
                    JobCommand::RecordBatch {
                        run: 1,
                        sent: 1,
                        failed: 0,
                        at: Utc::now(),
                    },
                )
                .await
                .unwrap()
                .unwrap()
                .completed()
            }));
        }

        let mut completions = 0;
        for h in handles {
            if h.await.unwrap() {
                completions += 1;
            }
        }

        let stored = repo.load(job.id).await.unwrap().unwrap();
        assert_eq!(completions, 1);
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.sent_count, 200);
        assert_eq!(stored.remaining_batches, 0);
    }
}
