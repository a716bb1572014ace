//! Read-only views of job records for status displays.

use std::sync::Arc;

use tracing::instrument;

use bulkmsg_core::JobId;
use bulkmsg_messaging::{BulkJob, ProgressSnapshot};

use crate::job_store::{JobPage, JobRepository, JobStoreError, MAX_PAGE_SIZE, PageRequest};

pub struct ProgressQuery {
    jobs: Arc<dyn JobRepository>,
}

impl ProgressQuery {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self { jobs }
    }

    /// Counters, status and percentage from one consistent read of the record.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn progress(&self, id: JobId) -> Result<Option<ProgressSnapshot>, JobStoreError> {
        Ok(self.jobs.load(id).await?.as_ref().map(ProgressSnapshot::of))
    }

    pub async fn detail(&self, id: JobId) -> Result<Option<BulkJob>, JobStoreError> {
        self.jobs.load(id).await
    }

    pub async fn history(&self, page: PageRequest) -> Result<JobPage, JobStoreError> {
        self.jobs.list(page).await
    }

    /// Every job that is still Queued or Processing, newest first.
    ///
    /// Batch units live only in the task queue, so after a process restart
    /// these jobs have nothing left to run them.
    pub async fn unfinished(&self) -> Result<Vec<BulkJob>, JobStoreError> {
        let mut unfinished = Vec::new();
        let mut page = PageRequest::new(0, MAX_PAGE_SIZE);
        loop {
            let listed = self.jobs.list(page).await?;
            let returned = listed.items.len() as u64;
            unfinished.extend(listed.items.into_iter().filter(|j| !j.status.is_terminal()));
            if returned == 0 || page.offset() + returned >= listed.total {
                break;
            }
            page.page += 1;
        }
        Ok(unfinished)
    }
}
