use crate::error::{CrawlError, ErrorKind};
use crate::models::{CrawlJob, EnqueueOutcome, JobPriority, JobState, QueueHealth};
use crate::services::elasticsearch_service::JOBS_INDEX;
use async_trait::async_trait;
use elasticsearch::{Elasticsearch, IndexParts, SearchParts};
use log::{error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Durable backing store for the job queue. Every state transition is
/// written through so the queue survives process restarts.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: &CrawlJob) -> Result<(), CrawlError>;
    async fn load_all(&self) -> Result<Vec<CrawlJob>, CrawlError>;
}

pub struct EsJobStore {
    es_client: Elasticsearch,
}

impl EsJobStore {
    pub fn new(es_client: Elasticsearch) -> Self {
        EsJobStore { es_client }
    }
}

#[async_trait]
impl JobStore for EsJobStore {
    async fn save(&self, job: &CrawlJob) -> Result<(), CrawlError> {
        let response = self
            .es_client
            .index(IndexParts::IndexId(JOBS_INDEX, &job.id))
            .body(json!(job))
            .send()
            .await
            .map_err(|e| CrawlError::IndexWrite(format!("save job {}: {e}", job.id)))?;

        if !response.status_code().is_success() {
            return Err(CrawlError::IndexWrite(format!(
                "save job {} failed with status {}",
                job.id,
                response.status_code()
            )));
        }
        Ok(())
    }

    /// Pages through the whole jobs index with `search_after` so restores
    /// stay complete once the retained history outgrows a single response.
    async fn load_all(&self) -> Result<Vec<CrawlJob>, CrawlError> {
        let mut jobs = Vec::new();
        let mut after: Option<Value> = None;

        loop {
            let response = self
                .es_client
                .search(SearchParts::Index(&[JOBS_INDEX]))
                .body(restore_page_body(after.as_ref()))
                .send()
                .await
                .map_err(|e| CrawlError::IndexWrite(format!("load jobs: {e}")))?;

            if !response.status_code().is_success() {
                return Err(CrawlError::IndexWrite(format!(
                    "load jobs failed with status {}",
                    response.status_code()
                )));
            }

            let body: Value = response
                .json()
                .await
                .map_err(|e| CrawlError::IndexWrite(format!("load jobs body: {e}")))?;

            let Some(hits) = body["hits"]["hits"].as_array() else {
                break;
            };
            for hit in hits {
                match serde_json::from_value::<CrawlJob>(hit["_source"].clone()) {
                    Ok(job) => jobs.push(job),
                    Err(e) => warn!("Skipping malformed job record: {e}"),
                }
            }
            if hits.len() < RESTORE_PAGE_SIZE {
                break;
            }
            match hits.last().map(|h| h["sort"].clone()) {
                Some(sort) if !sort.is_null() => after = Some(sort),
                _ => break,
            }
        }
        Ok(jobs)
    }
}

const RESTORE_PAGE_SIZE: usize = 1000;

fn restore_page_body(after: Option<&Value>) -> Value {
    let mut body = json!({
        "size": RESTORE_PAGE_SIZE,
        "query": { "match_all": {} },
        "sort": [
            { "created_at": "asc" },
            { "id": "asc" }
        ]
    });
    if let Some(after) = after {
        body["search_after"] = after.clone();
    }
    body
}

/// Exponential per-job retry backoff, capped at `cap`.
pub fn retry_backoff(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(cap)
}

/// In-memory view of the durable job queue. Mutations go through the state
/// machine methods below, which write through to the `JobStore`.
pub struct CrawlQueue {
    jobs: Mutex<HashMap<String, CrawlJob>>,
    store: Arc<dyn JobStore>,
}

impl CrawlQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        CrawlQueue {
            jobs: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Load persisted jobs and run the crash-recovery pass: any job found
    /// InFlight from a previous run goes back to Pending before dispatch
    /// resumes.
    pub async fn restore(&self) -> Result<usize, CrawlError> {
        let loaded = self.store.load_all().await?;
        let mut recovered = Vec::new();
        {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.clear();
            for mut job in loaded {
                if job.state == JobState::InFlight {
                    warn!(
                        "Recovering job {} (video {}) left in-flight by a previous run",
                        job.id, job.video_id
                    );
                    job.state = JobState::Pending;
                    recovered.push(job.clone());
                }
                jobs.insert(job.id.clone(), job);
            }
        }
        for job in &recovered {
            self.persist(job).await;
        }
        let size = self.jobs.lock().unwrap().len();
        info!("Restored {size} jobs from the queue index ({} recovered)", recovered.len());
        Ok(size)
    }

    async fn persist(&self, job: &CrawlJob) {
        if let Err(e) = self.store.save(job).await {
            error!("Failed to persist job {}: {e}", job.id);
        }
    }

    /// Create a job for the video unless a non-terminal one already exists,
    /// in which case that job is returned unchanged.
    pub async fn enqueue(&self, video_id: &str, priority: JobPriority) -> EnqueueOutcome {
        let (job, created) = {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(existing) = jobs
                .values()
                .find(|j| j.video_id == video_id && !j.state.is_terminal())
            {
                (existing.clone(), false)
            } else {
                let job = CrawlJob::new(video_id, priority);
                jobs.insert(job.id.clone(), job.clone());
                (job, true)
            }
        };
        if created {
            info!("Enqueued crawl job {} for video {video_id}", job.id);
            self.persist(&job).await;
        }
        EnqueueOutcome { job, created }
    }

    /// Jobs eligible for dispatch: Pending or Retrying with next_run in the
    /// past, oldest eligibility first.
    pub fn due_jobs(&self, now: i64) -> Vec<CrawlJob> {
        let jobs = self.jobs.lock().unwrap();
        let mut due: Vec<CrawlJob> = jobs
            .values()
            .filter(|j| {
                matches!(j.state, JobState::Pending | JobState::Retrying) && j.next_run <= now
            })
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_run);
        due
    }

    /// Move a dispatchable job to InFlight. Fails if the job is gone, is not
    /// dispatchable, or another job for the same video is already InFlight.
    pub async fn mark_in_flight(&self, job_id: &str) -> Option<CrawlJob> {
        let job = {
            let mut jobs = self.jobs.lock().unwrap();
            let dup_in_flight = jobs.values().any(|j| {
                j.state == JobState::InFlight
                    && jobs.get(job_id).is_some_and(|t| t.video_id == j.video_id)
            });
            if dup_in_flight {
                warn!("Refusing dispatch of {job_id}: video already has an in-flight job");
                return None;
            }
            let job = jobs.get_mut(job_id)?;
            if !matches!(job.state, JobState::Pending | JobState::Retrying) {
                return None;
            }
            job.state = JobState::InFlight;
            job.clone()
        };
        self.persist(&job).await;
        Some(job)
    }

    pub async fn mark_succeeded(&self, job_id: &str) {
        self.finish(job_id, JobState::Succeeded, None).await;
    }

    pub async fn mark_succeeded_empty(&self, job_id: &str) {
        self.finish(job_id, JobState::SucceededEmpty, None).await;
    }

    pub async fn mark_failed(&self, job_id: &str, kind: ErrorKind) {
        self.finish(job_id, JobState::Failed, Some(kind)).await;
    }

    async fn finish(&self, job_id: &str, state: JobState, kind: Option<ErrorKind>) {
        let job = {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            if job.state != JobState::InFlight {
                warn!("Ignoring {state:?} for job {job_id} in state {:?}", job.state);
                return;
            }
            job.state = state;
            job.finished_at = Some(chrono::Utc::now().timestamp());
            job.last_error = kind.or(job.last_error);
            job.clone()
        };
        self.persist(&job).await;
    }

    /// Record a retryable failure: increment the attempt count and either
    /// schedule the next run with exponential backoff or, once the attempt
    /// budget is spent, fail the job terminally. Returns the resulting state.
    pub async fn mark_retrying(
        &self,
        job_id: &str,
        kind: ErrorKind,
        max_attempts: u32,
        base: Duration,
        cap: Duration,
    ) -> Option<JobState> {
        let job = {
            let mut jobs = self.jobs.lock().unwrap();
            let job = jobs.get_mut(job_id)?;
            if job.state != JobState::InFlight {
                warn!("Ignoring retry for job {job_id} in state {:?}", job.state);
                return None;
            }
            job.attempts += 1;
            job.last_error = Some(kind);
            if job.attempts >= max_attempts {
                job.state = JobState::Failed;
                job.finished_at = Some(chrono::Utc::now().timestamp());
            } else {
                job.state = JobState::Retrying;
                let delay = retry_backoff(job.attempts, base, cap);
                job.next_run = chrono::Utc::now().timestamp() + delay.as_secs() as i64;
            }
            job.clone()
        };
        let state = job.state;
        self.persist(&job).await;
        Some(state)
    }

    /// Shutdown path: abandon all in-flight work as Retrying so nothing is
    /// left permanently InFlight.
    pub async fn abandon_in_flight(&self) {
        let abandoned: Vec<CrawlJob> = {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.values_mut()
                .filter(|j| j.state == JobState::InFlight)
                .map(|j| {
                    j.state = JobState::Retrying;
                    j.next_run = chrono::Utc::now().timestamp();
                    j.clone()
                })
                .collect()
        };
        for job in &abandoned {
            self.persist(job).await;
        }
        if !abandoned.is_empty() {
            info!("Abandoned {} in-flight jobs for retry on shutdown", abandoned.len());
        }
    }

    pub fn get(&self, job_id: &str) -> Option<CrawlJob> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    pub fn non_terminal_for_video(&self, video_id: &str) -> Option<CrawlJob> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .find(|j| j.video_id == video_id && !j.state.is_terminal())
            .cloned()
    }

    pub fn all_jobs(&self) -> Vec<CrawlJob> {
        let mut jobs: Vec<CrawlJob> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn size(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Aggregate state for the monitor. Read-only.
    pub fn health(&self, now: i64) -> QueueHealth {
        let jobs = self.jobs.lock().unwrap();
        let mut health = QueueHealth::default();
        let mut oldest_pending: Option<i64> = None;
        let mut last_success: Option<i64> = None;
        for job in jobs.values() {
            match job.state {
                JobState::Pending => {
                    health.pending += 1;
                    oldest_pending =
                        Some(oldest_pending.map_or(job.created_at, |t| t.min(job.created_at)));
                }
                JobState::InFlight => health.in_flight += 1,
                JobState::Retrying => health.retrying += 1,
                JobState::Succeeded => {
                    health.succeeded += 1;
                    let finished = job.finished_at.unwrap_or(job.created_at);
                    last_success = Some(last_success.map_or(finished, |t| t.max(finished)));
                }
                JobState::SucceededEmpty => health.succeeded_empty += 1,
                JobState::Failed => health.failed += 1,
            }
        }
        health.oldest_pending_age_secs = oldest_pending.map(|t| now - t);
        health.last_success_age_secs = last_success.map(|t| now - t);
        health
    }
}

/// In-memory store used by tests; keeps the write-through behavior
/// observable without an Elasticsearch instance.
#[cfg(test)]
pub struct MemJobStore {
    pub saved: Mutex<HashMap<String, CrawlJob>>,
}

#[cfg(test)]
impl MemJobStore {
    pub fn new() -> Self {
        MemJobStore {
            saved: Mutex::new(HashMap::new()),
        }
    }

    pub fn preload(jobs: Vec<CrawlJob>) -> Self {
        MemJobStore {
            saved: Mutex::new(jobs.into_iter().map(|j| (j.id.clone(), j)).collect()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl JobStore for MemJobStore {
    async fn save(&self, job: &CrawlJob) -> Result<(), CrawlError> {
        self.saved
            .lock()
            .unwrap()
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<CrawlJob>, CrawlError> {
        Ok(self.saved.lock().unwrap().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> CrawlQueue {
        CrawlQueue::new(Arc::new(MemJobStore::new()))
    }

    #[tokio::test]
    async fn enqueue_is_a_noop_for_existing_non_terminal_job() {
        let queue = queue();
        let first = queue.enqueue("vid-1", JobPriority::Discovery).await;
        assert!(first.created);

        let second = queue.enqueue("vid-1", JobPriority::Admin).await;
        assert!(!second.created);
        assert_eq!(second.job.id, first.job.id);
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn enqueue_after_terminal_job_creates_a_new_one() {
        let queue = queue();
        let first = queue.enqueue("vid-1", JobPriority::Discovery).await;
        queue.mark_in_flight(&first.job.id).await.unwrap();
        queue.mark_succeeded(&first.job.id).await;

        let second = queue.enqueue("vid-1", JobPriority::Discovery).await;
        assert!(second.created);
        assert_ne!(second.job.id, first.job.id);
    }

    #[tokio::test]
    async fn at_most_one_in_flight_per_video() {
        let store = Arc::new(MemJobStore::new());
        let queue = CrawlQueue::new(store);
        let a = queue.enqueue("vid-1", JobPriority::Discovery).await;
        queue.mark_in_flight(&a.job.id).await.unwrap();

        // Force a second non-terminal job for the same video past the
        // enqueue dedup, then verify dispatch refuses it.
        let rogue = CrawlJob::new("vid-1", JobPriority::Admin);
        queue
            .jobs
            .lock()
            .unwrap()
            .insert(rogue.id.clone(), rogue.clone());
        assert!(queue.mark_in_flight(&rogue.id).await.is_none());
    }

    #[tokio::test]
    async fn retry_exhaustion_reaches_failed_and_stays_there() {
        let queue = queue();
        let job = queue.enqueue("vid-1", JobPriority::Discovery).await.job;
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);

        for attempt in 1..=3 {
            // Make the job immediately due again regardless of backoff.
            queue.jobs.lock().unwrap().get_mut(&job.id).unwrap().next_run = 0;
            let picked = queue.mark_in_flight(&job.id).await.unwrap();
            assert_eq!(picked.attempts, attempt - 1);
            let state = queue
                .mark_retrying(&job.id, ErrorKind::Transient, 3, base, cap)
                .await
                .unwrap();
            if attempt < 3 {
                assert_eq!(state, JobState::Retrying);
            } else {
                assert_eq!(state, JobState::Failed);
            }
        }

        // Terminal: never re-dispatched.
        assert!(queue.due_jobs(i64::MAX).is_empty());
        assert!(queue.mark_in_flight(&job.id).await.is_none());
        assert_eq!(queue.get(&job.id).unwrap().last_error, Some(ErrorKind::Transient));
    }

    #[tokio::test]
    async fn restore_resets_in_flight_jobs_to_pending() {
        let mut stale = CrawlJob::new("vid-1", JobPriority::Discovery);
        stale.state = JobState::InFlight;
        let done = {
            let mut j = CrawlJob::new("vid-2", JobPriority::Discovery);
            j.state = JobState::Succeeded;
            j
        };
        let store = Arc::new(MemJobStore::preload(vec![stale.clone(), done]));
        let queue = CrawlQueue::new(store.clone());

        let restored = queue.restore().await.unwrap();
        assert_eq!(restored, 2);
        assert_eq!(queue.get(&stale.id).unwrap().state, JobState::Pending);
        // Recovery is persisted, not just in-memory.
        assert_eq!(
            store.saved.lock().unwrap()[&stale.id].state,
            JobState::Pending
        );
    }

    #[tokio::test]
    async fn abandon_in_flight_marks_jobs_retrying() {
        let queue = queue();
        let job = queue.enqueue("vid-1", JobPriority::Discovery).await.job;
        queue.mark_in_flight(&job.id).await.unwrap();
        queue.abandon_in_flight().await;
        assert_eq!(queue.get(&job.id).unwrap().state, JobState::Retrying);
    }

    #[tokio::test]
    async fn state_transitions_are_monotonic() {
        let queue = queue();
        let job = queue.enqueue("vid-1", JobPriority::Discovery).await.job;
        queue.mark_in_flight(&job.id).await.unwrap();
        queue.mark_succeeded(&job.id).await;

        // A terminal job ignores further transitions.
        queue.mark_failed(&job.id, ErrorKind::Transient).await;
        assert_eq!(queue.get(&job.id).unwrap().state, JobState::Succeeded);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(60);
        let cap = Duration::from_secs(3600);
        assert_eq!(retry_backoff(1, base, cap), Duration::from_secs(60));
        assert_eq!(retry_backoff(2, base, cap), Duration::from_secs(120));
        assert_eq!(retry_backoff(3, base, cap), Duration::from_secs(240));
        assert_eq!(retry_backoff(12, base, cap), cap);
    }

    #[tokio::test]
    async fn last_success_age_reflects_completion_not_creation() {
        let queue = queue();
        let job = queue.enqueue("vid-1", JobPriority::Discovery).await.job;
        // A job that sat in the backlog for a day before finishing.
        queue
            .jobs
            .lock()
            .unwrap()
            .get_mut(&job.id)
            .unwrap()
            .created_at -= 86400;
        queue.mark_in_flight(&job.id).await.unwrap();
        queue.mark_succeeded(&job.id).await;

        let health = queue.health(chrono::Utc::now().timestamp());
        assert!(health.last_success_age_secs.unwrap() < 60);
        assert!(queue.get(&job.id).unwrap().finished_at.is_some());
    }

    #[test]
    fn restore_pages_continue_from_the_last_sort_key() {
        let first = restore_page_body(None);
        assert!(first.get("search_after").is_none());
        assert_eq!(first["sort"][0]["created_at"], "asc");
        assert_eq!(first["sort"][1]["id"], "asc");

        let key = json!([1700000000i64, "job-1"]);
        let next = restore_page_body(Some(&key));
        assert_eq!(next["search_after"], key);
    }

    #[tokio::test]
    async fn health_counts_by_state() {
        let queue = queue();
        queue.enqueue("vid-1", JobPriority::Discovery).await;
        let b = queue.enqueue("vid-2", JobPriority::Discovery).await.job;
        queue.mark_in_flight(&b.id).await.unwrap();
        queue.mark_succeeded_empty(&b.id).await;

        let health = queue.health(chrono::Utc::now().timestamp());
        assert_eq!(health.pending, 1);
        assert_eq!(health.succeeded_empty, 1);
        assert_eq!(health.backlog(), 1);
        assert!(health.oldest_pending_age_secs.is_some());
    }
}
