use crate::error::{CrawlError, ErrorKind};
use crate::models::CrawlJob;
use crate::services::discovery::VideoRepo;
use crate::services::fetcher::TranscriptFetcher;
use crate::services::index_writer::IndexWriter;
use crate::services::queue::CrawlQueue;
use crate::services::rate_limiter::{Admission, RateLimiter};
use crate::services::token_manager::TokenManager;
use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchSummary {
    pub dispatched: usize,
    pub deferred: usize,
    pub paused: bool,
}

/// Drives the job state machine: pulls due jobs, gates each through the
/// rate limiter, runs fetch + index, and records the outcome.
pub struct CrawlScheduler {
    queue: Arc<CrawlQueue>,
    limiter: Arc<RateLimiter>,
    fetcher: Arc<TranscriptFetcher>,
    writer: Arc<IndexWriter>,
    tokens: Arc<TokenManager>,
    videos: Arc<dyn VideoRepo>,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl CrawlScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<CrawlQueue>,
        limiter: Arc<RateLimiter>,
        fetcher: Arc<TranscriptFetcher>,
        writer: Arc<IndexWriter>,
        tokens: Arc<TokenManager>,
        videos: Arc<dyn VideoRepo>,
        max_attempts: u32,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Self {
        CrawlScheduler {
            queue,
            limiter,
            fetcher,
            writer,
            tokens,
            videos,
            max_attempts,
            backoff_base,
            backoff_cap,
        }
    }

    /// One dispatch tick. Admission stops at the first Paused or Delayed
    /// answer; remaining due jobs simply wait for a later tick.
    pub async fn dispatch_due(&self) -> DispatchSummary {
        let now = chrono::Utc::now().timestamp();
        let due = self.queue.due_jobs(now);
        let mut summary = DispatchSummary::default();

        for job in due {
            match self.limiter.admit() {
                Admission::Paused { .. } => {
                    debug!("Crawl pipeline paused, deferring {} due jobs", 1 + summary.deferred);
                    summary.deferred += 1;
                    summary.paused = true;
                    break;
                }
                Admission::Delayed(delay) => {
                    debug!("Burst budget spent, next window in {delay:?}");
                    summary.deferred += 1;
                    break;
                }
                Admission::Granted => {
                    self.run_job(&job).await;
                    summary.dispatched += 1;
                }
            }
        }
        summary
    }

    async fn run_job(&self, due_job: &CrawlJob) {
        let Some(job) = self.queue.mark_in_flight(&due_job.id).await else {
            return;
        };
        info!("Processing video ID: {}", job.video_id);

        let mut result = self.fetcher.fetch_transcript(&job.video_id).await;

        // An auth failure gets exactly one forced refresh and retry; the
        // second failure is terminal for the job.
        if matches!(result, Err(CrawlError::Auth(_))) {
            warn!(
                "Auth failure on job {}, forcing token refresh and retrying once",
                job.id
            );
            result = match self.tokens.force_refresh().await {
                Ok(()) => self.fetcher.fetch_transcript(&job.video_id).await,
                Err(e) => Err(e),
            };
        }

        // The job is only Succeeded once the index write is acknowledged;
        // a crash between fetch and write re-runs the whole job.
        let outcome = match result {
            Ok(document) => self.writer.upsert(&document).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.queue.mark_succeeded(&job.id).await;
                self.touch_video(&job.video_id).await;
            }
            Err(CrawlError::NotFound) => {
                info!("No captions for video {}, closing job as empty", job.video_id);
                self.queue.mark_succeeded_empty(&job.id).await;
            }
            Err(CrawlError::Auth(e)) => {
                error!("Job {} failed after token refresh: {e}", job.id);
                self.queue.mark_failed(&job.id, ErrorKind::Auth).await;
            }
            Err(e @ CrawlError::RateLimit { .. }) => {
                self.limiter.record_ban_signal();
                self.retry(&job.id, e.kind()).await;
            }
            Err(e) => {
                warn!("Job {} failed: {e}", job.id);
                self.retry(&job.id, e.kind()).await;
            }
        }
    }

    async fn retry(&self, job_id: &str, kind: ErrorKind) {
        self.queue
            .mark_retrying(
                job_id,
                kind,
                self.max_attempts,
                self.backoff_base,
                self.backoff_cap,
            )
            .await;
    }

    async fn touch_video(&self, video_id: &str) {
        match self.videos.get(video_id).await {
            Ok(Some(mut video)) => {
                video.last_crawl = Some(chrono::Utc::now().timestamp());
                if let Err(e) = self.videos.upsert(&video).await {
                    warn!("Failed to record crawl time for video {video_id}: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to load video {video_id}: {e}"),
        }
    }
}

/// The queue dispatch trigger loop. Owns its own cron scheduler, separate
/// from the monitor's.
pub async fn setup_queue_scheduler(
    crawl_scheduler: Arc<CrawlScheduler>,
    schedule: &str,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let crawl_job = Job::new_async(schedule, move |_uuid, _l| {
        let crawl_scheduler = crawl_scheduler.clone();
        Box::pin(async move {
            let summary = crawl_scheduler.dispatch_due().await;
            if summary.dispatched > 0 || summary.deferred > 0 {
                info!(
                    "Dispatch tick: {} dispatched, {} deferred{}",
                    summary.dispatched,
                    summary.deferred,
                    if summary.paused { " (paused)" } else { "" }
                );
            }
        })
    })?;

    scheduler.add(crawl_job).await?;
    scheduler.start().await?;
    info!("Crawl queue scheduler started.");

    Ok(scheduler)
}
