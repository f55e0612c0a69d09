use crate::models::{AdminStats, CrawlJob, EnqueueOutcome, JobPriority};
use crate::services::elasticsearch_service::{get_index_count, TRANSCRIPTS_INDEX, VIDEOS_INDEX};
use crate::services::queue::CrawlQueue;
use crate::services::rate_limiter::RateLimiter;
use crate::utils::extract_youtube_video_id;
use elasticsearch::Elasticsearch;
use log::{info, warn};
use thiserror::Error;

/// Failures at the admin boundary. These map onto HTTP statuses in the
/// external admin layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdminError {
    #[error("invalid admin token")]
    Unauthorized,
    #[error("not a recognizable YouTube video URL or id")]
    InvalidVideoInput,
}

fn authorize(expected_token: &str, supplied_token: &str) -> Result<(), AdminError> {
    if supplied_token == expected_token {
        Ok(())
    } else {
        warn!("Rejected admin request with invalid token");
        Err(AdminError::Unauthorized)
    }
}

/// Externally triggered crawl. The token is checked before anything is
/// enqueued; an existing non-terminal job for the video is returned
/// unchanged instead of duplicating work.
pub async fn admin_enqueue(
    queue: &CrawlQueue,
    expected_token: &str,
    supplied_token: &str,
    input: &str,
) -> Result<EnqueueOutcome, AdminError> {
    authorize(expected_token, supplied_token)?;

    let video_id = extract_youtube_video_id(input).ok_or(AdminError::InvalidVideoInput)?;
    let outcome = queue.enqueue(&video_id, JobPriority::Admin).await;
    if !outcome.created {
        info!(
            "Admin enqueue for {video_id} matched existing job {}",
            outcome.job.id
        );
    }
    Ok(outcome)
}

/// Operator override: lift a ban-signal pause immediately.
pub fn admin_resume_crawl(
    limiter: &RateLimiter,
    expected_token: &str,
    supplied_token: &str,
) -> Result<(), AdminError> {
    authorize(expected_token, supplied_token)?;
    limiter.resume();
    Ok(())
}

pub fn admin_queue(
    queue: &CrawlQueue,
    expected_token: &str,
    supplied_token: &str,
) -> Result<Vec<CrawlJob>, AdminError> {
    authorize(expected_token, supplied_token)?;
    Ok(queue.all_jobs())
}

pub async fn admin_stats(
    es_client: &Elasticsearch,
    queue: &CrawlQueue,
    expected_token: &str,
    supplied_token: &str,
) -> Result<AdminStats, AdminError> {
    authorize(expected_token, supplied_token)?;

    Ok(AdminStats {
        total_videos: get_index_count(es_client, VIDEOS_INDEX).await,
        total_transcripts: get_index_count(es_client, TRANSCRIPTS_INDEX).await,
        queue: queue.health(chrono::Utc::now().timestamp()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::queue::MemJobStore;
    use std::sync::Arc;

    fn queue() -> CrawlQueue {
        CrawlQueue::new(Arc::new(MemJobStore::new()))
    }

    #[tokio::test]
    async fn invalid_token_is_rejected_without_enqueueing() {
        let queue = queue();
        let result = admin_enqueue(
            &queue,
            "secret",
            "wrong",
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
        )
        .await;
        assert_eq!(result.unwrap_err(), AdminError::Unauthorized);
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn valid_token_enqueues_the_video() {
        let queue = queue();
        let outcome = admin_enqueue(
            &queue,
            "secret",
            "secret",
            "https://youtu.be/dQw4w9WgXcQ",
        )
        .await
        .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.job.video_id, "dQw4w9WgXcQ");
    }

    #[tokio::test]
    async fn duplicate_enqueue_returns_the_existing_job() {
        let queue = queue();
        let first = admin_enqueue(&queue, "secret", "secret", "dQw4w9WgXcQ")
            .await
            .unwrap();
        let second = admin_enqueue(&queue, "secret", "secret", "dQw4w9WgXcQ")
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.job.id, first.job.id);
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn resume_lifts_a_ban_pause() {
        use std::time::Duration;

        let limiter = RateLimiter::new(
            1,
            Duration::from_secs(30),
            Duration::from_secs(300),
            Duration::from_secs(14400),
        );
        limiter.record_ban_signal();
        assert!(limiter.is_paused());

        assert_eq!(
            admin_resume_crawl(&limiter, "secret", "wrong"),
            Err(AdminError::Unauthorized)
        );
        assert!(limiter.is_paused());

        admin_resume_crawl(&limiter, "secret", "secret").unwrap();
        assert!(!limiter.is_paused());
    }

    #[tokio::test]
    async fn queue_listing_requires_the_token() {
        let queue = queue();
        queue.enqueue("dQw4w9WgXcQ", JobPriority::Admin).await;

        assert_eq!(
            admin_queue(&queue, "secret", "wrong").unwrap_err(),
            AdminError::Unauthorized
        );
        assert_eq!(admin_queue(&queue, "secret", "secret").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn garbage_input_is_rejected() {
        let queue = queue();
        let result = admin_enqueue(&queue, "secret", "secret", "https://vimeo.com/1").await;
        assert_eq!(result.unwrap_err(), AdminError::InvalidVideoInput);
    }
}
