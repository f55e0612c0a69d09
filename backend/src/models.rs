use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle of a crawl job. Transitions are monotonic along
/// Pending -> InFlight -> {Succeeded | SucceededEmpty | Retrying | Failed},
/// with Retrying looping back through dispatch until the attempt budget is
/// exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InFlight,
    Succeeded,
    SucceededEmpty,
    Retrying,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::SucceededEmpty | JobState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Discovery,
    Admin,
}

/// Unit of crawl work, persisted in the `crawl_jobs` index so the queue
/// survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: String,
    pub video_id: String,
    pub state: JobState,
    pub attempts: u32,
    /// Unix timestamp after which the job is eligible for dispatch.
    pub next_run: i64,
    pub created_at: i64,
    /// Unix timestamp at which the job reached a terminal state.
    #[serde(default)]
    pub finished_at: Option<i64>,
    pub priority: JobPriority,
    pub last_error: Option<ErrorKind>,
}

impl CrawlJob {
    pub fn new(video_id: &str, priority: JobPriority) -> Self {
        let now = chrono::Utc::now().timestamp();
        CrawlJob {
            id: uuid::Uuid::new_v4().to_string(),
            video_id: video_id.to_string(),
            state: JobState::Pending,
            attempts: 0,
            next_run: now,
            created_at: now,
            finished_at: None,
            priority,
            last_error: None,
        }
    }
}

/// Discovered content unit, persisted in the `videos` index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Video {
    pub video_id: String,
    pub title: String,
    pub channel_id: String,
    pub channel_name: String,
    pub discovered_at: i64,
    pub last_crawl: Option<i64>,
}

/// One caption track as listed by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionTrack {
    pub id: String,
    pub language: String,
    pub auto_generated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionSegment {
    pub start: f64,
    pub duration: f64,
    pub text: String,
}

/// The unit persisted to the search index, unique per (video id, language).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptDocument {
    pub video_id: String,
    pub language: String,
    pub segments: Vec<CaptionSegment>,
    /// Position of the selected language in the configured priority list.
    pub priority_rank: usize,
    pub checksum: String,
    pub indexed_at: i64,
}

impl TranscriptDocument {
    pub fn new(
        video_id: &str,
        language: &str,
        priority_rank: usize,
        segments: Vec<CaptionSegment>,
    ) -> Self {
        let checksum = segment_checksum(&segments);
        TranscriptDocument {
            video_id: video_id.to_string(),
            language: language.to_string(),
            segments,
            priority_rank,
            checksum,
            indexed_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Index document id; one document per (video, language).
    pub fn doc_id(&self) -> String {
        format!("{}_{}", self.video_id, self.language)
    }
}

/// Content checksum over the ordered segment list. Re-ingesting an
/// unchanged transcript produces the same checksum, which the index writer
/// uses to turn the upsert into a no-op.
pub fn segment_checksum(segments: &[CaptionSegment]) -> String {
    let mut hasher = Sha256::new();
    for seg in segments {
        hasher.update(seg.start.to_bits().to_le_bytes());
        hasher.update(seg.duration.to_bits().to_le_bytes());
        hasher.update(seg.text.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Aggregate queue state as read by the monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueHealth {
    pub pending: usize,
    pub in_flight: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub succeeded_empty: usize,
    pub failed: usize,
    pub oldest_pending_age_secs: Option<i64>,
    pub last_success_age_secs: Option<i64>,
}

impl QueueHealth {
    pub fn backlog(&self) -> usize {
        self.pending + self.retrying + self.in_flight
    }

    /// Failed share of all jobs that reached a terminal state.
    pub fn failure_rate(&self) -> f64 {
        let terminal = self.succeeded + self.succeeded_empty + self.failed;
        if terminal == 0 {
            0.0
        } else {
            self.failed as f64 / terminal as f64
        }
    }
}

/// Result of an admin enqueue request. `created == false` means a
/// non-terminal job for the video already existed and was returned instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub job: CrawlJob,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminStats {
    pub total_videos: i64,
    pub total_transcripts: i64,
    pub queue: QueueHealth,
}
