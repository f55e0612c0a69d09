use crate::error::CrawlError;
use crate::models::{JobPriority, Video};
use crate::services::elasticsearch_service::VIDEOS_INDEX;
use crate::services::queue::CrawlQueue;
use async_trait::async_trait;
use elasticsearch::{Elasticsearch, GetParts, IndexParts};
use log::{error, info};
use serde_json::{json, Value};
use std::sync::Arc;

const CHANNELS_API_URL: &str = "https://www.googleapis.com/youtube/v3/channels";
const PLAYLIST_ITEMS_API_URL: &str = "https://www.googleapis.com/youtube/v3/playlistItems";

/// One page of discovered videos plus the opaque continuation cursor.
#[derive(Debug, Clone)]
pub struct DiscoveryPage {
    pub videos: Vec<Video>,
    pub next_cursor: Option<String>,
}

/// Read-only provider scan surface, injectable for tests.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn uploads_playlist_id(&self, channel_id: &str) -> Result<String, CrawlError>;
    async fn playlist_page(
        &self,
        playlist_id: &str,
        cursor: Option<&str>,
    ) -> Result<DiscoveryPage, CrawlError>;
}

/// YouTube Data API scan client. These are key-authenticated read-only
/// endpoints; captions never flow through here.
pub struct YouTubeDataApi {
    http: reqwest::Client,
    api_key: String,
}

impl YouTubeDataApi {
    pub fn new(http: reqwest::Client, api_key: String) -> Self {
        YouTubeDataApi { http, api_key }
    }
}

#[async_trait]
impl DiscoverySource for YouTubeDataApi {
    // The complete video library of a channel is exposed as its uploads
    // playlist. https://developers.google.com/youtube/v3/docs/channels
    async fn uploads_playlist_id(&self, channel_id: &str) -> Result<String, CrawlError> {
        let url = format!(
            "{CHANNELS_API_URL}?id={channel_id}&key={}&part=contentDetails",
            self.api_key
        );
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::from_provider_status(
                status.as_u16(),
                "channels.list",
            ));
        }

        let body: Value = response.json().await?;
        body["items"][0]["contentDetails"]["relatedPlaylists"]["uploads"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| {
                CrawlError::Transient(format!("no uploads playlist for channel {channel_id}"))
            })
    }

    // https://developers.google.com/youtube/v3/docs/playlistItems
    async fn playlist_page(
        &self,
        playlist_id: &str,
        cursor: Option<&str>,
    ) -> Result<DiscoveryPage, CrawlError> {
        let mut url = format!(
            "{PLAYLIST_ITEMS_API_URL}?playlistId={playlist_id}&key={}&part=snippet&maxResults=50",
            self.api_key
        );
        if let Some(token) = cursor {
            url.push_str(&format!("&pageToken={token}"));
        }

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::from_provider_status(
                status.as_u16(),
                "playlistItems.list",
            ));
        }

        let body: Value = response.json().await?;
        let now = chrono::Utc::now().timestamp();
        let mut videos = Vec::new();
        if let Some(items) = body["items"].as_array() {
            for item in items {
                let snippet = &item["snippet"];
                let Some(video_id) = snippet["resourceId"]["videoId"].as_str() else {
                    continue;
                };
                videos.push(Video {
                    video_id: video_id.to_string(),
                    title: snippet["title"].as_str().unwrap_or("").to_string(),
                    channel_id: snippet["videoOwnerChannelId"]
                        .as_str()
                        .or(snippet["channelId"].as_str())
                        .unwrap_or("")
                        .to_string(),
                    channel_name: snippet["videoOwnerChannelTitle"]
                        .as_str()
                        .or(snippet["channelTitle"].as_str())
                        .unwrap_or("")
                        .to_string(),
                    discovered_at: now,
                    last_crawl: None,
                });
            }
        }

        Ok(DiscoveryPage {
            videos,
            next_cursor: body["nextPageToken"].as_str().map(String::from),
        })
    }
}

/// Video record persistence, injectable for tests.
#[async_trait]
pub trait VideoRepo: Send + Sync {
    async fn get(&self, video_id: &str) -> Result<Option<Video>, CrawlError>;
    async fn upsert(&self, video: &Video) -> Result<(), CrawlError>;
}

pub struct EsVideoRepo {
    es_client: Elasticsearch,
}

impl EsVideoRepo {
    pub fn new(es_client: Elasticsearch) -> Self {
        EsVideoRepo { es_client }
    }
}

#[async_trait]
impl VideoRepo for EsVideoRepo {
    async fn get(&self, video_id: &str) -> Result<Option<Video>, CrawlError> {
        let response = self
            .es_client
            .get(GetParts::IndexId(VIDEOS_INDEX, video_id))
            .send()
            .await
            .map_err(|e| CrawlError::IndexWrite(format!("lookup video {video_id}: {e}")))?;

        if response.status_code() == 404 {
            return Ok(None);
        }
        if !response.status_code().is_success() {
            return Err(CrawlError::IndexWrite(format!(
                "lookup video {video_id} failed with status {}",
                response.status_code()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| CrawlError::IndexWrite(format!("lookup video body: {e}")))?;
        Ok(serde_json::from_value(body["_source"].clone()).ok())
    }

    async fn upsert(&self, video: &Video) -> Result<(), CrawlError> {
        let response = self
            .es_client
            .index(IndexParts::IndexId(VIDEOS_INDEX, &video.video_id))
            .body(json!(video))
            .send()
            .await
            .map_err(|e| CrawlError::IndexWrite(format!("index video {}: {e}", video.video_id)))?;

        if !response.status_code().is_success() {
            return Err(CrawlError::IndexWrite(format!(
                "index video {} failed with status {}",
                video.video_id,
                response.status_code()
            )));
        }
        Ok(())
    }
}

/// Produces candidate video ids from the configured channel scope and feeds
/// them into the crawl queue. Never fetches captions itself.
pub struct VideoDiscovery {
    source: Arc<dyn DiscoverySource>,
    videos: Arc<dyn VideoRepo>,
    queue: Arc<CrawlQueue>,
}

impl VideoDiscovery {
    pub fn new(
        source: Arc<dyn DiscoverySource>,
        videos: Arc<dyn VideoRepo>,
        queue: Arc<CrawlQueue>,
    ) -> Self {
        VideoDiscovery {
            source,
            videos,
            queue,
        }
    }

    /// Process one page of the channel's uploads, returning the cursor for
    /// the next page. Restartable: pass the returned cursor back in to
    /// continue, or `None` to start over.
    pub async fn discover(
        &self,
        playlist_id: &str,
        cursor: Option<&str>,
    ) -> Result<Option<String>, CrawlError> {
        let page = self.source.playlist_page(playlist_id, cursor).await?;

        let mut enqueued = 0;
        for video in &page.videos {
            if self.videos.get(&video.video_id).await?.is_some() {
                continue;
            }
            self.videos.upsert(video).await?;
            let outcome = self
                .queue
                .enqueue(&video.video_id, JobPriority::Discovery)
                .await;
            if outcome.created {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            info!("Discovery enqueued {enqueued} new videos");
        }
        Ok(page.next_cursor)
    }

    /// Walk a channel's full uploads playlist page by page.
    pub async fn scan_channel(&self, channel_id: &str) -> Result<(), CrawlError> {
        let playlist_id = self.source.uploads_playlist_id(channel_id).await?;
        let mut cursor: Option<String> = None;
        loop {
            cursor = self.discover(&playlist_id, cursor.as_deref()).await?;
            if cursor.is_none() {
                return Ok(());
            }
        }
    }

    pub async fn scan_channels(&self, channel_ids: &[String]) {
        for channel_id in channel_ids {
            info!("Scanning channel {channel_id} for new videos...");
            if let Err(e) = self.scan_channel(channel_id).await {
                error!("Channel scan failed for {channel_id}: {e}");
            }
        }
    }
}

/// The discovery trigger loop. Owns its own cron scheduler so channel scans
/// never block queue dispatch.
pub async fn setup_discovery_schedule(
    discovery: Arc<VideoDiscovery>,
    channel_ids: Vec<String>,
    schedule: &str,
) -> anyhow::Result<tokio_cron_scheduler::JobScheduler> {
    use tokio_cron_scheduler::{Job, JobScheduler};

    let scheduler = JobScheduler::new().await?;

    let scan_job = Job::new_async(schedule, move |_uuid, _l| {
        let discovery = discovery.clone();
        let channel_ids = channel_ids.clone();
        Box::pin(async move {
            discovery.scan_channels(&channel_ids).await;
        })
    })?;

    scheduler.add(scan_job).await?;
    scheduler.start().await?;
    info!("Video discovery scheduler started.");

    Ok(scheduler)
}
