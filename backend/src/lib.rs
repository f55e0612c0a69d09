pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::Config;
use crate::services::discovery::{
    setup_discovery_schedule, EsVideoRepo, VideoDiscovery, YouTubeDataApi,
};
use crate::services::elasticsearch_service::create_es_indices;
use crate::services::fetcher::{TranscriptFetcher, YouTubeCaptionClient};
use crate::services::index_writer::{EsDocumentStore, IndexWriter};
use crate::services::monitor::{setup_monitoring, LogAlertSink, QueueMonitor};
use crate::services::queue::{CrawlQueue, EsJobStore};
use crate::services::rate_limiter::RateLimiter;
use crate::services::scheduler::{setup_queue_scheduler, CrawlScheduler};
use crate::services::token_manager::{OAuthHttpExchanger, TokenManager};
use anyhow::Result;
use elasticsearch::Elasticsearch;
use std::sync::Arc;
use tokio_cron_scheduler::JobScheduler;

/// Long-lived process state: shared components plus the cron scheduler
/// handles that keep the trigger loops alive.
pub struct AppState {
    pub config: Config,
    pub es_client: Elasticsearch,
    pub queue: Arc<CrawlQueue>,
    pub limiter: Arc<RateLimiter>,
    pub schedulers: Vec<JobScheduler>,
}

pub async fn create_app_state(config: Config) -> Result<AppState> {
    let es_client = config::create_elasticsearch_client(&config)?;
    create_es_indices(&es_client).await;

    let http = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()?;

    // Restore the durable queue before any dispatch can run; this is also
    // the crash-recovery pass for jobs left InFlight.
    let queue = Arc::new(CrawlQueue::new(Arc::new(EsJobStore::new(
        es_client.clone(),
    ))));
    queue.restore().await?;

    let tokens = Arc::new(TokenManager::new(
        Box::new(OAuthHttpExchanger::new(http.clone(), config.oauth.clone())),
        config.oauth.refresh_margin,
    ));
    let limiter = Arc::new(RateLimiter::new(
        config.crawl_burst_max,
        config.crawl_window,
        config.ban_cooldown_base,
        config.ban_cooldown_cap,
    ));
    let fetcher = Arc::new(TranscriptFetcher::new(
        Arc::new(YouTubeCaptionClient::new(
            http.clone(),
            config.youtube_api_key.clone(),
            tokens.clone(),
        )),
        config.language_priority.clone(),
        config.accept_auto_captions,
    ));
    let writer = Arc::new(IndexWriter::new(Arc::new(EsDocumentStore::new(
        es_client.clone(),
    ))));
    let videos = Arc::new(EsVideoRepo::new(es_client.clone()));

    let crawl_scheduler = Arc::new(CrawlScheduler::new(
        queue.clone(),
        limiter.clone(),
        fetcher,
        writer,
        tokens,
        videos.clone(),
        config.max_attempts,
        config.retry_backoff_base,
        config.retry_backoff_cap,
    ));

    let discovery = Arc::new(VideoDiscovery::new(
        Arc::new(YouTubeDataApi::new(http, config.youtube_api_key.clone())),
        videos,
        queue.clone(),
    ));

    let monitor = Arc::new(QueueMonitor::new(
        queue.clone(),
        config.monitor.clone(),
        Arc::new(LogAlertSink),
    ));

    let schedulers = vec![
        setup_queue_scheduler(crawl_scheduler, &config.crawl_queue_schedule).await?,
        setup_monitoring(monitor, &config.monitor_check_schedule).await?,
        setup_discovery_schedule(
            discovery,
            config.discovery_channels.clone(),
            &config.discovery_schedule,
        )
        .await?,
    ];

    Ok(AppState {
        config,
        es_client,
        queue,
        limiter,
        schedulers,
    })
}
