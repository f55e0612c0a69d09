use anyhow::{Context, Result};
use elasticsearch::{
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    Elasticsearch,
};
use env_logger::Builder;
use log::{info, LevelFilter};
use std::env;
use std::time::Duration;

pub fn init_logger() {
    Builder::new().filter_level(LevelFilter::Info).init();
    info!("Starting crawl backend...");
}

pub fn load_environment() {
    dotenv::dotenv().ok();
}

/// OAuth2 refresh-token credentials for the caption download endpoints.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// Refresh the access token once its remaining lifetime drops below this.
    pub refresh_margin: Duration,
}

/// Alert thresholds for the queue monitor.
#[derive(Debug, Clone)]
pub struct MonitorThresholds {
    pub max_backlog: usize,
    pub max_pending_age: Duration,
    pub max_failure_rate: f64,
}

/// Immutable process configuration, assembled once at startup and passed
/// explicitly to every component that needs it.
#[derive(Debug, Clone)]
pub struct Config {
    pub elasticsearch_url: String,
    pub youtube_api_key: String,
    pub admin_token: String,
    /// Ordered caption language fallback, e.g. ["en", "de"].
    pub language_priority: Vec<String>,
    pub accept_auto_captions: bool,
    pub crawl_burst_max: u32,
    pub crawl_window: Duration,
    pub crawl_queue_schedule: String,
    pub monitor_check_schedule: String,
    pub discovery_schedule: String,
    pub discovery_channels: Vec<String>,
    pub max_attempts: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
    pub ban_cooldown_base: Duration,
    pub ban_cooldown_cap: Duration,
    pub request_timeout: Duration,
    pub oauth: OAuthConfig,
    pub monitor: MonitorThresholds,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        env::var(key)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default_secs),
    )
}

fn required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{key} environment variable must be set"))
}

impl Config {
    pub fn from_env() -> Result<Config> {
        let language_priority: Vec<String> = env_or("LANGUAGE_PRIORITY", "en")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let discovery_channels: Vec<String> = env_or("DISCOVERY_CHANNELS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            elasticsearch_url: env_or("ELASTICSEARCH_URL", "http://localhost:9200"),
            youtube_api_key: required("YOUTUBE_API_KEY")?,
            admin_token: required("ADMIN_TOKEN")?,
            language_priority,
            accept_auto_captions: env_or("ACCEPT_AUTO_CAPTIONS", "false") == "true",
            crawl_burst_max: env_or("CRAWL_BURST_MAX", "1").parse::<u32>().unwrap_or(1),
            crawl_window: env_secs("CRAWL_WINDOW_SECS", 30),
            crawl_queue_schedule: env_or("CRAWL_QUEUE_SCHEDULE", "*/30 * * * * *"),
            monitor_check_schedule: env_or("MONITOR_CHECK_SCHEDULE", "0 */10 * * * *"),
            discovery_schedule: env_or("DISCOVERY_SCHEDULE", "0 0 * * * *"),
            discovery_channels,
            max_attempts: env_or("CRAWL_MAX_ATTEMPTS", "5").parse::<u32>().unwrap_or(5),
            retry_backoff_base: env_secs("RETRY_BACKOFF_BASE_SECS", 60),
            retry_backoff_cap: env_secs("RETRY_BACKOFF_CAP_SECS", 3600),
            ban_cooldown_base: env_secs("BAN_COOLDOWN_BASE_SECS", 300),
            ban_cooldown_cap: env_secs("BAN_COOLDOWN_CAP_SECS", 14400),
            request_timeout: env_secs("REQUEST_TIMEOUT_SECS", 30),
            oauth: OAuthConfig {
                token_url: env_or("OAUTH_TOKEN_URL", "https://oauth2.googleapis.com/token"),
                client_id: required("OAUTH_CLIENT_ID")?,
                client_secret: required("OAUTH_CLIENT_SECRET")?,
                refresh_token: required("OAUTH_REFRESH_TOKEN")?,
                refresh_margin: env_secs("OAUTH_REFRESH_MARGIN_SECS", 120),
            },
            monitor: MonitorThresholds {
                max_backlog: env_or("MONITOR_MAX_BACKLOG", "500")
                    .parse::<usize>()
                    .unwrap_or(500),
                max_pending_age: env_secs("MONITOR_MAX_PENDING_AGE_SECS", 3600),
                max_failure_rate: env_or("MONITOR_MAX_FAILURE_RATE", "0.25")
                    .parse::<f64>()
                    .unwrap_or(0.25),
            },
        })
    }
}

pub fn create_elasticsearch_client(config: &Config) -> Result<Elasticsearch> {
    let es_url = &config.elasticsearch_url;
    info!("Connecting to Elasticsearch at: {es_url}");

    let transport =
        TransportBuilder::new(SingleNodeConnectionPool::new(es_url.parse()?)).build()?;

    Ok(Elasticsearch::new(transport))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_priority_parsing() {
        let parsed: Vec<String> = "en, de ,fr,"
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(parsed, vec!["en", "de", "fr"]);
    }
}
