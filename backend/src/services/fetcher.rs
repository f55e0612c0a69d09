use crate::error::CrawlError;
use crate::models::{CaptionSegment, CaptionTrack, TranscriptDocument};
use crate::services::token_manager::TokenManager;
use async_trait::async_trait;
use log::{debug, info};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::sync::Arc;

const CAPTIONS_API_URL: &str = "https://www.googleapis.com/youtube/v3/captions";

/// Provider surface needed by the fetcher: list a video's caption tracks,
/// download one track as a timed-text document.
#[async_trait]
pub trait CaptionProvider: Send + Sync {
    async fn list_tracks(&self, video_id: &str) -> Result<Vec<CaptionTrack>, CrawlError>;
    async fn download_track(&self, track: &CaptionTrack) -> Result<String, CrawlError>;
}

/// Real provider client. Every call acquires a token first; HTTP statuses
/// map onto the crawl error taxonomy (401 auth, 403/429 ban signal).
pub struct YouTubeCaptionClient {
    http: reqwest::Client,
    api_key: String,
    tokens: Arc<TokenManager>,
}

impl YouTubeCaptionClient {
    pub fn new(http: reqwest::Client, api_key: String, tokens: Arc<TokenManager>) -> Self {
        YouTubeCaptionClient {
            http,
            api_key,
            tokens,
        }
    }
}

#[async_trait]
impl CaptionProvider for YouTubeCaptionClient {
    async fn list_tracks(&self, video_id: &str) -> Result<Vec<CaptionTrack>, CrawlError> {
        let token = self.tokens.acquire_token().await?;

        // Documentation: https://developers.google.com/youtube/v3/docs/captions/list
        let url = format!(
            "{CAPTIONS_API_URL}?part=snippet&videoId={video_id}&key={}",
            self.api_key
        );
        let response = self.http.get(&url).bearer_auth(&token).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::from_provider_status(
                status.as_u16(),
                "captions.list",
            ));
        }

        let body: serde_json::Value = response.json().await?;
        let mut tracks = Vec::new();
        if let Some(items) = body["items"].as_array() {
            for item in items {
                let id = item["id"].as_str().unwrap_or("").to_string();
                let language = item["snippet"]["language"].as_str().unwrap_or("").to_string();
                if id.is_empty() || language.is_empty() {
                    continue;
                }
                tracks.push(CaptionTrack {
                    id,
                    language,
                    auto_generated: item["snippet"]["trackKind"].as_str() == Some("asr"),
                });
            }
        }
        debug!("Video {video_id} has {} caption tracks", tracks.len());
        Ok(tracks)
    }

    async fn download_track(&self, track: &CaptionTrack) -> Result<String, CrawlError> {
        let token = self.tokens.acquire_token().await?;

        // Documentation: https://developers.google.com/youtube/v3/docs/captions/download
        let url = format!("{CAPTIONS_API_URL}/{}?tfmt=ttml", track.id);
        let response = self.http.get(&url).bearer_auth(&token).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::from_provider_status(
                status.as_u16(),
                "captions.download",
            ));
        }
        Ok(response.text().await?)
    }
}

/// Language match on the primary subtag: "en" accepts "en" and "en-US".
fn language_matches(track_language: &str, wanted: &str) -> bool {
    let primary = track_language.split('-').next().unwrap_or(track_language);
    primary.eq_ignore_ascii_case(wanted.split('-').next().unwrap_or(wanted))
}

/// Obtains the best-available caption track for a video per the configured
/// language priority list.
pub struct TranscriptFetcher {
    provider: Arc<dyn CaptionProvider>,
    language_priority: Vec<String>,
    accept_auto_generated: bool,
}

impl TranscriptFetcher {
    pub fn new(
        provider: Arc<dyn CaptionProvider>,
        language_priority: Vec<String>,
        accept_auto_generated: bool,
    ) -> Self {
        TranscriptFetcher {
            provider,
            language_priority,
            accept_auto_generated,
        }
    }

    /// Walk the priority list; first language with a manually created track
    /// wins and its rank is recorded. Auto-generated tracks are only used
    /// when the policy flag allows, at a rank behind every configured
    /// language. No track at all is a NotFound, which the scheduler treats
    /// as success-with-no-data.
    pub async fn fetch_transcript(
        &self,
        video_id: &str,
    ) -> Result<TranscriptDocument, CrawlError> {
        let tracks = self.provider.list_tracks(video_id).await?;

        for (rank, wanted) in self.language_priority.iter().enumerate() {
            let Some(track) = tracks
                .iter()
                .find(|t| !t.auto_generated && language_matches(&t.language, wanted))
            else {
                continue;
            };
            return self.download(video_id, track, rank).await;
        }

        if self.accept_auto_generated {
            let auto = self
                .language_priority
                .iter()
                .filter_map(|wanted| {
                    tracks
                        .iter()
                        .find(|t| t.auto_generated && language_matches(&t.language, wanted))
                })
                .next()
                .or_else(|| tracks.iter().find(|t| t.auto_generated));
            if let Some(track) = auto {
                debug!("Falling back to auto-generated track for video {video_id}");
                return self
                    .download(video_id, track, self.language_priority.len())
                    .await;
            }
        }

        Err(CrawlError::NotFound)
    }

    async fn download(
        &self,
        video_id: &str,
        track: &CaptionTrack,
        rank: usize,
    ) -> Result<TranscriptDocument, CrawlError> {
        let timed_text = self.provider.download_track(track).await?;
        let segments = parse_timed_text(&timed_text)?;
        if segments.is_empty() {
            return Err(CrawlError::NotFound);
        }
        info!(
            "Fetched {} caption segments for video {video_id} (language {}, rank {rank})",
            segments.len(),
            track.language
        );
        Ok(TranscriptDocument::new(
            video_id,
            &track.language,
            rank,
            segments,
        ))
    }
}

/// Parse a subtitle document into ordered caption segments. Accepts both
/// timed-text shapes the provider serves: `<text start=".." dur="..">` and
/// TTML `<p begin=".." end="..">`.
pub fn parse_timed_text(xml: &str) -> Result<Vec<CaptionSegment>, CrawlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut segments = Vec::new();
    let mut current: Option<(f64, f64)> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"text" => {
                    let start = attr_seconds(e, b"start").unwrap_or(0.0);
                    let dur = attr_seconds(e, b"dur").unwrap_or(0.0);
                    current = Some((start, dur));
                    text.clear();
                }
                b"p" => {
                    let begin = attr_seconds(e, b"begin").unwrap_or(0.0);
                    let end = attr_seconds(e, b"end").unwrap_or(begin);
                    current = Some((begin, (end - begin).max(0.0)));
                    text.clear();
                }
                _ => {}
            },
            Ok(Event::End(ref e)) => {
                if matches!(e.local_name().as_ref(), b"text" | b"p") {
                    if let Some((start, duration)) = current.take() {
                        let trimmed = text.trim();
                        if !trimmed.is_empty() {
                            segments.push(CaptionSegment {
                                start,
                                duration,
                                text: trimmed.to_string(),
                            });
                        }
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if current.is_some() {
                    let decoded = e.unescape().unwrap_or_default();
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(&decoded);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(CrawlError::Transient(format!(
                    "malformed timed-text document: {e}"
                )));
            }
            _ => {}
        }
    }

    Ok(segments)
}

fn attr_seconds(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<f64> {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == name {
            let value = attr.unescape_value().ok()?;
            return parse_offset_seconds(&value);
        }
    }
    None
}

/// Offsets appear either as plain seconds ("1.3") or clock time
/// ("00:00:01.300").
fn parse_offset_seconds(value: &str) -> Option<f64> {
    let value = value.trim().trim_end_matches('s');
    if let Ok(secs) = value.parse::<f64>() {
        return Some(secs);
    }
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }
    let mut secs = 0.0;
    for part in &parts {
        secs = secs * 60.0 + part.parse::<f64>().ok()?;
    }
    Some(secs)
}
