//! Track metadata lookup against the YouTube Data API and the SoundCloud
//! tracks API.
//!
//! Lookups are best-effort. A caller that gets an error keeps the track
//! with whatever fields it already had.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::frame::ErrorCode;
use crate::track::{Platform, TrackMetadata};

const YOUTUBE_VIDEOS_URL: &str = "https://www.googleapis.com/youtube/v3/videos";
const SOUNDCLOUD_TRACKS_URL: &str = "https://api.soundcloud.com/tracks";
const REQUEST_TIMEOUT_SECS: u64 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("{0} lookup is not configured")]
    NotConfigured(&'static str),
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("lookup request failed: {0}")]
    Request(String),
    #[error("lookup returned status {status}")]
    Status { status: u16 },
    #[error("track not found on platform: {0}")]
    NotFound(String),
    #[error("unexpected lookup response: {0}")]
    Parse(String),
}

impl ErrorCode for LookupError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotConfigured(_) | Self::HttpClientBuild(_) => "E_LOOKUP_CONFIG",
            Self::Request(_) | Self::Status { .. } => "E_LOOKUP_UNAVAILABLE",
            Self::NotFound(_) => "E_LOOKUP_NOT_FOUND",
            Self::Parse(_) => "E_LOOKUP_PARSE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Status { status } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait TrackLookup: Send + Sync {
    async fn lookup(&self, platform: Platform, platform_id: &str) -> Result<TrackMetadata, LookupError>;
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

pub struct HttpTrackLookup {
    http: reqwest::Client,
    youtube_api_key: Option<String>,
    soundcloud_client_id: Option<String>,
}

impl HttpTrackLookup {
    /// # Errors
    ///
    /// Returns `HttpClientBuild` if the TLS backend cannot initialise.
    pub fn new(youtube_api_key: Option<String>, soundcloud_client_id: Option<String>) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| LookupError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, youtube_api_key, soundcloud_client_id })
    }

    async fn youtube(&self, video_id: &str) -> Result<TrackMetadata, LookupError> {
        let key = self.youtube_api_key.as_deref().ok_or(LookupError::NotConfigured("youtube"))?;
        let request = self
            .http
            .get(YOUTUBE_VIDEOS_URL)
            .query(&[("part", "snippet,contentDetails"), ("id", video_id), ("key", key)]);
        let text = send_text(request).await?;
        parse_youtube_response(video_id, &text)
    }

    async fn soundcloud(&self, track_id: &str) -> Result<TrackMetadata, LookupError> {
        let client_id = self
            .soundcloud_client_id
            .as_deref()
            .ok_or(LookupError::NotConfigured("soundcloud"))?;
        let url = format!("{SOUNDCLOUD_TRACKS_URL}/{track_id}");
        let request = self.http.get(url).query(&[("client_id", client_id)]);
        let text = send_text(request).await?;
        parse_soundcloud_response(&text)
    }
}

#[async_trait]
impl TrackLookup for HttpTrackLookup {
    async fn lookup(&self, platform: Platform, platform_id: &str) -> Result<TrackMetadata, LookupError> {
        match platform {
            Platform::YouTube => self.youtube(platform_id).await,
            Platform::SoundCloud => self.soundcloud(platform_id).await,
        }
    }
}

async fn send_text(request: reqwest::RequestBuilder) -> Result<String, LookupError> {
    let response = request.send().await.map_err(|e| LookupError::Request(e.to_string()))?;
    let status = response.status().as_u16();
    if status == 404 {
        return Err(LookupError::NotFound(response.url().path().to_string()));
    }
    if status != 200 {
        return Err(LookupError::Status { status });
    }
    response.text().await.map_err(|e| LookupError::Request(e.to_string()))
}

// =============================================================================
// YOUTUBE WIRE TYPES
// =============================================================================

#[derive(Deserialize)]
struct YtListResponse {
    #[serde(default)]
    items: Vec<YtVideo>,
}

#[derive(Deserialize)]
struct YtVideo {
    snippet: Option<YtSnippet>,
    #[serde(rename = "contentDetails")]
    content_details: Option<YtContentDetails>,
}

#[derive(Deserialize)]
struct YtSnippet {
    title: Option<String>,
    #[serde(rename = "channelTitle")]
    channel_title: Option<String>,
    thumbnails: Option<YtThumbnails>,
}

#[derive(Deserialize)]
struct YtThumbnails {
    high: Option<YtThumbnail>,
    default: Option<YtThumbnail>,
}

#[derive(Deserialize)]
struct YtThumbnail {
    url: String,
}

#[derive(Deserialize)]
struct YtContentDetails {
    duration: Option<String>,
}

pub(crate) fn parse_youtube_response(video_id: &str, text: &str) -> Result<TrackMetadata, LookupError> {
    let body: YtListResponse = serde_json::from_str(text).map_err(|e| LookupError::Parse(e.to_string()))?;
    let video = body
        .items
        .into_iter()
        .next()
        .ok_or_else(|| LookupError::NotFound(video_id.to_string()))?;

    let mut meta = TrackMetadata {
        duration_seconds: video
            .content_details
            .and_then(|c| c.duration)
            .and_then(|d| parse_iso8601_duration(&d)),
        ..TrackMetadata::default()
    };
    if let Some(snippet) = video.snippet {
        meta.title = snippet.title;
        meta.artist = snippet.channel_title;
        meta.artwork_url = snippet.thumbnails.and_then(|t| t.high.or(t.default)).map(|t| t.url);
    }
    Ok(meta)
}

/// Parse a YouTube `contentDetails.duration` such as `PT1H2M3S` into seconds.
///
/// Only the day and time designators YouTube emits are accepted. Values
/// that overflow or exceed `u32` seconds yield `None`.
#[must_use]
pub fn parse_iso8601_duration(raw: &str) -> Option<u32> {
    let rest = raw.strip_prefix('P')?;
    let (date, time) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };
    if date.is_empty() && time.is_none_or(str::is_empty) {
        return None;
    }

    let mut total: u64 = 0;
    for (value, unit) in designators(date)? {
        let scale = match unit {
            'D' => 86_400,
            'W' => 7 * 86_400,
            _ => return None,
        };
        total = total.checked_add(value.checked_mul(scale)?)?;
    }
    if let Some(time) = time {
        if time.is_empty() {
            return None;
        }
        for (value, unit) in designators(time)? {
            let scale = match unit {
                'H' => 3_600,
                'M' => 60,
                'S' => 1,
                _ => return None,
            };
            total = total.checked_add(value.checked_mul(scale)?)?;
        }
    }
    u32::try_from(total).ok()
}

fn designators(part: &str) -> Option<Vec<(u64, char)>> {
    let mut out = Vec::new();
    let mut digits = String::new();
    for ch in part.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else {
            if digits.is_empty() {
                return None;
            }
            out.push((digits.parse().ok()?, ch));
            digits.clear();
        }
    }
    digits.is_empty().then_some(out)
}

// =============================================================================
// SOUNDCLOUD WIRE TYPES
// =============================================================================

#[derive(Deserialize)]
struct ScTrack {
    title: Option<String>,
    user: Option<ScUser>,
    artwork_url: Option<String>,
    /// Milliseconds.
    duration: Option<u64>,
}

#[derive(Deserialize)]
struct ScUser {
    username: Option<String>,
}

pub(crate) fn parse_soundcloud_response(text: &str) -> Result<TrackMetadata, LookupError> {
    let track: ScTrack = serde_json::from_str(text).map_err(|e| LookupError::Parse(e.to_string()))?;
    Ok(TrackMetadata {
        title: track.title,
        artist: track.user.and_then(|u| u.username),
        artwork_url: track.artwork_url,
        duration_seconds: track.duration.and_then(|ms| u32::try_from(ms / 1_000).ok()),
    })
}

#[cfg(test)]
#[path = "metadata_test.rs"]
mod tests;
