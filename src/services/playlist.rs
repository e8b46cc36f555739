//! Playlist source: resolves a playlist id into an immutable snapshot.
//!
//! DESIGN
//! ======
//! Resolution only reads the playlist and its songs in `position` order.
//! Missing display fields are filled afterwards by `fill_metadata`, which the
//! room coordinator runs outside the resolution deadline. Lookups run
//! concurrently under their own timeout, and a failed lookup leaves that
//! track's unknown fields empty. Only a missing playlist, an empty playlist,
//! or a database failure fails resolution.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::frame::ErrorCode;
use crate::services::metadata::TrackLookup;
use crate::track::{Platform, PlaylistSnapshot, Track};

#[derive(Debug, thiserror::Error)]
pub enum PlaylistError {
    #[error("playlist not found: {0}")]
    NotFound(Uuid),
    #[error("playlist has no playable tracks: {0}")]
    Empty(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for PlaylistError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_PLAYLIST_NOT_FOUND",
            Self::Empty(_) => "E_EMPTY_PLAYLIST",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

#[async_trait]
pub trait PlaylistSource: Send + Sync {
    /// Snapshot `playlist_id` as seen by `user_id`, who must own it.
    async fn resolve(&self, playlist_id: Uuid, user_id: Uuid) -> Result<PlaylistSnapshot, PlaylistError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgPlaylistSource {
    pool: PgPool,
}

impl PgPlaylistSource {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlaylistSource for PgPlaylistSource {
    async fn resolve(&self, playlist_id: Uuid, user_id: Uuid) -> Result<PlaylistSnapshot, PlaylistError> {
        let owned = sqlx::query("SELECT id FROM playlists WHERE id = $1 AND owner_id = $2")
            .bind(playlist_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        if owned.is_none() {
            return Err(PlaylistError::NotFound(playlist_id));
        }

        let rows = sqlx::query(
            "SELECT platform, platform_id, title, artist, artwork_url, duration_seconds
             FROM playlist_songs WHERE playlist_id = $1 ORDER BY position",
        )
        .bind(playlist_id)
        .fetch_all(&self.pool)
        .await?;

        let tracks: Vec<Track> = rows
            .iter()
            .filter_map(|r| {
                let platform: String = r.get("platform");
                let platform_id: String = r.get("platform_id");
                let duration: Option<i32> = r.get("duration_seconds");
                let song = StoredSong {
                    platform,
                    platform_id,
                    title: r.get("title"),
                    artist: r.get("artist"),
                    artwork_url: r.get("artwork_url"),
                    duration_seconds: duration.and_then(|d| u32::try_from(d).ok()),
                };
                song.into_track(playlist_id)
            })
            .collect();

        PlaylistSnapshot::new(playlist_id, user_id, tracks).map_err(|_| PlaylistError::Empty(playlist_id))
    }
}

/// One `playlist_songs` row before validation.
pub(crate) struct StoredSong {
    pub platform: String,
    pub platform_id: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub artwork_url: Option<String>,
    pub duration_seconds: Option<u32>,
}

impl StoredSong {
    /// Rows with an unknown platform or blank id are skipped, not fatal.
    pub(crate) fn into_track(self, playlist_id: Uuid) -> Option<Track> {
        let Some(platform) = Platform::parse(&self.platform) else {
            warn!(%playlist_id, platform = %self.platform, "skipping song on unknown platform");
            return None;
        };
        let mut track = match Track::new(platform, self.platform_id) {
            Ok(track) => track,
            Err(e) => {
                warn!(%playlist_id, error = %e, "skipping song");
                return None;
            }
        };
        track.title = self.title.filter(|s| !s.trim().is_empty());
        track.artist = self.artist.filter(|s| !s.trim().is_empty());
        track.artwork_url = self.artwork_url.filter(|s| !s.trim().is_empty());
        track.duration_seconds = self.duration_seconds;
        Some(track)
    }
}

/// Fill unknown fields on every track that needs them. Never fails.
pub async fn fill_metadata(lookup: &dyn TrackLookup, tracks: Vec<Track>, timeout: Duration) -> Vec<Track> {
    let futures = tracks.into_iter().map(|mut track| async move {
        if !track.needs_metadata() {
            return track;
        }
        let result = tokio::time::timeout(timeout, lookup.lookup(track.platform, &track.platform_id)).await;
        match result {
            Ok(Ok(meta)) => track.merge_metadata(meta),
            Ok(Err(e)) => {
                debug!(platform = track.platform.as_str(), platform_id = %track.platform_id, error = %e, "metadata lookup failed");
            }
            Err(_) => {
                warn!(platform = track.platform.as_str(), platform_id = %track.platform_id, "metadata lookup timed out");
            }
        }
        track
    });
    futures::future::join_all(futures).await
}

#[cfg(test)]
#[path = "playlist_test.rs"]
mod tests;
