//! Track, playlist snapshot, and DJ session value types.
//!
//! DESIGN
//! ======
//! A playlist is captured by value when a user enters the queue or takes the
//! deck. Edits the owner makes to the live playlist afterwards never reach a
//! turn that is already queued or playing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    YouTube,
    SoundCloud,
}

impl Platform {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::YouTube => "youtube",
            Self::SoundCloud => "soundcloud",
        }
    }

    /// Parse the stored column value. Accepts the legacy capitalised names.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "youtube" | "YouTube" => Some(Self::YouTube),
            "soundcloud" | "SoundCloud" => Some(Self::SoundCloud),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrackError {
    #[error("track is missing a platform id")]
    MissingPlatformId,
    #[error("playlist has no tracks")]
    EmptyPlaylist,
}

/// Immutable reference to one song on a platform, with best-effort metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub platform: Platform,
    pub platform_id: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub artwork_url: Option<String>,
    pub duration_seconds: Option<u32>,
}

impl Track {
    /// Build a track with no metadata yet.
    ///
    /// # Errors
    ///
    /// Returns `MissingPlatformId` if the id is blank.
    pub fn new(platform: Platform, platform_id: impl Into<String>) -> Result<Self, TrackError> {
        let platform_id = platform_id.into().trim().to_string();
        if platform_id.is_empty() {
            return Err(TrackError::MissingPlatformId);
        }
        Ok(Self { platform, platform_id, title: None, artist: None, artwork_url: None, duration_seconds: None })
    }

    /// True when any display field is still unknown.
    #[must_use]
    pub fn needs_metadata(&self) -> bool {
        self.title.is_none() || self.artist.is_none() || self.artwork_url.is_none() || self.duration_seconds.is_none()
    }

    /// Fill unknown fields from looked-up metadata. Known fields are kept.
    pub fn merge_metadata(&mut self, meta: TrackMetadata) {
        if self.title.is_none() {
            self.title = meta.title;
        }
        if self.artist.is_none() {
            self.artist = meta.artist;
        }
        if self.artwork_url.is_none() {
            self.artwork_url = meta.artwork_url;
        }
        if self.duration_seconds.is_none() {
            self.duration_seconds = meta.duration_seconds;
        }
    }
}

/// Metadata returned by an external platform lookup. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub artwork_url: Option<String>,
    pub duration_seconds: Option<u32>,
}

// =============================================================================
// PLAYLIST SNAPSHOT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistSnapshot {
    pub playlist_id: Uuid,
    pub owner_id: Uuid,
    tracks: Vec<Track>,
}

impl PlaylistSnapshot {
    /// # Errors
    ///
    /// Returns `EmptyPlaylist` if `tracks` is empty.
    pub fn new(playlist_id: Uuid, owner_id: Uuid, tracks: Vec<Track>) -> Result<Self, TrackError> {
        if tracks.is_empty() {
            return Err(TrackError::EmptyPlaylist);
        }
        Ok(Self { playlist_id, owner_id, tracks })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    #[must_use]
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    #[must_use]
    pub fn into_tracks(self) -> Vec<Track> {
        self.tracks
    }
}

// =============================================================================
// DJ SESSION / QUEUE ENTRY
// =============================================================================

/// The user on the deck, their snapshot, and the cursor into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DjSession {
    pub user_id: Uuid,
    pub playlist: PlaylistSnapshot,
    pub current_index: usize,
}

impl DjSession {
    #[must_use]
    pub fn start(user_id: Uuid, playlist: PlaylistSnapshot) -> Self {
        Self { user_id, playlist, current_index: 0 }
    }

    #[must_use]
    pub fn current_track(&self) -> Option<&Track> {
        self.playlist.get(self.current_index)
    }

    /// Move to the next track. Returns `false` once the snapshot is exhausted,
    /// leaving the cursor untouched so the session can be retired.
    pub fn advance(&mut self) -> bool {
        let next = self.current_index + 1;
        if next >= self.playlist.len() {
            return false;
        }
        self.current_index = next;
        true
    }

    #[must_use]
    pub fn cursor_is_valid(&self) -> bool {
        self.current_index < self.playlist.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub user_id: Uuid,
    pub playlist: PlaylistSnapshot,
}

#[cfg(test)]
#[path = "track_test.rs"]
mod tests;
