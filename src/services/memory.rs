//! In-memory collaborators.
//!
//! Used by the unit tests and the end-to-end suite to run the full
//! coordinator and gateway without Postgres or the platform APIs. Each one
//! behaves like its Postgres or HTTP counterpart at the trait boundary.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use crate::services::metadata::{LookupError, TrackLookup};
use crate::services::persistence::{RoomRecord, RoomStore, StoreError};
use crate::services::playlist::{PlaylistError, PlaylistSource};
use crate::services::room::DeckRecord;
use crate::services::session::{Identity, IdentityProvider};
use crate::track::{Platform, PlaylistSnapshot, Track, TrackMetadata};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// =============================================================================
// ROOM STORE
// =============================================================================

#[derive(Default)]
pub struct MemoryRoomStore {
    rooms: Mutex<HashMap<Uuid, RoomRecord>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryRoomStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room row with no persisted deck.
    pub fn add_room(&self, room_id: Uuid, name: &str, owner_id: Uuid) {
        self.insert(RoomRecord { id: room_id, name: name.to_string(), owner_id, deck: None });
    }

    pub fn insert(&self, record: RoomRecord) {
        lock(&self.rooms).insert(record.id, record);
    }

    #[must_use]
    pub fn deck(&self, room_id: Uuid) -> Option<DeckRecord> {
        lock(&self.rooms).get(&room_id).and_then(|r| r.deck.clone())
    }

    #[must_use]
    pub fn contains(&self, room_id: Uuid) -> bool {
        lock(&self.rooms).contains_key(&room_id)
    }

    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every following `save_deck` fail with a retryable error.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn load_room(&self, room_id: Uuid) -> Result<Option<RoomRecord>, StoreError> {
        Ok(lock(&self.rooms).get(&room_id).cloned())
    }

    async fn save_deck(&self, room_id: Uuid, deck: &DeckRecord) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        if let Some(room) = lock(&self.rooms).get_mut(&room_id) {
            room.deck = Some(deck.clone());
        }
        Ok(())
    }

    async fn delete_room(&self, room_id: Uuid) -> Result<bool, StoreError> {
        Ok(lock(&self.rooms).remove(&room_id).is_some())
    }
}

// =============================================================================
// PLAYLISTS
// =============================================================================

struct StoredPlaylist {
    owner_id: Uuid,
    tracks: Vec<Track>,
}

/// Playlists keyed by id. Only the owner may resolve one.
#[derive(Default)]
pub struct StaticPlaylists {
    playlists: Mutex<HashMap<Uuid, StoredPlaylist>>,
    unavailable: AtomicBool,
}

impl StaticPlaylists {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, playlist_id: Uuid, owner_id: Uuid, tracks: Vec<Track>) {
        lock(&self.playlists).insert(playlist_id, StoredPlaylist { owner_id, tracks });
    }

    /// Create a playlist of `count` YouTube tracks and return its id.
    pub fn add(&self, owner_id: Uuid, count: usize) -> Uuid {
        let playlist_id = Uuid::new_v4();
        let tracks = (0..count)
            .filter_map(|i| {
                let mut track = Track::new(Platform::YouTube, format!("vid{i}")).ok()?;
                track.title = Some(format!("Track {i}"));
                Some(track)
            })
            .collect();
        self.insert(playlist_id, owner_id, tracks);
        playlist_id
    }

    /// Make every following resolve fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl PlaylistSource for StaticPlaylists {
    async fn resolve(&self, playlist_id: Uuid, user_id: Uuid) -> Result<PlaylistSnapshot, PlaylistError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PlaylistError::Database(sqlx::Error::PoolTimedOut));
        }
        let tracks = match lock(&self.playlists).get(&playlist_id) {
            Some(p) if p.owner_id == user_id => p.tracks.clone(),
            _ => return Err(PlaylistError::NotFound(playlist_id)),
        };
        PlaylistSnapshot::new(playlist_id, user_id, tracks).map_err(|_| PlaylistError::Empty(playlist_id))
    }
}

// =============================================================================
// LOOKUP
// =============================================================================

/// A lookup with nothing configured. Every call fails.
pub struct NoLookup;

#[async_trait]
impl TrackLookup for NoLookup {
    async fn lookup(&self, platform: Platform, _platform_id: &str) -> Result<TrackMetadata, LookupError> {
        Err(LookupError::NotConfigured(platform.as_str()))
    }
}

/// Canned metadata per `(platform, platform_id)`. Unknown ids are `NotFound`.
#[derive(Default)]
pub struct StaticLookup {
    entries: HashMap<(Platform, String), TrackMetadata>,
    calls: AtomicUsize,
}

impl StaticLookup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, platform: Platform, platform_id: &str, meta: TrackMetadata) -> Self {
        self.entries.insert((platform, platform_id.to_string()), meta);
        self
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrackLookup for StaticLookup {
    async fn lookup(&self, platform: Platform, platform_id: &str) -> Result<TrackMetadata, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entries
            .get(&(platform, platform_id.to_string()))
            .cloned()
            .ok_or_else(|| LookupError::NotFound(platform_id.to_string()))
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

/// One-time tickets held in memory.
#[derive(Default)]
pub struct StaticIdentity {
    tickets: Mutex<HashMap<String, Identity>>,
}

impl StaticIdentity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a ticket for `identity`, shaped like a real one.
    pub fn issue(&self, identity: Identity) -> String {
        let ticket = Uuid::new_v4().simple().to_string();
        lock(&self.tickets).insert(ticket.clone(), identity);
        ticket
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn authenticate(&self, ticket: &str) -> Result<Option<Identity>, sqlx::Error> {
        Ok(lock(&self.tickets).remove(ticket))
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
