//! Room state machine: DJ rotation, deck cursor, and wait queue.
//!
//! DESIGN
//! ======
//! `RoomState` is plain data with synchronous transitions. Each transition
//! takes the current time explicitly and returns the events it caused,
//! tagged with their audience. The coordinator task owns the only instance
//! for a room and decides how those events reach connections, so every rule
//! here is testable without a runtime.
//!
//! The deck axis has two states: Idle (no DJ) and Playing. Join and Leave of
//! a non-DJ never move it. `deck_seq` increments on every deck change so a
//! client can name the exact track its "finished" signal refers to.
//!
//! INVARIANTS
//! ==========
//! Checked by `check_invariants` after every command:
//! - `is_playing` iff a DJ session exists
//! - a DJ session implies `playback_started_at` is set and not in the future
//! - no user appears twice across queue and deck
//! - the DJ cursor indexes into the DJ's snapshot

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frame::{Data, ErrorCode};
use crate::track::{DjSession, PlaylistSnapshot, QueueEntry, Track};

/// Minimum playback time before the DJ may skip.
pub const DEFAULT_SKIP_GUARD_MS: i64 = 10_000;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("you must join the room first")]
    NotMember(Uuid),
    #[error("you are already DJing or waiting in the queue")]
    AlreadyActive,
    #[error("you are not the current DJ")]
    NotDj,
    #[error("too soon to skip, try again in {remaining_ms}ms")]
    TooSoon { remaining_ms: i64 },
    #[error("room not found: {0}")]
    RoomNotFound(Uuid),
    #[error("playlist not found: {0}")]
    PlaylistNotFound(Uuid),
    #[error("playlist has no tracks")]
    EmptyPlaylist,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("room is closed: {0}")]
    RoomClosed(Uuid),
    #[error("only the room owner can do that")]
    Forbidden,
    #[error("room invariant violated: {0}")]
    Invariant(String),
}

impl ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "E_VALIDATION",
            Self::NotMember(_) => "E_NOT_MEMBER",
            Self::AlreadyActive => "E_ALREADY_ACTIVE",
            Self::NotDj => "E_NOT_DJ",
            Self::TooSoon { .. } => "E_TOO_SOON",
            Self::RoomNotFound(_) => "E_ROOM_NOT_FOUND",
            Self::PlaylistNotFound(_) => "E_PLAYLIST_NOT_FOUND",
            Self::EmptyPlaylist => "E_EMPTY_PLAYLIST",
            Self::Unavailable(_) => "E_UNAVAILABLE",
            Self::RoomClosed(_) => "E_ROOM_CLOSED",
            Self::Forbidden => "E_FORBIDDEN",
            Self::Invariant(_) => "E_INVARIANT",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::TooSoon { .. } | Self::Unavailable(_) | Self::RoomClosed(_))
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Who receives an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Room,
    RoomExcept(Uuid),
    User(Uuid),
}

/// Why the deck changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeckCause {
    Resumed,
    NewDj,
    NextTrack,
    Skipped,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeckView {
    pub is_playing: bool,
    pub track: Option<Track>,
    pub track_index: Option<usize>,
    /// Epoch milliseconds at which the current track started.
    pub started_at: Option<i64>,
    pub current_dj: Option<Uuid>,
    pub deck_seq: u64,
    pub cause: DeckCause,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberView {
    pub user_id: Uuid,
    pub username: String,
}

/// Read-only projection sent to a client on join or resync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomView {
    pub room_id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub deck: DeckView,
    pub members: Vec<MemberView>,
    pub queue: Vec<Uuid>,
    pub is_dj: bool,
    pub in_queue: bool,
    pub queue_position: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    MemberJoined { user_id: Uuid, username: String },
    MemberLeft { user_id: Uuid },
    Snapshot(Box<RoomView>),
    JoinedQueue { position: usize },
    BecameDj,
    NoLongerDj,
    DeckChanged(DeckView),
}

impl RoomEvent {
    #[must_use]
    pub fn syscall(&self) -> &'static str {
        match self {
            Self::MemberJoined { .. } => "room:member_joined",
            Self::MemberLeft { .. } => "room:member_left",
            Self::Snapshot(_) => "room:snapshot",
            Self::JoinedQueue { .. } => "queue:joined",
            Self::BecameDj => "deck:became_dj",
            Self::NoLongerDj => "deck:no_longer_dj",
            Self::DeckChanged(_) => "deck:changed",
        }
    }

    #[must_use]
    pub fn to_data(&self) -> Data {
        let mut data = Data::new();
        match self {
            Self::MemberJoined { user_id, username } => {
                data.insert("user_id".into(), serde_json::json!(user_id));
                data.insert("username".into(), serde_json::json!(username));
            }
            Self::MemberLeft { user_id } => {
                data.insert("user_id".into(), serde_json::json!(user_id));
            }
            Self::Snapshot(view) => {
                data.insert("room".into(), serde_json::to_value(view).unwrap_or_default());
            }
            Self::JoinedQueue { position } => {
                data.insert("position".into(), serde_json::json!(position));
            }
            Self::BecameDj | Self::NoLongerDj => {}
            Self::DeckChanged(deck) => {
                if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(deck) {
                    data.extend(map);
                }
            }
        }
        data
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub audience: Audience,
    pub event: RoomEvent,
}

/// Events produced by one transition, plus whether the crash-recoverable
/// fields (DJ, cursor, queue) changed and need writing.
#[derive(Debug, Default)]
pub struct Transition {
    pub events: Vec<Outbound>,
    pub deck_dirty: bool,
}

impl Transition {
    fn push(&mut self, audience: Audience, event: RoomEvent) {
        self.events.push(Outbound { audience, event });
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.events.is_empty() && !self.deck_dirty
    }
}

// =============================================================================
// DURABLE RECORD
// =============================================================================

/// The crash-recoverable slice of a room: who is on the deck and who waits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeckRecord {
    pub current_dj: Option<DjSession>,
    pub playback_started_at: Option<i64>,
    pub queue: Vec<QueueEntry>,
    #[serde(default)]
    pub deck_seq: u64,
}

// =============================================================================
// ROOM STATE
// =============================================================================

#[derive(Debug, Clone)]
struct Member {
    user_id: Uuid,
    username: String,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    room_id: Uuid,
    name: String,
    owner_id: Uuid,
    /// Connected users in join order.
    members: Vec<Member>,
    current_dj: Option<DjSession>,
    is_playing: bool,
    playback_started_at: Option<i64>,
    queue: VecDeque<QueueEntry>,
    deck_seq: u64,
}

impl RoomState {
    #[must_use]
    pub fn new(room_id: Uuid, name: impl Into<String>, owner_id: Uuid) -> Self {
        Self {
            room_id,
            name: name.into(),
            owner_id,
            members: Vec::new(),
            current_dj: None,
            is_playing: false,
            playback_started_at: None,
            queue: VecDeque::new(),
            deck_seq: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    #[must_use]
    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_member(&self, user_id: Uuid) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }

    #[must_use]
    pub fn member_ids(&self) -> Vec<Uuid> {
        self.members.iter().map(|m| m.user_id).collect()
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn current_dj(&self) -> Option<&DjSession> {
        self.current_dj.as_ref()
    }

    #[must_use]
    pub fn is_dj(&self, user_id: Uuid) -> bool {
        self.current_dj.as_ref().is_some_and(|dj| dj.user_id == user_id)
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    #[must_use]
    pub fn playback_started_at(&self) -> Option<i64> {
        self.playback_started_at
    }

    #[must_use]
    pub fn queue_ids(&self) -> Vec<Uuid> {
        self.queue.iter().map(|e| e.user_id).collect()
    }

    #[must_use]
    pub fn queue_position(&self, user_id: Uuid) -> Option<usize> {
        self.queue.iter().position(|e| e.user_id == user_id)
    }

    #[must_use]
    pub fn deck_seq(&self) -> u64 {
        self.deck_seq
    }

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    /// Add a user to the roster (if absent) and hand them a full view.
    /// Never touches the deck.
    pub fn join(&mut self, user_id: Uuid, username: &str) -> Transition {
        let mut t = Transition::default();
        if !self.is_member(user_id) {
            self.members.push(Member { user_id, username: username.to_owned() });
            t.push(
                Audience::RoomExcept(user_id),
                RoomEvent::MemberJoined { user_id, username: username.to_owned() },
            );
        }
        t.push(Audience::User(user_id), RoomEvent::Snapshot(Box::new(self.view_for(user_id))));
        t
    }

    /// Remove a user from the roster, their queue entry, and the deck.
    /// A departing DJ hands the deck on immediately.
    pub fn leave(&mut self, user_id: Uuid, now: i64) -> Transition {
        let mut t = Transition::default();
        let Some(idx) = self.members.iter().position(|m| m.user_id == user_id) else {
            return t;
        };
        self.members.remove(idx);
        t.push(Audience::RoomExcept(user_id), RoomEvent::MemberLeft { user_id });

        if let Some(pos) = self.queue_position(user_id) {
            self.queue.remove(pos);
            t.deck_dirty = true;
        }
        if self.is_dj(user_id) {
            self.advance_dj(now, &mut t);
        }
        t
    }

    // -------------------------------------------------------------------------
    // Queue
    // -------------------------------------------------------------------------

    /// Validate a queue request before the playlist is resolved.
    ///
    /// # Errors
    ///
    /// `NotMember` if the user has not joined, `AlreadyActive` if they are
    /// on the deck or already queued.
    pub fn check_can_queue(&self, user_id: Uuid) -> Result<(), RoomError> {
        if !self.is_member(user_id) {
            return Err(RoomError::NotMember(user_id));
        }
        if self.is_dj(user_id) || self.queue_position(user_id).is_some() {
            return Err(RoomError::AlreadyActive);
        }
        Ok(())
    }

    /// Commit a resolved playlist snapshot. An idle room with an empty queue
    /// puts the requester straight on the deck.
    ///
    /// # Errors
    ///
    /// Same as `check_can_queue`, plus `EmptyPlaylist` for a snapshot with
    /// no tracks.
    pub fn join_queue(&mut self, user_id: Uuid, playlist: PlaylistSnapshot, now: i64) -> Result<Transition, RoomError> {
        self.check_can_queue(user_id)?;
        if playlist.is_empty() {
            return Err(RoomError::EmptyPlaylist);
        }

        let mut t = Transition { deck_dirty: true, ..Transition::default() };
        let entry = QueueEntry { user_id, playlist };

        if self.current_dj.is_none() && self.queue.is_empty() {
            self.promote(entry, now, &mut t);
        } else {
            self.queue.push_back(entry);
            let position = self.queue.len() - 1;
            t.push(Audience::User(user_id), RoomEvent::JoinedQueue { position });
        }
        Ok(t)
    }

    // -------------------------------------------------------------------------
    // Deck
    // -------------------------------------------------------------------------

    /// The DJ's client reports that the current track ended.
    ///
    /// Ignored unless `user_id` holds the deck and it is playing. When the
    /// signal names a `deck_seq`, it must be the current one; anything else
    /// is a late duplicate for a track that already moved on.
    pub fn song_finished(&mut self, user_id: Uuid, deck_seq: Option<u64>, now: i64) -> Transition {
        let mut t = Transition::default();
        if !self.is_playing || !self.is_dj(user_id) {
            return t;
        }
        if deck_seq.is_some_and(|seq| seq != self.deck_seq) {
            return t;
        }
        self.next_track(now, DeckCause::NextTrack, &mut t);
        t
    }

    /// The DJ asks to cut the current track short.
    ///
    /// # Errors
    ///
    /// `NotDj` unless `user_id` holds the deck; `TooSoon` while less than
    /// `guard_ms` of the track has played.
    pub fn request_skip(&mut self, user_id: Uuid, now: i64, guard_ms: i64) -> Result<Transition, RoomError> {
        if !self.is_playing || !self.is_dj(user_id) {
            return Err(RoomError::NotDj);
        }
        let started = self.playback_started_at.unwrap_or(now);
        let elapsed = now.saturating_sub(started);
        if elapsed < guard_ms {
            return Err(RoomError::TooSoon { remaining_ms: guard_ms - elapsed });
        }
        let mut t = Transition::default();
        self.next_track(now, DeckCause::Skipped, &mut t);
        Ok(t)
    }

    fn next_track(&mut self, now: i64, cause: DeckCause, t: &mut Transition) {
        let advanced = self.current_dj.as_mut().is_some_and(DjSession::advance);
        if !advanced {
            self.advance_dj(now, t);
            return;
        }
        self.playback_started_at = Some(now);
        self.deck_seq += 1;
        t.deck_dirty = true;
        t.push(Audience::Room, RoomEvent::DeckChanged(self.deck_view(cause)));
    }

    /// Retire the current DJ (if any) and hand the deck to the head of the
    /// queue, or go idle when nobody is waiting.
    fn advance_dj(&mut self, now: i64, t: &mut Transition) {
        t.deck_dirty = true;
        if let Some(outgoing) = self.current_dj.take() {
            t.push(Audience::User(outgoing.user_id), RoomEvent::NoLongerDj);
        }
        if let Some(next) = self.queue.pop_front() {
            self.promote(next, now, t);
            return;
        }
        self.is_playing = false;
        self.playback_started_at = None;
        self.deck_seq += 1;
        t.push(Audience::Room, RoomEvent::DeckChanged(self.deck_view(DeckCause::Idle)));
    }

    fn promote(&mut self, entry: QueueEntry, now: i64, t: &mut Transition) {
        let user_id = entry.user_id;
        self.current_dj = Some(DjSession::start(user_id, entry.playlist));
        self.is_playing = true;
        self.playback_started_at = Some(now);
        self.deck_seq += 1;
        t.push(Audience::User(user_id), RoomEvent::BecameDj);
        t.push(Audience::Room, RoomEvent::DeckChanged(self.deck_view(DeckCause::NewDj)));
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Load a persisted deck into an otherwise fresh room.
    ///
    /// # Errors
    ///
    /// Returns `Invariant` and leaves the room idle if the record is
    /// inconsistent.
    pub fn restore(&mut self, record: DeckRecord, now: i64) -> Result<(), RoomError> {
        self.is_playing = record.current_dj.is_some();
        self.current_dj = record.current_dj;
        self.playback_started_at = record.playback_started_at;
        self.queue = record.queue.into();
        self.deck_seq = record.deck_seq;

        if let Err(e) = self.check_invariants(now) {
            self.clear_deck();
            return Err(e);
        }
        Ok(())
    }

    /// Whether a restored deck references users who have not reconnected.
    #[must_use]
    pub fn has_absent_participants(&self) -> bool {
        let dj_absent = self.current_dj.as_ref().is_some_and(|dj| !self.is_member(dj.user_id));
        dj_absent || self.queue.iter().any(|e| !self.is_member(e.user_id))
    }

    /// Drop queue entries and the DJ whose users never came back after a
    /// restart.
    pub fn expire_absent(&mut self, now: i64) -> Transition {
        let mut t = Transition::default();
        let before = self.queue.len();
        let present: HashSet<Uuid> = self.members.iter().map(|m| m.user_id).collect();
        self.queue.retain(|e| present.contains(&e.user_id));
        if self.queue.len() != before {
            t.deck_dirty = true;
        }
        if self.current_dj.as_ref().is_some_and(|dj| !present.contains(&dj.user_id)) {
            self.advance_dj(now, &mut t);
        }
        t
    }

    /// Drop the deck and queue, keep the roster, and resync every member.
    pub fn reset(&mut self, name: String, owner_id: Uuid) -> Transition {
        self.name = name;
        self.owner_id = owner_id;
        self.clear_deck();
        self.deck_seq += 1;

        let mut t = Transition { deck_dirty: true, ..Transition::default() };
        for user_id in self.member_ids() {
            t.push(Audience::User(user_id), RoomEvent::Snapshot(Box::new(self.view_for(user_id))));
        }
        t
    }

    fn clear_deck(&mut self) {
        self.current_dj = None;
        self.is_playing = false;
        self.playback_started_at = None;
        self.queue.clear();
    }

    #[must_use]
    pub fn deck_record(&self) -> DeckRecord {
        DeckRecord {
            current_dj: self.current_dj.clone(),
            playback_started_at: self.playback_started_at,
            queue: self.queue.iter().cloned().collect(),
            deck_seq: self.deck_seq,
        }
    }

    // -------------------------------------------------------------------------
    // Invariants
    // -------------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns `Invariant` describing the first broken rule.
    pub fn check_invariants(&self, now: i64) -> Result<(), RoomError> {
        if self.is_playing != self.current_dj.is_some() {
            return Err(RoomError::Invariant(format!(
                "is_playing={} but dj present={}",
                self.is_playing,
                self.current_dj.is_some()
            )));
        }
        if let Some(dj) = &self.current_dj {
            match self.playback_started_at {
                None => return Err(RoomError::Invariant("dj present without playback_started_at".into())),
                Some(started) if started > now => {
                    return Err(RoomError::Invariant(format!("playback_started_at {started} is after now {now}")));
                }
                Some(_) => {}
            }
            if !dj.cursor_is_valid() {
                return Err(RoomError::Invariant(format!(
                    "dj cursor {} outside snapshot of {}",
                    dj.current_index,
                    dj.playlist.len()
                )));
            }
        }

        let mut seen = HashSet::new();
        if let Some(dj) = &self.current_dj {
            seen.insert(dj.user_id);
        }
        for entry in &self.queue {
            if !seen.insert(entry.user_id) {
                return Err(RoomError::Invariant(format!("user {} appears twice on deck/queue", entry.user_id)));
            }
            if entry.playlist.is_empty() {
                return Err(RoomError::Invariant(format!("queued user {} has an empty snapshot", entry.user_id)));
            }
        }

        let mut roster = HashSet::new();
        if !self.members.iter().all(|m| roster.insert(m.user_id)) {
            return Err(RoomError::Invariant("duplicate user in roster".into()));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Views
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn deck_view(&self, cause: DeckCause) -> DeckView {
        let dj = self.current_dj.as_ref();
        DeckView {
            is_playing: self.is_playing,
            track: dj.and_then(DjSession::current_track).cloned(),
            track_index: dj.map(|d| d.current_index),
            started_at: self.playback_started_at,
            current_dj: dj.map(|d| d.user_id),
            deck_seq: self.deck_seq,
            cause,
        }
    }

    #[must_use]
    pub fn view_for(&self, user_id: Uuid) -> RoomView {
        let queue_position = self.queue_position(user_id);
        RoomView {
            room_id: self.room_id,
            name: self.name.clone(),
            owner_id: self.owner_id,
            deck: self.deck_view(if self.is_playing { DeckCause::Resumed } else { DeckCause::Idle }),
            members: self
                .members
                .iter()
                .map(|m| MemberView { user_id: m.user_id, username: m.username.clone() })
                .collect(),
            queue: self.queue_ids(),
            is_dj: self.is_dj(user_id),
            in_queue: queue_position.is_some(),
            queue_position,
        }
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
