//! Room coordinator: one task per live room, sole mutator of its state.
//!
//! ARCHITECTURE
//! ============
//! A `RoomHandle` sends `RoomCommand`s over a bounded channel; the worker
//! applies them one at a time to its `RoomState` and answers through a
//! oneshot. Collaborator calls (playlist resolution, deck writes) are awaited
//! inside the worker, so a command that needs I/O holds back the next command
//! for the same room until it finishes. Other rooms are untouched.
//!
//! Track metadata is filled after resolution, outside its retry deadline and
//! under a budget of its own. A slow platform API only leaves fields empty.
//!
//! COMMIT ORDER
//! ============
//! For each transition the worker
//! 1. validates the room invariants, resetting the room on violation,
//! 2. writes the deck record if the deck or queue changed,
//! 3. pushes the transition's events to the members' outbound channels.
//!
//! Delivery is best-effort: a member whose channel is full misses that
//! frame, and nobody else is held up by it.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::frame::{Frame, now_ms};
use crate::services::metadata::TrackLookup;
use crate::services::persistence::{RoomRecord, RoomStore};
use crate::services::playlist::{PlaylistError, PlaylistSource, fill_metadata};
use crate::services::retry::{RetryError, RetryPolicy, with_retry};
use crate::services::room::{
    Audience, DEFAULT_SKIP_GUARD_MS, DeckCause, Outbound, RoomError, RoomEvent, RoomState, Transition,
};
use crate::services::session::Identity;
use crate::track::{PlaylistSnapshot, Track};

pub const DEFAULT_COMMAND_CAPACITY: usize = 256;
pub const DEFAULT_RECOVERY_GRACE_SECS: u64 = 30;
pub const DEFAULT_METADATA_TIMEOUT_MS: u64 = 1_500;

/// Outbound frame channel of one connection.
pub type ClientTx = mpsc::Sender<Frame>;

type Reply<T> = oneshot::Sender<Result<T, RoomError>>;

// =============================================================================
// POLICY / DEPENDENCIES
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RoomPolicy {
    pub skip_guard_ms: i64,
    pub command_capacity: usize,
    /// How long a restored DJ or queued user has to reconnect after restart.
    pub recovery_grace: Duration,
    pub retry: RetryPolicy,
    /// Per-track budget for metadata lookups after a playlist resolves.
    pub metadata_timeout: Duration,
}

impl Default for RoomPolicy {
    fn default() -> Self {
        Self {
            skip_guard_ms: DEFAULT_SKIP_GUARD_MS,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            recovery_grace: Duration::from_secs(DEFAULT_RECOVERY_GRACE_SECS),
            retry: RetryPolicy::default(),
            metadata_timeout: Duration::from_millis(DEFAULT_METADATA_TIMEOUT_MS),
        }
    }
}

/// Everything a coordinator needs besides its own state.
#[derive(Clone)]
pub struct RoomDeps {
    pub store: Arc<dyn RoomStore>,
    pub playlists: Arc<dyn PlaylistSource>,
    pub lookup: Arc<dyn TrackLookup>,
    pub policy: RoomPolicy,
}

// =============================================================================
// COMMANDS / HANDLE
// =============================================================================

pub enum RoomCommand {
    Join { identity: Identity, client_id: Uuid, tx: ClientTx, reply: Reply<()> },
    Leave { user_id: Uuid, client_id: Uuid, reply: Reply<()> },
    RequestJoinQueue { user_id: Uuid, playlist_id: Uuid, reply: Reply<()> },
    SongFinished { user_id: Uuid, deck_seq: Option<u64>, reply: Reply<()> },
    RequestSkip { user_id: Uuid, reply: Reply<()> },
    Inspect { reply: Reply<RoomState> },
    Close { reply: Reply<()> },
}

/// Cheap, cloneable address of a live room.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: Uuid,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    #[must_use]
    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    /// True once the worker has stopped, whether closed or crashed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// # Errors
    ///
    /// `RoomClosed` if the worker is gone.
    pub async fn join(&self, identity: Identity, client_id: Uuid, tx: ClientTx) -> Result<(), RoomError> {
        self.call(|reply| RoomCommand::Join { identity, client_id, tx, reply }).await
    }

    /// Leave on behalf of `client_id`. A stale connection's leave is ignored.
    ///
    /// # Errors
    ///
    /// `RoomClosed` if the worker is gone.
    pub async fn leave(&self, user_id: Uuid, client_id: Uuid) -> Result<(), RoomError> {
        self.call(|reply| RoomCommand::Leave { user_id, client_id, reply }).await
    }

    /// # Errors
    ///
    /// `NotMember`, `AlreadyActive`, `PlaylistNotFound`, `EmptyPlaylist`,
    /// or `Unavailable` when playlist resolution keeps failing.
    pub async fn request_join_queue(&self, user_id: Uuid, playlist_id: Uuid) -> Result<(), RoomError> {
        self.call(|reply| RoomCommand::RequestJoinQueue { user_id, playlist_id, reply }).await
    }

    /// # Errors
    ///
    /// `RoomClosed` if the worker is gone. Stale signals are not errors.
    pub async fn song_finished(&self, user_id: Uuid, deck_seq: Option<u64>) -> Result<(), RoomError> {
        self.call(|reply| RoomCommand::SongFinished { user_id, deck_seq, reply }).await
    }

    /// # Errors
    ///
    /// `NotDj` or `TooSoon`.
    pub async fn request_skip(&self, user_id: Uuid) -> Result<(), RoomError> {
        self.call(|reply| RoomCommand::RequestSkip { user_id, reply }).await
    }

    /// Clone of the current room state.
    ///
    /// # Errors
    ///
    /// `RoomClosed` if the worker is gone.
    pub async fn inspect(&self) -> Result<RoomState, RoomError> {
        self.call(|reply| RoomCommand::Inspect { reply }).await
    }

    /// Tell members the room is gone and stop the worker.
    ///
    /// # Errors
    ///
    /// `RoomClosed` if the worker already stopped.
    pub async fn close(&self) -> Result<(), RoomError> {
        self.call(|reply| RoomCommand::Close { reply }).await
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> RoomCommand) -> Result<T, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| RoomError::RoomClosed(self.room_id))?;
        rx.await.map_err(|_| RoomError::RoomClosed(self.room_id))?
    }
}

// =============================================================================
// SPAWN
// =============================================================================

/// Start the coordinator for `record`, restoring its persisted deck.
#[must_use]
pub fn spawn(record: RoomRecord, deps: RoomDeps) -> RoomHandle {
    let room_id = record.id;
    let (tx, rx) = mpsc::channel(deps.policy.command_capacity.max(1));

    let mut state = RoomState::new(room_id, record.name, record.owner_id);
    let mut discarded_deck = false;
    if let Some(deck) = record.deck {
        if let Err(e) = state.restore(deck, now_ms()) {
            error!(%room_id, error = %e, "persisted deck failed validation; room starts idle");
            discarded_deck = true;
        }
    }

    info!(%room_id, dj = ?state.current_dj().map(|d| d.user_id), queued = state.queue_ids().len(), "room coordinator started");
    let worker = RoomWorker { room_id, state, clients: HashMap::new(), deps };
    tokio::spawn(worker.run(rx, discarded_deck));

    RoomHandle { room_id, tx }
}

// =============================================================================
// WORKER
// =============================================================================

struct Client {
    client_id: Uuid,
    tx: ClientTx,
}

struct RoomWorker {
    room_id: Uuid,
    state: RoomState,
    /// Membership index: where each member's frames go.
    clients: HashMap<Uuid, Client>,
    deps: RoomDeps,
}

impl RoomWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>, discarded_deck: bool) {
        if discarded_deck {
            self.persist().await;
        }

        let grace = tokio::time::sleep(self.deps.policy.recovery_grace);
        tokio::pin!(grace);
        let mut grace_armed = self.state.has_absent_participants();

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if self.handle(cmd).await.is_break() {
                        break;
                    }
                }
                () = &mut grace, if grace_armed => {
                    grace_armed = false;
                    let t = self.state.expire_absent(now_ms());
                    if !t.is_noop() {
                        info!(room_id = %self.room_id, "reconnect grace expired; dropped absent participants");
                    }
                    self.commit(t).await;
                }
            }
        }
        info!(room_id = %self.room_id, "room coordinator stopped");
    }

    async fn handle(&mut self, cmd: RoomCommand) -> ControlFlow<()> {
        match cmd {
            RoomCommand::Join { identity, client_id, tx, reply } => {
                if let Some(prev) = self.clients.insert(identity.user_id, Client { client_id, tx }) {
                    debug!(room_id = %self.room_id, user_id = %identity.user_id, old = %prev.client_id, new = %client_id, "member connection replaced");
                }
                let t = self.state.join(identity.user_id, &identity.username);
                self.commit(t).await;
                let _ = reply.send(Ok(()));
            }
            RoomCommand::Leave { user_id, client_id, reply } => {
                if self.clients.get(&user_id).is_some_and(|c| c.client_id == client_id) {
                    self.clients.remove(&user_id);
                    let t = self.state.leave(user_id, now_ms());
                    self.commit(t).await;
                } else {
                    debug!(room_id = %self.room_id, %user_id, %client_id, "ignoring leave from a connection that no longer holds the membership");
                }
                let _ = reply.send(Ok(()));
            }
            RoomCommand::RequestJoinQueue { user_id, playlist_id, reply } => {
                let result = self.join_queue(user_id, playlist_id).await;
                let _ = reply.send(result);
            }
            RoomCommand::SongFinished { user_id, deck_seq, reply } => {
                let t = self.state.song_finished(user_id, deck_seq, now_ms());
                if t.is_noop() {
                    debug!(room_id = %self.room_id, %user_id, ?deck_seq, "ignoring stale finished signal");
                }
                self.commit(t).await;
                let _ = reply.send(Ok(()));
            }
            RoomCommand::RequestSkip { user_id, reply } => {
                let result = self.state.request_skip(user_id, now_ms(), self.deps.policy.skip_guard_ms);
                let result = match result {
                    Ok(t) => {
                        self.commit(t).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(Ok(self.state.clone()));
            }
            RoomCommand::Close { reply } => {
                self.announce_closed();
                let _ = reply.send(Ok(()));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn join_queue(&mut self, user_id: Uuid, playlist_id: Uuid) -> Result<(), RoomError> {
        self.state.check_can_queue(user_id)?;

        let playlists = self.deps.playlists.clone();
        let snapshot = with_retry(self.deps.policy.retry, "playlist.resolve", || {
            playlists.resolve(playlist_id, user_id)
        })
        .await
        .map_err(playlist_error)?;
        let snapshot = self.complete_metadata(snapshot).await?;

        let t = self.state.join_queue(user_id, snapshot, now_ms())?;
        self.commit(t).await;
        Ok(())
    }

    /// Fill missing display fields. Lookup failures leave them empty.
    async fn complete_metadata(&self, snapshot: PlaylistSnapshot) -> Result<PlaylistSnapshot, RoomError> {
        if !snapshot.tracks().iter().any(Track::needs_metadata) {
            return Ok(snapshot);
        }
        let (playlist_id, owner_id) = (snapshot.playlist_id, snapshot.owner_id);
        let tracks =
            fill_metadata(self.deps.lookup.as_ref(), snapshot.into_tracks(), self.deps.policy.metadata_timeout).await;
        PlaylistSnapshot::new(playlist_id, owner_id, tracks).map_err(|_| RoomError::EmptyPlaylist)
    }

    async fn commit(&mut self, mut t: Transition) {
        if let Err(e) = self.state.check_invariants(now_ms()) {
            error!(room_id = %self.room_id, error = %e, "room invariant violated; resetting deck");
            t = self.reset().await;
        }
        if t.deck_dirty {
            self.persist().await;
        }
        self.dispatch(t.events);
    }

    /// Clear the deck and queue, keep the members, and resync everyone.
    async fn reset(&mut self) -> Transition {
        let store = self.deps.store.clone();
        let room_id = self.room_id;
        let (name, owner_id) = match with_retry(self.deps.policy.retry, "room.load", || store.load_room(room_id)).await {
            Ok(Some(record)) => (record.name, record.owner_id),
            Ok(None) => {
                warn!(%room_id, "room row missing during reset; keeping cached metadata");
                (self.state.name().to_string(), self.state.owner_id())
            }
            Err(e) => {
                warn!(%room_id, error = %e, "room reload failed during reset; keeping cached metadata");
                (self.state.name().to_string(), self.state.owner_id())
            }
        };
        self.state.reset(name, owner_id)
    }

    async fn persist(&self) {
        let deck = self.state.deck_record();
        let store = self.deps.store.clone();
        let room_id = self.room_id;
        if let Err(e) = with_retry(self.deps.policy.retry, "room.save_deck", || store.save_deck(room_id, &deck)).await {
            error!(%room_id, deck_seq = deck.deck_seq, error = %e, "failed to persist deck");
        }
    }

    fn dispatch(&self, events: Vec<Outbound>) {
        for Outbound { audience, event } in events {
            self.log_event(audience, &event);
            let frame = Frame::room_event(self.room_id, event.syscall(), event.to_data());
            match audience {
                Audience::Room => {
                    for (user_id, client) in &self.clients {
                        self.deliver(*user_id, client, frame.clone());
                    }
                }
                Audience::RoomExcept(skip) => {
                    for (user_id, client) in self.clients.iter().filter(|(id, _)| **id != skip) {
                        self.deliver(*user_id, client, frame.clone());
                    }
                }
                Audience::User(user_id) => {
                    if let Some(client) = self.clients.get(&user_id) {
                        self.deliver(user_id, client, frame);
                    }
                }
            }
        }
    }

    fn deliver(&self, user_id: Uuid, client: &Client, frame: Frame) {
        match client.tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(room_id = %self.room_id, %user_id, client_id = %client.client_id, syscall = %frame.syscall, "client channel full; dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(room_id = %self.room_id, %user_id, client_id = %client.client_id, "client channel closed");
            }
        }
    }

    fn log_event(&self, audience: Audience, event: &RoomEvent) {
        match (audience, event) {
            (Audience::User(user_id), RoomEvent::BecameDj) => {
                info!(room_id = %self.room_id, %user_id, "dj promoted");
            }
            (_, RoomEvent::DeckChanged(view)) if view.cause == DeckCause::Idle => {
                info!(room_id = %self.room_id, deck_seq = view.deck_seq, "room went idle");
            }
            _ => {}
        }
    }

    fn announce_closed(&self) {
        let frame = Frame::room_event(self.room_id, "room:closed", crate::frame::Data::new());
        for (user_id, client) in &self.clients {
            self.deliver(*user_id, client, frame.clone());
        }
        info!(room_id = %self.room_id, members = self.clients.len(), "room closed");
    }
}

fn playlist_error(e: RetryError<PlaylistError>) -> RoomError {
    match e {
        RetryError::Failed(PlaylistError::NotFound(id)) => RoomError::PlaylistNotFound(id),
        RetryError::Failed(PlaylistError::Empty(_)) => RoomError::EmptyPlaylist,
        RetryError::Failed(e @ PlaylistError::Database(_)) => RoomError::Unavailable(e.to_string()),
        RetryError::TimedOut { attempts } => {
            RoomError::Unavailable(format!("playlist lookup timed out after {attempts} attempt(s)"))
        }
    }
}

#[cfg(test)]
#[path = "coordinator_test.rs"]
mod tests;
