//! Room registry: room id to live coordinator.
//!
//! DESIGN
//! ======
//! Lookups take the read lock. Creation loads the room row outside any
//! lock, then takes the write lock and re-checks, so two connections racing
//! to open the same room end up sharing one coordinator. A coordinator whose
//! worker has stopped (crashed) is replaced on the next resolve and rebuilt
//! from the persisted deck.
//!
//! Rooms stay live when their last member leaves. Only `close` removes one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::coordinator::{self, RoomDeps, RoomHandle};
use crate::services::retry::{RetryError, with_retry};
use crate::services::room::RoomError;

#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<Uuid, RoomHandle>>>,
    deps: RoomDeps,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(deps: RoomDeps) -> Self {
        Self { rooms: Arc::new(RwLock::new(HashMap::new())), deps }
    }

    /// Return the live coordinator for `room_id`, starting one if needed.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` if storage has no such room, `Unavailable` if storage
    /// cannot be reached.
    pub async fn resolve(&self, room_id: Uuid) -> Result<RoomHandle, RoomError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(handle) = rooms.get(&room_id).filter(|h| !h.is_closed()) {
                return Ok(handle.clone());
            }
        }

        let store = self.deps.store.clone();
        let record = with_retry(self.deps.policy.retry, "room.load", || store.load_room(room_id))
            .await
            .map_err(|e| match e {
                RetryError::Failed(e) => RoomError::Unavailable(e.to_string()),
                RetryError::TimedOut { attempts } => {
                    RoomError::Unavailable(format!("room lookup timed out after {attempts} attempt(s)"))
                }
            })?
            .ok_or(RoomError::RoomNotFound(room_id))?;

        let mut rooms = self.rooms.write().await;
        if let Some(handle) = rooms.get(&room_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
            warn!(%room_id, "room coordinator stopped unexpectedly; restarting from persisted deck");
        }
        let handle = coordinator::spawn(record, self.deps.clone());
        rooms.insert(room_id, handle.clone());
        info!(%room_id, live_rooms = rooms.len(), "room opened");
        Ok(handle)
    }

    /// Stop the coordinator and notify its members. Returns `false` if the
    /// room was not live.
    pub async fn close(&self, room_id: Uuid) -> bool {
        let Some(handle) = self.rooms.write().await.remove(&room_id) else {
            return false;
        };
        if let Err(e) = handle.close().await {
            warn!(%room_id, error = %e, "room coordinator already stopped");
        }
        true
    }

    pub async fn live_rooms(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Close every live room. Used on shutdown.
    pub async fn close_all(&self) {
        let handles: Vec<RoomHandle> = self.rooms.write().await.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        futures::future::join_all(handles.iter().map(|h| h.close())).await;
        info!(count, "closed all rooms");
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
