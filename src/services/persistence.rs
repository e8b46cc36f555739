//! Persistence service: room metadata and crash-recoverable deck state.
//!
//! DESIGN
//! ======
//! Postgres is only a recovery source. The live room coordinator is the
//! authority for deck and queue state; after each change to either it
//! writes the whole `DeckRecord` as one JSON column so a restarted process
//! can rebuild the room without replaying events.
//!
//! ERROR HANDLING
//! ==============
//! A deck column that no longer decodes is logged and treated as absent.
//! The room opens idle instead of refusing to open.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::frame::ErrorCode;
use crate::services::room::DeckRecord;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("deck encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
            Self::Encode(_) => "E_ENCODE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Durable room metadata plus the last persisted deck.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub deck: Option<DeckRecord>,
}

#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn load_room(&self, room_id: Uuid) -> Result<Option<RoomRecord>, StoreError>;

    async fn save_deck(&self, room_id: Uuid, deck: &DeckRecord) -> Result<(), StoreError>;

    /// Remove the room row. Returns `false` if it did not exist.
    async fn delete_room(&self, room_id: Uuid) -> Result<bool, StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgRoomStore {
    pool: PgPool,
}

impl PgRoomStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoomStore for PgRoomStore {
    async fn load_room(&self, room_id: Uuid) -> Result<Option<RoomRecord>, StoreError> {
        let row = sqlx::query("SELECT id, name, owner_id, deck FROM rooms WHERE id = $1")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| {
            let deck = r
                .get::<Option<serde_json::Value>, _>("deck")
                .and_then(|raw| decode_deck(room_id, raw));
            RoomRecord { id: r.get("id"), name: r.get("name"), owner_id: r.get("owner_id"), deck }
        }))
    }

    async fn save_deck(&self, room_id: Uuid, deck: &DeckRecord) -> Result<(), StoreError> {
        let value = serde_json::to_value(deck)?;
        sqlx::query("UPDATE rooms SET deck = $2, updated_at = now() WHERE id = $1")
            .bind(room_id)
            .bind(&value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_room(&self, room_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM rooms WHERE id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

pub(crate) fn decode_deck(room_id: Uuid, raw: serde_json::Value) -> Option<DeckRecord> {
    if raw.is_null() {
        return None;
    }
    match serde_json::from_value::<DeckRecord>(raw) {
        Ok(deck) => Some(deck),
        Err(e) => {
            warn!(%room_id, error = %e, "stored deck did not decode; opening room idle");
            None
        }
    }
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
