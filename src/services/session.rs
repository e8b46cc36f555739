//! Session service: turns a one-time WebSocket ticket into a user identity.
//!
//! Tickets are minted elsewhere (the account service) and consumed exactly
//! once here, atomically, at upgrade time.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Length of a ticket as minted: 16 random bytes, hex encoded.
pub const WS_TICKET_LEN: usize = 32;

/// The authenticated user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Consume `ticket`. Returns `None` for unknown, expired, or already
    /// used tickets.
    async fn authenticate(&self, ticket: &str) -> Result<Option<Identity>, sqlx::Error>;
}

/// Cheap shape check so obviously bogus tickets never reach the database.
#[must_use]
pub fn is_well_formed_ticket(ticket: &str) -> bool {
    ticket.len() == WS_TICKET_LEN && ticket.chars().all(|c| c.is_ascii_hexdigit())
}

pub struct PgIdentity {
    pool: PgPool,
}

impl PgIdentity {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityProvider for PgIdentity {
    async fn authenticate(&self, ticket: &str) -> Result<Option<Identity>, sqlx::Error> {
        if !is_well_formed_ticket(ticket) {
            return Ok(None);
        }
        let row = sqlx::query(
            "WITH consumed AS (
                 DELETE FROM ws_tickets WHERE ticket = $1 AND expires_at > now() RETURNING user_id
             )
             SELECT u.id, u.username FROM consumed c JOIN users u ON u.id = c.user_id",
        )
        .bind(ticket)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Identity { user_id: r.get("id"), username: r.get("username") }))
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
