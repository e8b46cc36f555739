//! Connection directory: at most one live connection per user.
//!
//! A newer connection wins. Registering a user who already has a live
//! connection fires that connection's kick signal; its socket loop sends
//! `session:replaced` and closes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use tracing::info;
use uuid::Uuid;

struct LiveConnection {
    client_id: Uuid,
    kick: oneshot::Sender<()>,
}

#[derive(Clone, Default)]
pub struct ConnectionDirectory {
    inner: Arc<RwLock<HashMap<Uuid, LiveConnection>>>,
}

impl ConnectionDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `client_id` as the user's live connection. The returned
    /// receiver resolves when a newer connection displaces this one.
    pub async fn register(&self, user_id: Uuid, client_id: Uuid) -> oneshot::Receiver<()> {
        let (kick, kicked) = oneshot::channel();
        let previous = self.inner.write().await.insert(user_id, LiveConnection { client_id, kick });
        if let Some(prev) = previous {
            info!(%user_id, old = %prev.client_id, new = %client_id, "displacing older connection");
            let _ = prev.kick.send(());
        }
        kicked
    }

    /// Forget the user's connection, but only if it is still `client_id`.
    pub async fn unregister(&self, user_id: Uuid, client_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        if inner.get(&user_id).is_some_and(|c| c.client_id == client_id) {
            inner.remove(&user_id);
            return true;
        }
        false
    }

    /// Number of users with a live connection.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn current(&self, user_id: Uuid) -> Option<Uuid> {
        self.inner.read().await.get(&user_id).map(|c| c.client_id)
    }
}

#[cfg(test)]
#[path = "directory_test.rs"]
mod tests;
