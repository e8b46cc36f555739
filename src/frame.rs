//! Wire envelope shared by clients, the gateway, and room coordinators.
//!
//! Three kinds of frame cross the socket:
//! - client requests (`room:join`, `queue:join`, `deck:skip`, ...),
//! - the single `done` or `error` reply to each request, linked by `parent_id`,
//! - pushed events: room broadcasts carry `room_id`, session notices do not.
//!
//! Payloads are a flat JSON object. Error replies always carry `code`,
//! `message` and `retryable` so clients can branch without parsing text.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const KEY_CODE: &str = "code";
const KEY_MESSAGE: &str = "message";
const KEY_RETRYABLE: &str = "retryable";

pub type Data = HashMap<String, serde_json::Value>;

/// Pushed events travel as `Request`; only replies are `Done` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Request,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    /// The request this frame answers. `None` on requests and pushed events.
    pub parent_id: Option<Uuid>,
    /// Epoch milliseconds at construction.
    pub ts: i64,
    /// Set on everything a room coordinator emits and on replies to
    /// requests that named a room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    /// Authenticated sender, stamped by the gateway on inbound requests.
    #[serde(default)]
    pub from: Option<String>,
    /// `prefix:op`, e.g. `deck:finished`.
    pub syscall: String,
    pub status: Status,
    #[serde(default)]
    pub data: Data,
}

/// Stable code and retry hint for errors that reach a client.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// OUTGOING
// =============================================================================

impl Frame {
    fn new(syscall: impl Into<String>, status: Status, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            room_id: None,
            from: None,
            syscall: syscall.into(),
            status,
            data,
        }
    }

    /// A client request, or a session notice pushed by the gateway.
    pub fn request(syscall: impl Into<String>, data: Data) -> Self {
        Self::new(syscall, Status::Request, data)
    }

    /// A broadcast from the coordinator of `room_id`.
    pub fn room_event(room_id: Uuid, syscall: impl Into<String>, data: Data) -> Self {
        let mut frame = Self::new(syscall, Status::Request, data);
        frame.room_id = Some(room_id);
        frame
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// REPLIES
// =============================================================================

impl Frame {
    /// Successful reply with no payload.
    #[must_use]
    pub fn done(&self) -> Self {
        self.answer(Status::Done, Data::new())
    }

    #[must_use]
    pub fn done_with(&self, data: Data) -> Self {
        self.answer(Status::Done, data)
    }

    /// Error reply for gateway-level problems that have no error type,
    /// such as an unknown syscall.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert(KEY_MESSAGE.into(), serde_json::Value::String(message.into()));
        self.answer(Status::Error, data)
    }

    /// Error reply carrying the error's code and retry hint.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(KEY_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(KEY_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(KEY_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        self.answer(Status::Error, data)
    }

    /// Same syscall and room as the request, linked back through `parent_id`.
    fn answer(&self, status: Status, data: Data) -> Self {
        let mut frame = Self::new(self.syscall.clone(), status, data);
        frame.parent_id = Some(self.id);
        frame.room_id = self.room_id;
        frame
    }
}

// =============================================================================
// INCOMING
// =============================================================================

impl Frame {
    /// `room` for `room:join`. A syscall without `:` is all prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        self.syscall.split_once(':').map_or(self.syscall.as_str(), |(prefix, _)| prefix)
    }

    /// `join` for `room:join`.
    #[must_use]
    pub fn op(&self) -> &str {
        self.syscall.split_once(':').map_or("", |(_, op)| op)
    }

    /// A UUID-valued string in `data`. Anything else reads as absent.
    #[must_use]
    pub fn data_uuid(&self, key: &str) -> Option<Uuid> {
        self.data.get(key)?.as_str()?.parse().ok()
    }
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
