//! Server configuration parsed from environment variables.
//!
//! Every numeric setting has a default and falls back to it when the
//! variable is unset or does not parse. Only `DATABASE_URL` is required.

use std::time::Duration;

use crate::services::coordinator::{
    DEFAULT_COMMAND_CAPACITY, DEFAULT_METADATA_TIMEOUT_MS, DEFAULT_RECOVERY_GRACE_SECS, RoomPolicy,
};
use crate::services::retry::{DEFAULT_ATTEMPTS, DEFAULT_RETRY_BASE_MS, DEFAULT_TIMEOUT_MS, RetryPolicy};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_SKIP_GUARD_SECS: u64 = 10;
pub const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub skip_guard_secs: u64,
    pub room_command_capacity: usize,
    pub client_channel_capacity: usize,
    pub recovery_grace_secs: u64,
    pub collaborator_timeout_ms: u64,
    pub collaborator_retries: usize,
    pub collaborator_retry_base_ms: u64,
    pub metadata_timeout_ms: u64,
    pub youtube_api_key: Option<String>,
    pub soundcloud_client_id: Option<String>,
}

impl AppConfig {
    /// Build config from the process environment.
    ///
    /// Required:
    /// - `DATABASE_URL`
    ///
    /// Optional:
    /// - `PORT` (3000), `DB_MAX_CONNECTIONS` (5)
    /// - `ROOM_SKIP_GUARD_SECS` (10), `ROOM_COMMAND_CAPACITY` (256),
    ///   `ROOM_RECOVERY_GRACE_SECS` (30)
    /// - `CLIENT_CHANNEL_CAPACITY` (256)
    /// - `COLLABORATOR_TIMEOUT_MS` (3000), `COLLABORATOR_RETRIES` (2),
    ///   `COLLABORATOR_RETRY_BASE_MS` (50)
    /// - `METADATA_TIMEOUT_MS` (1500)
    /// - `YOUTUBE_API_KEY`, `SOUNDCLOUD_CLIENT_ID`
    ///
    /// # Errors
    ///
    /// `Missing` if `DATABASE_URL` is unset or blank.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as `from_env`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parse = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = parse("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        Ok(Self {
            database_url,
            port: parse_or(&parse, "PORT", DEFAULT_PORT),
            db_max_connections: parse_or(&parse, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            skip_guard_secs: parse_or(&parse, "ROOM_SKIP_GUARD_SECS", DEFAULT_SKIP_GUARD_SECS),
            room_command_capacity: parse_or(&parse, "ROOM_COMMAND_CAPACITY", DEFAULT_COMMAND_CAPACITY).max(1),
            client_channel_capacity: parse_or(&parse, "CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY).max(1),
            recovery_grace_secs: parse_or(&parse, "ROOM_RECOVERY_GRACE_SECS", DEFAULT_RECOVERY_GRACE_SECS),
            collaborator_timeout_ms: parse_or(&parse, "COLLABORATOR_TIMEOUT_MS", DEFAULT_TIMEOUT_MS).max(1),
            collaborator_retries: parse_or(&parse, "COLLABORATOR_RETRIES", DEFAULT_ATTEMPTS).max(1),
            collaborator_retry_base_ms: parse_or(&parse, "COLLABORATOR_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS),
            metadata_timeout_ms: parse_or(&parse, "METADATA_TIMEOUT_MS", DEFAULT_METADATA_TIMEOUT_MS).max(1),
            youtube_api_key: parse("YOUTUBE_API_KEY"),
            soundcloud_client_id: parse("SOUNDCLOUD_CLIENT_ID"),
        })
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.collaborator_retries,
            timeout: self.collaborator_timeout(),
            base_delay_ms: self.collaborator_retry_base_ms,
        }
    }

    #[must_use]
    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    #[must_use]
    pub fn room_policy(&self) -> RoomPolicy {
        RoomPolicy {
            skip_guard_ms: i64::try_from(self.skip_guard_secs.saturating_mul(1_000)).unwrap_or(i64::MAX),
            command_capacity: self.room_command_capacity,
            recovery_grace: Duration::from_secs(self.recovery_grace_secs),
            retry: self.retry_policy(),
            metadata_timeout: Duration::from_millis(self.metadata_timeout_ms),
        }
    }
}

fn parse_or<T>(parse: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    parse(key).and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
