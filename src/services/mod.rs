//! Domain services used by the websocket gateway.
//!
//! ARCHITECTURE
//! ============
//! `room` is the pure state machine. `coordinator` runs one task per live
//! room around it, `registry` finds or starts those tasks, and `directory`
//! enforces one live connection per user. The remaining modules are the
//! collaborators a coordinator calls out to: storage, playlists, track
//! metadata, and ticket authentication.

pub mod coordinator;
pub mod directory;
pub mod memory;
pub mod metadata;
pub mod persistence;
pub mod playlist;
pub mod registry;
pub mod retry;
pub mod room;
pub mod session;
