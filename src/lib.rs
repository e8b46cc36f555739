//! Room playback and DJ rotation coordinator.
//!
//! Each live room is owned by one coordinator task; websocket connections
//! talk to it through `services::coordinator::RoomHandle`.

pub mod config;
pub mod db;
pub mod frame;
pub mod routes;
pub mod services;
pub mod state;
pub mod track;
