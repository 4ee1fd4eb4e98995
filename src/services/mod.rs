//! Domain services used by the websocket gateway.
//!
//! ARCHITECTURE
//! ============
//! Service modules own the room-state mutations and the authorization rules
//! around them, so the gateway can stay focused on protocol translation and
//! fan-out. All of them funnel through the rooms write lock in `AppState`.

pub mod challenge;
pub mod presence;
pub mod room;
pub mod stats;
pub mod tab;
