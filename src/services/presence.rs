//! Presence service — connection lifecycle, separate from room content.
//!
//! DESIGN
//! ======
//! A user's identity in a room outlives any single websocket connection.
//! Joins carry an optional session token: a token matching a known user in
//! the room resumes that identity (with its tab assignment intact); anything
//! else falls back to a fresh identity, never an error. Transport drops mark
//! the user disconnected and start a grace timer; only explicit leave or
//! grace expiry actually removes the user. Each reconnect bumps the user's
//! disconnect nonce so a stale grace timer can tell it lost the race.

use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::event::Event;
use crate::services::room::broadcast_room;
use crate::state::{AppState, ClientHandle, RoomState, UserSession};

/// Presence colors cycled through as users join a room.
const COLORS: &[&str] = &[
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E9",
    "#F8B739", "#52BE80",
];

/// Identity handed back to the gateway after a join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub user_id: Uuid,
    pub session_token: String,
    pub is_reconnect: bool,
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a cryptographically random 32-byte hex session token.
#[must_use]
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes_to_hex(&bytes)
}

fn assign_color(room: &RoomState) -> String {
    COLORS[room.users.len() % COLORS.len()].to_string()
}

// =============================================================================
// REGISTRATION
// =============================================================================

/// Register a websocket connection in a room, resuming an existing identity
/// when the session token matches a known user, minting a fresh one
/// otherwise. The caller holds the rooms write lock.
pub fn register_connection(
    room: &mut RoomState,
    client_id: Uuid,
    tx: mpsc::Sender<Event>,
    name: &str,
    email: Option<&str>,
    session_token: Option<&str>,
) -> JoinOutcome {
    if let Some(token) = session_token {
        if let Some(user_id) = room.tokens.get(token).copied() {
            if let Some(user) = room.users.get_mut(&user_id) {
                user.disconnected = false;
                user.disconnect_nonce = user.disconnect_nonce.wrapping_add(1);
                user.name = name.to_string();
                if user.email.is_none() {
                    user.email = email.map(ToString::to_string);
                }
                room.clients.insert(client_id, ClientHandle { user_id, tx });
                debug!(%user_id, "presence: reconnected via session token");
                return JoinOutcome {
                    user_id,
                    session_token: token.to_string(),
                    is_reconnect: true,
                };
            }
            // Token pointed at a user that is already gone; drop it and
            // fall through to a fresh identity.
            room.tokens.remove(token);
        }
    }

    let user_id = Uuid::new_v4();
    let token = generate_token();
    let active_tab = room.active_tab.clone();
    room.users.insert(
        user_id,
        UserSession {
            id: user_id,
            name: name.to_string(),
            color: assign_color(room),
            active_tab,
            disconnected: false,
            email: email.map(ToString::to_string),
            disconnect_nonce: 0,
        },
    );
    room.tokens.insert(token.clone(), user_id);
    room.clients.insert(client_id, ClientHandle { user_id, tx });
    JoinOutcome { user_id, session_token: token, is_reconnect: false }
}

// =============================================================================
// DISCONNECT / REMOVAL
// =============================================================================

/// Handle a transport drop: drop the connection handle, mark the user
/// disconnected if this was their last connection, and start a grace timer
/// that removes them unless they reconnect first. Returns the affected user
/// id when a disconnect was actually recorded.
pub async fn mark_disconnected(
    state: &AppState,
    room_id: &str,
    client_id: Uuid,
    grace: Duration,
) -> Option<Uuid> {
    let (user_id, nonce) = {
        let mut rooms = state.rooms.write().await;
        let room = rooms.get_mut(room_id)?;
        let handle = room.clients.remove(&client_id)?;
        let user_id = handle.user_id;

        // Another connection for the same user keeps them present.
        if room.clients.values().any(|c| c.user_id == user_id) {
            return None;
        }
        let user = room.users.get_mut(&user_id)?;
        user.disconnected = true;
        (user_id, user.disconnect_nonce)
    };

    let state = state.clone();
    let room_id = room_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        expire_if_still_gone(&state, &room_id, user_id, nonce).await;
    });
    Some(user_id)
}

/// Grace-timer body: remove the user only if they are still disconnected
/// and the nonce was not bumped by a reconnect in the meantime. The check
/// and the removal share one write-lock critical section; a reconnect
/// cannot slip in between them.
async fn expire_if_still_gone(state: &AppState, room_id: &str, user_id: Uuid, nonce: u64) {
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get(room_id) else {
        return;
    };
    let Some(user) = room.users.get(&user_id) else {
        return;
    };
    if !user.disconnected || user.disconnect_nonce != nonce {
        return;
    }
    info!(%room_id, %user_id, "presence: grace window expired");
    remove_user_locked(&mut rooms, room_id, user_id);
}

/// Remove a user from a room (explicit leave or grace expiry), broadcast
/// `user-left`, and tear the room down when it empties.
pub async fn remove_user(state: &AppState, room_id: &str, user_id: Uuid) {
    let mut rooms = state.rooms.write().await;
    remove_user_locked(&mut rooms, room_id, user_id);
}

fn remove_user_locked(rooms: &mut HashMap<String, RoomState>, room_id: &str, user_id: Uuid) {
    let Some(room) = rooms.get_mut(room_id) else {
        return;
    };
    let Some(user) = room.users.remove(&user_id) else {
        return;
    };
    room.tokens.retain(|_, id| *id != user_id);
    room.clients.retain(|_, c| c.user_id != user_id);

    let left = Event::named("user-left")
        .with_data("userId", user_id.to_string())
        .with_data("userName", user.name);
    broadcast_room(room, &left, None);

    if room.users.is_empty() {
        info!(%room_id, "presence: last user left, tearing room down");
        rooms.remove(room_id);
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
