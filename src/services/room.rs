//! Room service — the session store: creation, code sync, chat, fan-out.
//!
//! DESIGN
//! ======
//! Single source of truth for room contents. Freeform rooms are created
//! implicitly on first join; challenge rooms only by a join that carries
//! creation options. Code sync is last-writer-wins per tab — no merge, by
//! contract. Broadcast helpers fan events out to a room's connected clients,
//! with a per-recipient variant for payloads that must be shaped (private
//! tab code never travels to non-owners).

use std::collections::HashMap;

use tracing::info;
use uuid::Uuid;

use crate::event::{Event, json, now_ms};
use crate::state::{
    AppState, CHAT_HISTORY_LIMIT, ChatMessage, Difficulty, RoomMode, RoomState, Tab, UserSession,
};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room not found: {0}")]
    NotFound(String),
    #[error("tab not found: {0}")]
    TabNotFound(String),
    #[error("user not in room")]
    UserNotFound(Uuid),
    #[error("operation not valid for this room mode")]
    WrongMode,
    #[error("message required")]
    EmptyMessage,
}

impl crate::event::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_ROOM_NOT_FOUND",
            Self::TabNotFound(_) => "E_TAB_NOT_FOUND",
            Self::UserNotFound(_) => "E_USER_NOT_FOUND",
            Self::WrongMode => "E_WRONG_MODE",
            Self::EmptyMessage => "E_VALIDATION",
        }
    }
}

/// Who may see a `code-update` for the changed tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeChangeScope {
    /// Public tab: everyone in the room.
    Everyone,
    /// Private tab: only connections belonging to the owning user.
    OwnerOnly(Uuid),
}

// =============================================================================
// CREATION
// =============================================================================

/// Look up or create a freeform room. Idempotent: creation options are
/// ignored when the room already exists.
///
/// # Errors
///
/// Returns [`RoomError::WrongMode`] if the id belongs to a challenge room.
pub fn get_or_create_freeform<'a>(
    rooms: &'a mut HashMap<String, RoomState>,
    room_id: &str,
    joiner_name: &str,
) -> Result<&'a mut RoomState, RoomError> {
    let room = rooms.entry(room_id.to_string()).or_insert_with(|| {
        info!(%room_id, created_by = %joiner_name, "room: created freeform room");
        RoomState::new_freeform(room_id, joiner_name)
    });
    if room.mode != RoomMode::Freeform {
        return Err(RoomError::WrongMode);
    }
    Ok(room)
}

/// Look up or create a challenge room. Creation happens only when the join
/// carries a `difficulty` — that join is the explicit create call; without
/// it, a missing room is an error the client handles by navigating away.
///
/// # Errors
///
/// Returns [`RoomError::NotFound`] for a non-creating join to an absent
/// room, or [`RoomError::WrongMode`] if the id belongs to a freeform room.
pub fn get_or_create_challenge<'a>(
    rooms: &'a mut HashMap<String, RoomState>,
    room_id: &str,
    joiner_name: &str,
    difficulty: Option<Difficulty>,
    room_name: Option<&str>,
) -> Result<&'a mut RoomState, RoomError> {
    if !rooms.contains_key(room_id) {
        let Some(difficulty) = difficulty else {
            return Err(RoomError::NotFound(room_id.to_string()));
        };
        let name = room_name.unwrap_or(room_id);
        info!(%room_id, created_by = %joiner_name, ?difficulty, "room: created challenge room");
        rooms.insert(room_id.to_string(), RoomState::new_challenge(name, joiner_name, difficulty));
    }
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
    if room.mode != RoomMode::Challenge {
        return Err(RoomError::WrongMode);
    }
    Ok(room)
}

// =============================================================================
// CODE SYNC
// =============================================================================

/// Overwrite a tab's code and fan the `code-update` out to the room. Last
/// writer wins — concurrent edits to the same tab clobber each other by
/// contract. The broadcast happens under the same write lock as the
/// mutation, so peers observe updates in apply order.
///
/// # Errors
///
/// Fails when the room or tab is absent, or the room is not freeform.
pub async fn apply_code_change(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    client_id: Uuid,
    tab_id: &str,
    code: &str,
) -> Result<CodeChangeScope, RoomError> {
    let mut rooms = state.rooms.write().await;
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
    if room.mode != RoomMode::Freeform {
        return Err(RoomError::WrongMode);
    }
    let tab = room
        .tab_mut(tab_id)
        .ok_or_else(|| RoomError::TabNotFound(tab_id.to_string()))?;

    tab.code = code.to_string();

    let scope = if tab.is_public {
        CodeChangeScope::Everyone
    } else {
        let owner = tab.created_by.parse::<Uuid>().map_err(|_| RoomError::TabNotFound(tab_id.to_string()))?;
        CodeChangeScope::OwnerOnly(owner)
    };

    let update = Event::named("code-update")
        .with_data("tabId", tab_id)
        .with_data("code", code)
        .with_data("userId", user_id.to_string());
    match scope {
        CodeChangeScope::Everyone => broadcast_room(room, &update, Some(client_id)),
        CodeChangeScope::OwnerOnly(owner) => {
            broadcast_shaped(room, Some(client_id), |uid| (uid == owner).then(|| update.clone()));
        }
    }
    Ok(scope)
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Tabs visible to `user_id`: every public tab plus the user's own private
/// ones. This is the exact tab payload a joiner receives.
#[must_use]
pub fn visible_tabs(room: &RoomState, user_id: Uuid) -> Vec<Tab> {
    let user_key = user_id.to_string();
    room.tabs
        .iter()
        .filter(|t| t.is_public || t.created_by == user_key)
        .cloned()
        .collect()
}

/// All user sessions, connected and disconnected, for presence lists.
#[must_use]
pub fn user_list(room: &RoomState) -> Vec<UserSession> {
    room.users.values().cloned().collect()
}

// =============================================================================
// CHAT
// =============================================================================

/// Append a chat message, keeping the bounded history joiners receive, and
/// broadcast it to the room (sender included) under the mutation lock so
/// everyone sees messages in history order.
///
/// # Errors
///
/// Fails when the room is absent, the sender is not a member, or the
/// trimmed message is empty.
pub async fn append_chat(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    message: &str,
) -> Result<ChatMessage, RoomError> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(RoomError::EmptyMessage);
    }

    let mut rooms = state.rooms.write().await;
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
    let user = room
        .users
        .get(&user_id)
        .ok_or(RoomError::UserNotFound(user_id))?;

    let chat = ChatMessage {
        id: Uuid::new_v4(),
        user_id,
        user_name: user.name.clone(),
        user_color: user.color.clone(),
        message: trimmed.to_string(),
        timestamp: now_ms(),
    };
    room.chat.push(chat.clone());
    if room.chat.len() > CHAT_HISTORY_LIMIT {
        let overflow = room.chat.len() - CHAT_HISTORY_LIMIT;
        room.chat.drain(..overflow);
    }

    let event = Event::named("chat-message").with_data("message", json(&chat));
    broadcast_room(room, &event, None);
    Ok(chat)
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Broadcast an event to all clients in a room, optionally excluding one
/// connection. Callers hold the rooms lock, so fan-out order matches the
/// order mutations were applied.
pub fn broadcast_room(room: &RoomState, event: &Event, exclude: Option<Uuid>) {
    for (client_id, handle) in &room.clients {
        if exclude == Some(*client_id) {
            continue;
        }
        // Best-effort: if a client's channel is full, skip it.
        let _ = handle.tx.try_send(event.clone());
    }
}

/// Per-recipient fan-out: `shape` decides, per receiving user, which event
/// (if any) that user's connections get. This is how private-tab payloads
/// are stripped for non-owners.
pub fn broadcast_shaped<F>(room: &RoomState, exclude: Option<Uuid>, shape: F)
where
    F: Fn(Uuid) -> Option<Event>,
{
    for (client_id, handle) in &room.clients {
        if exclude == Some(*client_id) {
            continue;
        }
        if let Some(event) = shape(handle.user_id) {
            let _ = handle.tx.try_send(event);
        }
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
