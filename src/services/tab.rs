//! Tab coordinator — ownership and visibility rules over room tabs.
//!
//! DESIGN
//! ======
//! Authorization plus bookkeeping, no independent state: every mutation runs
//! under the rooms write lock and fans its broadcast out before that lock
//! drops, so peers observe tab events in mutation order.
//! Rules enforced here: `main` is immutable (never deleted, never private),
//! only a tab's creator deletes it or toggles its visibility, new tabs are
//! private unless asked otherwise, and deleting a tab reassigns anyone
//! viewing it back to `main`.

use std::collections::HashMap;

use tracing::info;
use uuid::Uuid;

use crate::event::{Event, json};
use crate::services::room::{broadcast_room, broadcast_shaped};
use crate::state::{AppState, MAIN_TAB_ID, RoomMode, RoomState, Tab};

#[derive(Debug, thiserror::Error)]
pub enum TabError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("tab not found: {0}")]
    TabNotFound(String),
    #[error("tab id already in use: {0}")]
    DuplicateTab(String),
    #[error("only the tab's creator may do that")]
    Forbidden,
    #[error("the main tab cannot be deleted or made private")]
    MainTabImmutable,
    #[error("tab name required")]
    EmptyName,
    #[error("user not in room")]
    UserNotFound(Uuid),
    #[error("tabs exist only in freeform rooms")]
    WrongMode,
}

impl crate::event::ErrorCode for TabError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "E_ROOM_NOT_FOUND",
            Self::TabNotFound(_) => "E_TAB_NOT_FOUND",
            Self::DuplicateTab(_) => "E_DUPLICATE_TAB",
            Self::Forbidden => "E_FORBIDDEN",
            Self::MainTabImmutable => "E_MAIN_TAB",
            Self::EmptyName => "E_VALIDATION",
            Self::UserNotFound(_) => "E_USER_NOT_FOUND",
            Self::WrongMode => "E_WRONG_MODE",
        }
    }
}

/// Result of a tab deletion: the replacement active tab and which users were
/// bumped off the deleted tab.
#[derive(Debug)]
pub struct DeleteOutcome {
    pub new_active_tab: String,
    pub reassigned_users: Vec<Uuid>,
}

fn freeform_room<'a>(
    rooms: &'a mut HashMap<String, RoomState>,
    room_id: &str,
) -> Result<&'a mut RoomState, TabError> {
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| TabError::RoomNotFound(room_id.to_string()))?;
    if room.mode != RoomMode::Freeform {
        return Err(TabError::WrongMode);
    }
    Ok(room)
}

// =============================================================================
// CREATE
// =============================================================================

/// Create a tab and announce it to the room. Private by default — sharing
/// is an explicit later step. The client may supply an id; absent one, a
/// fresh uuid is minted. Everyone learns the tab exists, but only the
/// owner's copy of the announcement carries code; the creating connection
/// gets its copy as the direct reply instead.
///
/// # Errors
///
/// Fails on blank names, duplicate ids, absent rooms, and challenge rooms.
pub async fn create_tab(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    client_id: Uuid,
    tab_id: Option<&str>,
    name: &str,
    language: &str,
    is_public: bool,
) -> Result<Tab, TabError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TabError::EmptyName);
    }

    let mut rooms = state.rooms.write().await;
    let room = freeform_room(&mut rooms, room_id)?;
    if !room.users.contains_key(&user_id) {
        return Err(TabError::UserNotFound(user_id));
    }

    let id = tab_id.map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string);
    if room.tab(&id).is_some() {
        return Err(TabError::DuplicateTab(id));
    }

    let tab = Tab {
        id,
        name: name.to_string(),
        language: language.to_string(),
        code: String::new(),
        created_by: user_id.to_string(),
        is_public,
    };
    room.tabs.push(tab.clone());
    info!(%room_id, tab_id = %tab.id, %is_public, "tab: created");

    let full = Event::named("tab-created").with_data("tab", json(&tab));
    let stripped = Event::named("tab-created")
        .with_data("tab", json(&Tab { code: String::new(), ..tab.clone() }));
    broadcast_shaped(room, Some(client_id), |uid| {
        if tab.is_public || uid == user_id { Some(full.clone()) } else { Some(stripped.clone()) }
    });
    Ok(tab)
}

// =============================================================================
// DELETE
// =============================================================================

/// Delete a tab the requester created and broadcast `tab-deleted` to the
/// whole room, requester included — their client may be viewing the dead
/// tab too. Never `main`. Users viewing the deleted tab fall back to
/// `main`, and the room's default view follows.
///
/// # Errors
///
/// Fails when the requester is not the creator, the tab is `main`, or the
/// room/tab is absent.
pub async fn delete_tab(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    tab_id: &str,
) -> Result<DeleteOutcome, TabError> {
    let mut rooms = state.rooms.write().await;
    let room = freeform_room(&mut rooms, room_id)?;

    if tab_id == MAIN_TAB_ID {
        return Err(TabError::MainTabImmutable);
    }
    let tab = room
        .tab(tab_id)
        .ok_or_else(|| TabError::TabNotFound(tab_id.to_string()))?;
    if tab.created_by != user_id.to_string() {
        return Err(TabError::Forbidden);
    }

    room.tabs.retain(|t| t.id != tab_id);
    if room.active_tab == tab_id {
        room.active_tab = MAIN_TAB_ID.to_string();
    }
    let mut reassigned = Vec::new();
    for user in room.users.values_mut() {
        if user.active_tab == tab_id {
            user.active_tab = MAIN_TAB_ID.to_string();
            reassigned.push(user.id);
        }
    }
    info!(%room_id, %tab_id, reassigned = reassigned.len(), "tab: deleted");

    let event = Event::named("tab-deleted")
        .with_data("tabId", tab_id)
        .with_data("newActiveTab", MAIN_TAB_ID);
    broadcast_room(room, &event, None);
    Ok(DeleteOutcome { new_active_tab: MAIN_TAB_ID.to_string(), reassigned_users: reassigned })
}

// =============================================================================
// VISIBILITY
// =============================================================================

/// Toggle a tab's visibility and broadcast `tab-privacy-changed`. Owner-only;
/// `main` stays public. Going public shares the code once; going private
/// only flips the flag — no retraction, and no code to non-owners.
///
/// # Errors
///
/// Fails when the requester is not the creator or the tab is `main`.
pub async fn set_visibility(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    tab_id: &str,
    is_public: bool,
) -> Result<Tab, TabError> {
    let mut rooms = state.rooms.write().await;
    let room = freeform_room(&mut rooms, room_id)?;

    if tab_id == MAIN_TAB_ID {
        return Err(TabError::MainTabImmutable);
    }
    let tab = room
        .tab_mut(tab_id)
        .ok_or_else(|| TabError::TabNotFound(tab_id.to_string()))?;
    if tab.created_by != user_id.to_string() {
        return Err(TabError::Forbidden);
    }

    tab.is_public = is_public;
    info!(%room_id, %tab_id, %is_public, "tab: visibility changed");
    let updated = tab.clone();

    let event = if is_public {
        Event::named("tab-privacy-changed").with_data("tab", json(&updated))
    } else {
        Event::named("tab-privacy-changed").with_data("tabId", tab_id).with_data("isPublic", false)
    };
    broadcast_room(room, &event, None);
    Ok(updated)
}

// =============================================================================
// SWITCH
// =============================================================================

/// Record which tab the requester is viewing and tell their peers. Affects
/// only the requester's own presence record; other users' selections are
/// untouched.
///
/// # Errors
///
/// Fails when the room, tab, or user is absent, or the tab is private to
/// someone else.
pub async fn switch_tab(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    client_id: Uuid,
    tab_id: &str,
) -> Result<(), TabError> {
    let mut rooms = state.rooms.write().await;
    let room = freeform_room(&mut rooms, room_id)?;

    let tab = room
        .tab(tab_id)
        .ok_or_else(|| TabError::TabNotFound(tab_id.to_string()))?;
    if !tab.is_public && tab.created_by != user_id.to_string() {
        return Err(TabError::Forbidden);
    }

    let user = room
        .users
        .get_mut(&user_id)
        .ok_or(TabError::UserNotFound(user_id))?;
    user.active_tab = tab_id.to_string();

    let event = Event::named("user-tab-switched")
        .with_data("userId", user_id.to_string())
        .with_data("tabId", tab_id);
    broadcast_room(room, &event, Some(client_id));
    Ok(())
}

#[cfg(test)]
#[path = "tab_test.rs"]
mod tests;
