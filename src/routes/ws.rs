//! WebSocket handler — the realtime gateway.
//!
//! DESIGN
//! ======
//! On upgrade, generates a client id and enters a `select!` loop:
//! - Incoming client events → parse + dispatch by event name
//! - Events fanned out by room peers → forward to the client
//!
//! Handler functions validate, call into the services, and return the events
//! owed to the sender; the services fan broadcasts out to peers under the
//! room lock they mutate with, so per-room event order follows mutation
//! order.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → wait for a `join-room` / `join-dsa-room` event
//! 2. Join → personalized snapshot to the joiner, presence delta to peers
//! 3. Room events → dispatch → reply and/or broadcast
//! 4. Transport drop → `user-disconnected` + grace timer; explicit
//!    `leave-room` → `user-left` + teardown when the room empties

use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event::{Event, FIELD_CODE, json};
use crate::services::{challenge, presence, room, tab};
use crate::state::{AppState, Difficulty, RoomMode};

const CLIENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_GRACE_WINDOW_SECS: u64 = 60;

/// The room and identity a connection has joined. One logical channel per
/// room per client.
pub(crate) struct Membership {
    pub room_id: String,
    pub user_id: Uuid,
}

fn grace_window() -> Duration {
    let secs = std::env::var("GRACE_WINDOW_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_GRACE_WINDOW_SECS);
    Duration::from_secs(secs)
}

fn validation_error(message: &str) -> Event {
    Event::error(message).with_data(FIELD_CODE, "E_VALIDATION")
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for events fanned out by room peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Event>(CLIENT_CHANNEL_CAPACITY);

    info!(%client_id, "ws: client connected");

    let mut membership: Option<Membership> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies =
                            process_event(&state, &mut membership, client_id, &client_tx, &text).await;
                        for event in replies {
                            if send_event(&mut socket, &event).await.is_err() {
                                return handle_drop(&state, membership, client_id).await;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = client_rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    handle_drop(&state, membership, client_id).await;
}

/// Transport drop: surfaced to peers as a presence change, never an error.
async fn handle_drop(state: &AppState, membership: Option<Membership>, client_id: Uuid) {
    info!(%client_id, "ws: client disconnected");
    let Some(membership) = membership else { return };

    let Some(user_id) =
        presence::mark_disconnected(state, &membership.room_id, client_id, grace_window()).await
    else {
        return;
    };
    announce_disconnect(state, &membership.room_id, user_id).await;
}

/// Tell a room's peers one of them dropped. The user stays listed (flagged
/// disconnected) until their grace window runs out.
async fn announce_disconnect(state: &AppState, room_id: &str, user_id: Uuid) {
    let rooms = state.rooms.read().await;
    if let Some(room_state) = rooms.get(room_id) {
        let name = room_state.users.get(&user_id).map(|u| u.name.clone()).unwrap_or_default();
        let event = Event::named("user-disconnected")
            .with_data("userId", user_id.to_string())
            .with_data("userName", name);
        room::broadcast_room(room_state, &event, None);
    }
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => socket.send(Message::Text(text.into())).await,
        Err(e) => {
            warn!(event = %event.name, error = %e, "ws: serialize failed");
            Ok(())
        }
    }
}

// =============================================================================
// EVENT DISPATCH
// =============================================================================

/// Parse and process one inbound event, returning the events owed to the
/// sender. Kept free of socket concerns so tests can drive it directly.
pub(crate) async fn process_event(
    state: &AppState,
    membership: &mut Option<Membership>,
    client_id: Uuid,
    client_tx: &mpsc::Sender<Event>,
    text: &str,
) -> Vec<Event> {
    let event: Event = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound event");
            return vec![validation_error(&format!("invalid json: {e}"))];
        }
    };
    info!(%client_id, event = %event.name, "ws: recv event");

    match event.name.as_str() {
        "join-room" => handle_join(state, membership, client_id, client_tx, &event, RoomMode::Freeform).await,
        "join-dsa-room" => handle_join(state, membership, client_id, client_tx, &event, RoomMode::Challenge).await,
        "code-change" => handle_code_change(state, membership.as_ref(), client_id, &event).await,
        "create-tab" => handle_create_tab(state, membership.as_ref(), client_id, &event).await,
        "delete-tab" => handle_delete_tab(state, membership.as_ref(), &event).await,
        "switch-tab" => handle_switch_tab(state, membership.as_ref(), client_id, &event).await,
        "share-tab" => handle_share_tab(state, membership.as_ref(), &event).await,
        "chat-message" => handle_chat(state, membership.as_ref(), &event).await,
        "generate-challenge" => handle_generate(state, membership.as_ref(), &event).await,
        "submit-solution" => handle_submit(state, membership.as_ref(), &event).await,
        "end-challenge" => handle_end(state, membership.as_ref()).await,
        "leave-room" => handle_leave(state, membership).await,
        "ping" => vec![Event::named("pong")],
        other => vec![validation_error(&format!("unknown event: {other}"))],
    }
}

fn require_membership(membership: Option<&Membership>) -> Result<&Membership, Vec<Event>> {
    membership.ok_or_else(|| vec![validation_error("join a room first")])
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

async fn handle_join(
    state: &AppState,
    membership: &mut Option<Membership>,
    client_id: Uuid,
    client_tx: &mpsc::Sender<Event>,
    event: &Event,
    mode: RoomMode,
) -> Vec<Event> {
    let Some(room_id) = event.str_field("roomId") else {
        return vec![validation_error("roomId required")];
    };
    let Some(user_name) = event.str_field("userName") else {
        return vec![validation_error("userName required")];
    };
    let session_token = event.str_field("sessionId");
    let user_email = event.str_field("userEmail");

    // A connection re-joining elsewhere leaves its old room first, and its
    // old peers hear about it the same way they would for a dropped socket.
    if let Some(old) = membership.take() {
        if old.room_id != room_id {
            if let Some(user_id) =
                presence::mark_disconnected(state, &old.room_id, client_id, grace_window()).await
            {
                announce_disconnect(state, &old.room_id, user_id).await;
            }
        }
    }

    let mut rooms = state.rooms.write().await;
    let room_state = match mode {
        RoomMode::Freeform => room::get_or_create_freeform(&mut rooms, room_id, user_name),
        RoomMode::Challenge => {
            let difficulty = event.str_field("difficulty").and_then(Difficulty::parse);
            let room_name = event.str_field("roomName");
            room::get_or_create_challenge(&mut rooms, room_id, user_name, difficulty, room_name)
        }
    };
    let room_state = match room_state {
        Ok(room_state) => room_state,
        Err(e) => return vec![Event::error_from(&e)],
    };

    let outcome = presence::register_connection(
        room_state,
        client_id,
        client_tx.clone(),
        user_name,
        user_email,
        session_token,
    );
    *membership = Some(Membership { room_id: room_id.to_string(), user_id: outcome.user_id });

    let user = room_state.users.get(&outcome.user_id).cloned();
    let users = room::user_list(room_state);

    let (snapshot_name, delta_name) = match mode {
        RoomMode::Freeform => ("room-joined", "user-joined"),
        RoomMode::Challenge => ("dsa-room-joined", "dsa-user-joined"),
    };

    let mut snapshot = Event::named(snapshot_name)
        .with_data("roomId", room_id)
        .with_data("roomName", room_state.name.clone())
        .with_data("sessionId", outcome.session_token.clone())
        .with_data("isReconnect", outcome.is_reconnect)
        .with_data("user", json(&user))
        .with_data("users", json(&users))
        .with_data("messages", json(&room_state.chat));

    match mode {
        RoomMode::Freeform => {
            snapshot = snapshot
                .with_data("tabs", json(&room::visible_tabs(room_state, outcome.user_id)))
                .with_data("activeTab", room_state.active_tab.clone());
        }
        RoomMode::Challenge => {
            snapshot = snapshot
                .with_data("difficulty", json(&room_state.difficulty))
                .with_data("status", json(&room_state.status))
                .with_data("currentChallenge", json(&room_state.current_challenge))
                .with_data("submissions", json(&room_state.submissions))
                .with_data("leaderboard", json(&challenge::leaderboard(room_state)))
                .with_data(
                    "remainingTime",
                    room_state.remaining_ms().map_or(serde_json::Value::Null, |ms| {
                        serde_json::Value::from(i64::try_from(ms).unwrap_or(i64::MAX))
                    }),
                );
        }
    }

    // Reconnects re-announce too — peers see the flag flip back via the
    // refreshed user record.
    let delta = Event::named(delta_name).with_data("user", json(&user));
    room::broadcast_room(room_state, &delta, Some(client_id));

    vec![snapshot]
}

async fn handle_leave(state: &AppState, membership: &mut Option<Membership>) -> Vec<Event> {
    let Some(current) = membership.take() else {
        return vec![validation_error("join a room first")];
    };
    presence::remove_user(state, &current.room_id, current.user_id).await;
    vec![]
}

// =============================================================================
// FREEFORM HANDLERS
// =============================================================================

async fn handle_code_change(
    state: &AppState,
    membership: Option<&Membership>,
    client_id: Uuid,
    event: &Event,
) -> Vec<Event> {
    let current = match require_membership(membership) {
        Ok(m) => m,
        Err(replies) => return replies,
    };
    let Some(tab_id) = event.str_field("tabId") else {
        return vec![validation_error("tabId required")];
    };
    // Deleting everything is a legal edit; the blank-filtering accessor
    // would eat it.
    let Some(code) = event.data.get("code").and_then(|v| v.as_str()) else {
        return vec![validation_error("code required")];
    };

    match room::apply_code_change(state, &current.room_id, current.user_id, client_id, tab_id, code)
        .await
    {
        Ok(_) => vec![],
        Err(e) => vec![Event::error_from(&e)],
    }
}

async fn handle_create_tab(
    state: &AppState,
    membership: Option<&Membership>,
    client_id: Uuid,
    event: &Event,
) -> Vec<Event> {
    let current = match require_membership(membership) {
        Ok(m) => m,
        Err(replies) => return replies,
    };
    let Some(name) = event.str_field("name") else {
        return vec![validation_error("name required")];
    };
    let language = event.str_field("language").unwrap_or("javascript");
    let tab_id = event.str_field("id");
    let is_public = event.data.get("isPublic").and_then(serde_json::Value::as_bool).unwrap_or(false);

    match tab::create_tab(
        state,
        &current.room_id,
        current.user_id,
        client_id,
        tab_id,
        name,
        language,
        is_public,
    )
    .await
    {
        Ok(created) => vec![Event::named("tab-created").with_data("tab", json(&created))],
        Err(e) => vec![Event::error_from(&e)],
    }
}

async fn handle_delete_tab(
    state: &AppState,
    membership: Option<&Membership>,
    event: &Event,
) -> Vec<Event> {
    let current = match require_membership(membership) {
        Ok(m) => m,
        Err(replies) => return replies,
    };
    let Some(tab_id) = event.str_field("tabId") else {
        return vec![validation_error("tabId required")];
    };

    match tab::delete_tab(state, &current.room_id, current.user_id, tab_id).await {
        Ok(_) => vec![],
        Err(e) => vec![Event::error_from(&e)],
    }
}

async fn handle_switch_tab(
    state: &AppState,
    membership: Option<&Membership>,
    client_id: Uuid,
    event: &Event,
) -> Vec<Event> {
    let current = match require_membership(membership) {
        Ok(m) => m,
        Err(replies) => return replies,
    };
    let Some(tab_id) = event.str_field("tabId") else {
        return vec![validation_error("tabId required")];
    };

    match tab::switch_tab(state, &current.room_id, current.user_id, client_id, tab_id).await {
        Ok(()) => vec![],
        Err(e) => vec![Event::error_from(&e)],
    }
}

async fn handle_share_tab(
    state: &AppState,
    membership: Option<&Membership>,
    event: &Event,
) -> Vec<Event> {
    let current = match require_membership(membership) {
        Ok(m) => m,
        Err(replies) => return replies,
    };
    let Some(tab_id) = event.str_field("tabId") else {
        return vec![validation_error("tabId required")];
    };
    let Some(is_public) = event.data.get("isPublic").and_then(serde_json::Value::as_bool) else {
        return vec![validation_error("isPublic required")];
    };

    match tab::set_visibility(state, &current.room_id, current.user_id, tab_id, is_public).await {
        Ok(_) => vec![],
        Err(e) => vec![Event::error_from(&e)],
    }
}

async fn handle_chat(
    state: &AppState,
    membership: Option<&Membership>,
    event: &Event,
) -> Vec<Event> {
    let current = match require_membership(membership) {
        Ok(m) => m,
        Err(replies) => return replies,
    };
    let Some(message) = event.str_field("message") else {
        return vec![validation_error("message required")];
    };

    match room::append_chat(state, &current.room_id, current.user_id, message).await {
        Ok(_) => vec![],
        Err(e) => vec![Event::error_from(&e)],
    }
}

// =============================================================================
// CHALLENGE HANDLERS
// =============================================================================

async fn handle_generate(
    state: &AppState,
    membership: Option<&Membership>,
    event: &Event,
) -> Vec<Event> {
    let current = match require_membership(membership) {
        Ok(m) => m,
        Err(replies) => return replies,
    };
    let difficulty = event.str_field("difficulty").and_then(Difficulty::parse);
    let topic = event.str_field("topic").unwrap_or("general");

    match challenge::generate(state, &current.room_id, current.user_id, difficulty, topic, None)
        .await
    {
        Ok(()) => vec![],
        Err(e) => vec![Event::error_from(&e)],
    }
}

async fn handle_submit(
    state: &AppState,
    membership: Option<&Membership>,
    event: &Event,
) -> Vec<Event> {
    let current = match require_membership(membership) {
        Ok(m) => m,
        Err(replies) => return replies,
    };
    let solution = event.data.get("solution");
    let language = solution
        .and_then(|s| s.get("language"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let code = solution.and_then(|s| s.get("code")).and_then(|v| v.as_str());
    let (Some(language), Some(code)) = (language, code) else {
        return vec![validation_error("solution with language and code required")];
    };

    match challenge::submit(state, &current.room_id, current.user_id, language, code).await {
        Ok(_) => vec![],
        Err(e) => vec![Event::error_from(&e)],
    }
}

async fn handle_end(state: &AppState, membership: Option<&Membership>) -> Vec<Event> {
    let current = match require_membership(membership) {
        Ok(m) => m,
        Err(replies) => return replies,
    };
    match challenge::end(state, &current.room_id, challenge::EndReason::Owner(current.user_id)).await {
        Ok(()) => vec![],
        Err(e) => vec![Event::error_from(&e)],
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
