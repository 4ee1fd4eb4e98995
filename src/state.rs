//! Shared application state and domain types.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds a map of live rooms plus the optional external collaborators
//! (statistics pool, challenge generator, code runner). Each room owns its
//! tabs, users, chat history, and challenge state in memory; the map's write
//! lock serializes all mutations to a room, so broadcasts always reflect a
//! consistent snapshot. Rooms are evicted when their last user is removed —
//! nothing about a room is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::event::Event;
use crate::judge::RunCode;
use crate::llm::GenerateChallenge;

/// The one tab every freeform room always has. Public, system-owned,
/// undeletable.
pub const MAIN_TAB_ID: &str = "main";

/// Sentinel owner for the default `main` tab.
pub const SYSTEM_USER: &str = "system";

/// Chat messages retained per room (join snapshots carry this history).
pub const CHAT_HISTORY_LIMIT: usize = 200;

// =============================================================================
// ENUMS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomMode {
    Freeform,
    Challenge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    /// Parse the wire value. `None` for anything outside {easy, medium, hard}.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "easy" => Some(Self::Easy),
            "medium" => Some(Self::Medium),
            "hard" => Some(Self::Hard),
            _ => None,
        }
    }
}

/// Challenge-room lifecycle: waiting → active → ended → (active again once a
/// new challenge is generated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Accepted,
    Rejected,
}

// =============================================================================
// DOMAIN TYPES
// =============================================================================

/// A named, independently editable unit of source code in a freeform room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: String,
    pub name: String,
    pub language: String,
    pub code: String,
    /// Creator's user id string, or [`SYSTEM_USER`] for `main`.
    pub created_by: String,
    pub is_public: bool,
}

impl Tab {
    /// The immutable default tab every freeform room starts with.
    #[must_use]
    pub fn main() -> Self {
        Self {
            id: MAIN_TAB_ID.into(),
            name: MAIN_TAB_ID.into(),
            language: "javascript".into(),
            code: String::new(),
            created_by: SYSTEM_USER.into(),
            is_public: true,
        }
    }
}

/// A participant's room-scoped identity. Survives transport drops until the
/// grace window expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSession {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub active_tab: String,
    pub disconnected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Bumped on every reconnect so a stale grace timer can tell it lost.
    #[serde(skip)]
    pub disconnect_nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeExample {
    pub input: String,
    pub output: String,
}

/// A generated coding problem, active in at most one instance per room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub difficulty: Difficulty,
    pub topic: String,
    pub examples: Vec<ChallengeExample>,
    /// Language name → starter source.
    pub template: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub input: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One attempt at the active challenge. Transitions pending → accepted or
/// rejected exactly once; never mutated after that.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: Uuid,
    pub challenge_id: Uuid,
    pub user_id: Uuid,
    pub language: String,
    pub code: String,
    pub status: SubmissionStatus,
    pub test_results: Vec<TestResult>,
    pub score: u32,
    pub submitted_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub user_color: String,
    pub message: String,
    pub timestamp: i64,
}

/// Derived ranking row — recomputed whenever a submission resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub user_id: Uuid,
    pub user_name: String,
    pub user_color: String,
    pub score: u32,
}

// =============================================================================
// ROOM STATE
// =============================================================================

/// Outbound handle for one websocket connection in a room.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub user_id: Uuid,
    pub tx: mpsc::Sender<Event>,
}

/// Per-room live state. The single source of truth for everything a room
/// contains; all mutations funnel through the rooms write lock.
#[derive(Debug)]
pub struct RoomState {
    pub name: String,
    pub mode: RoomMode,
    /// Creator's display name; owner-only actions compare against this.
    pub created_by: String,
    pub difficulty: Option<Difficulty>,
    pub status: RoomStatus,
    /// Insertion order is display order. Freeform rooms only.
    pub tabs: Vec<Tab>,
    /// Default tab for new joiners; does not force anyone's selection.
    pub active_tab: String,
    pub users: HashMap<Uuid, UserSession>,
    /// Session token → user id, for reconnect reconciliation.
    pub tokens: HashMap<String, Uuid>,
    /// Connected websocket clients keyed by connection id.
    pub clients: HashMap<Uuid, ClientHandle>,
    pub chat: Vec<ChatMessage>,
    pub current_challenge: Option<Challenge>,
    pub submissions: Vec<Submission>,
    /// Deadline of the running countdown, when a challenge is active.
    pub challenge_deadline: Option<Instant>,
    /// Countdown task; aborted on explicit end, regeneration, and teardown.
    pub challenge_timer: Option<JoinHandle<()>>,
    /// True while a generation request is in flight with the external service.
    pub generating: bool,
}

impl RoomState {
    #[must_use]
    pub fn new_freeform(name: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: RoomMode::Freeform,
            created_by: created_by.into(),
            difficulty: None,
            status: RoomStatus::Waiting,
            tabs: vec![Tab::main()],
            active_tab: MAIN_TAB_ID.into(),
            users: HashMap::new(),
            tokens: HashMap::new(),
            clients: HashMap::new(),
            chat: Vec::new(),
            current_challenge: None,
            submissions: Vec::new(),
            challenge_deadline: None,
            challenge_timer: None,
            generating: false,
        }
    }

    #[must_use]
    pub fn new_challenge(
        name: impl Into<String>,
        created_by: impl Into<String>,
        difficulty: Difficulty,
    ) -> Self {
        Self {
            name: name.into(),
            mode: RoomMode::Challenge,
            created_by: created_by.into(),
            difficulty: Some(difficulty),
            status: RoomStatus::Waiting,
            tabs: Vec::new(),
            active_tab: String::new(),
            users: HashMap::new(),
            tokens: HashMap::new(),
            clients: HashMap::new(),
            chat: Vec::new(),
            current_challenge: None,
            submissions: Vec::new(),
            challenge_deadline: None,
            challenge_timer: None,
            generating: false,
        }
    }

    /// Room ownership is keyed on the creator's display name.
    #[must_use]
    pub fn is_owner(&self, user_id: Uuid) -> bool {
        self.users
            .get(&user_id)
            .is_some_and(|u| u.name == self.created_by)
    }

    pub fn tab(&self, tab_id: &str) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id == tab_id)
    }

    pub fn tab_mut(&mut self, tab_id: &str) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|t| t.id == tab_id)
    }

    /// Milliseconds left on the active countdown. `None` when no challenge
    /// is running.
    #[must_use]
    pub fn remaining_ms(&self) -> Option<u64> {
        let deadline = self.challenge_deadline?;
        let now = Instant::now();
        if deadline <= now {
            return Some(0);
        }
        Some(u64::try_from((deadline - now).as_millis()).unwrap_or(u64::MAX))
    }
}

impl Drop for RoomState {
    fn drop(&mut self) {
        // Room teardown must not leak a running countdown task.
        if let Some(timer) = self.challenge_timer.take() {
            timer.abort();
        }
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum — all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RwLock<HashMap<String, RoomState>>>,
    /// Optional statistics store. `None` if `DATABASE_URL` is not configured;
    /// a failed or absent stats write never affects room state.
    pub pool: Option<PgPool>,
    /// Optional challenge generator. `None` if LLM env vars are missing.
    pub llm: Option<Arc<dyn GenerateChallenge>>,
    /// Optional code execution client. `None` if `JUDGE0_URL` is missing.
    pub judge: Option<Arc<dyn RunCode>>,
}

impl AppState {
    #[must_use]
    pub fn new(
        pool: Option<PgPool>,
        llm: Option<Arc<dyn GenerateChallenge>>,
        judge: Option<Arc<dyn RunCode>>,
    ) -> Self {
        Self { rooms: Arc::new(RwLock::new(HashMap::new())), pool, llm, judge }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
