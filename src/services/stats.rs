//! Statistics service — post-game persistence, fire-and-forget.
//!
//! DESIGN
//! ======
//! The only persistent surface in the server. Called once per challenge at
//! the end transition with a snapshot of the outcome; every write failure is
//! logged and swallowed — room state never depends on the database being
//! reachable. Identity is the user's email when the client supplied one,
//! their display name otherwise.

use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::{Challenge, LeaderboardEntry, RoomState, SubmissionStatus};

const WINNER_RATING_DELTA: i64 = 25;
const SOLVER_RATING_DELTA: i64 = 10;

// =============================================================================
// TYPES
// =============================================================================

/// One participant's outcome in a finished game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerOutcome {
    /// Email when known, display name otherwise.
    pub identity: String,
    pub name: String,
    pub won: bool,
    pub solved: bool,
    pub rating_delta: i64,
}

/// Snapshot of a finished game, detached from room state so the write can
/// happen after the lock is released.
#[derive(Debug, Clone)]
pub struct GameResult {
    pub challenge_id: Uuid,
    pub challenge_title: String,
    pub players: Vec<PlayerOutcome>,
}

impl GameResult {
    /// Capture the outcome of a finished challenge. Every user still in the
    /// room counts as a participant; the top leaderboard entry is the
    /// winner; other accepted solvers get the smaller rating bump.
    #[must_use]
    pub fn from_room(room: &RoomState, challenge: &Challenge, board: &[LeaderboardEntry]) -> Self {
        let winner = board.first().map(|e| e.user_id);
        let players = room
            .users
            .values()
            .map(|user| {
                let solved = room.submissions.iter().any(|s| {
                    s.user_id == user.id
                        && s.challenge_id == challenge.id
                        && s.status == SubmissionStatus::Accepted
                });
                let won = winner == Some(user.id);
                PlayerOutcome {
                    identity: user.email.clone().unwrap_or_else(|| user.name.clone()),
                    name: user.name.clone(),
                    won,
                    solved,
                    rating_delta: if won {
                        WINNER_RATING_DELTA
                    } else if solved {
                        SOLVER_RATING_DELTA
                    } else {
                        0
                    },
                }
            })
            .collect();
        Self {
            challenge_id: challenge.id,
            challenge_title: challenge.title.clone(),
            players,
        }
    }
}

// =============================================================================
// WRITES
// =============================================================================

/// Persist a finished game. Failures are logged, never propagated.
pub async fn record_game(pool: &PgPool, result: GameResult) {
    for player in &result.players {
        if let Err(err) = upsert_player(pool, &result, player).await {
            warn!(identity = %player.identity, error = %err, "stats: write failed");
        }
    }
    info!(
        challenge_id = %result.challenge_id,
        players = result.players.len(),
        "stats: game recorded"
    );
}

async fn upsert_player(
    pool: &PgPool,
    result: &GameResult,
    player: &PlayerOutcome,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO user_stats (identity, display_name, total_games, win_count, rating)
         VALUES ($1, $2, 1, $3, 1000 + $4)
         ON CONFLICT (identity) DO UPDATE SET
             display_name = EXCLUDED.display_name,
             total_games = user_stats.total_games + 1,
             win_count = user_stats.win_count + $3,
             rating = user_stats.rating + $4,
             updated_at = now()",
    )
    .bind(&player.identity)
    .bind(&player.name)
    .bind(i64::from(player.won))
    .bind(player.rating_delta)
    .execute(pool)
    .await?;

    if player.solved {
        sqlx::query(
            "INSERT INTO solved_problems (identity, challenge_id, title)
             VALUES ($1, $2, $3)
             ON CONFLICT (identity, challenge_id) DO NOTHING",
        )
        .bind(&player.identity)
        .bind(result.challenge_id)
        .bind(&result.challenge_title)
        .execute(pool)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "stats_test.rs"]
mod tests;
