//! Challenge coordinator — lifecycle, countdown, evaluation, leaderboard.
//!
//! ARCHITECTURE
//! ============
//! State machine per challenge room: waiting → active (generation succeeds)
//! → ended (owner ends it, or the countdown fires) → active again once the
//! next challenge is generated. Generation and evaluation call external
//! services; both run in spawned tasks that hold no room lock while
//! awaiting, then re-acquire it and compare challenge ids before applying —
//! a result for a challenge that has since ended or been replaced is
//! discarded, never an error.
//!
//! DESIGN
//! ======
//! - One countdown task per active challenge, aborted on explicit end and
//!   regeneration; the task double-checks the challenge id when it fires.
//! - Accepted resubmission is refused before any execution work starts.
//! - Post-game statistics are written fire-and-forget at challenge end; a
//!   failed write never touches room state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{Event, ErrorCode, json, now_ms};
use crate::judge::{self, RunCode};
use crate::llm::GenerateChallenge;
use crate::services::room::broadcast_room;
use crate::services::stats;
use crate::state::{
    AppState, Challenge, ChallengeExample, Difficulty, LeaderboardEntry, RoomMode, RoomState,
    RoomStatus, Submission, SubmissionStatus, TestResult,
};

const DEFAULT_EASY_SECS: u64 = 15 * 60;
const DEFAULT_MEDIUM_SECS: u64 = 30 * 60;
const DEFAULT_HARD_SECS: u64 = 45 * 60;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("not a challenge room")]
    WrongMode,
    #[error("user not in room")]
    UserNotFound(Uuid),
    #[error("only the room owner may do that")]
    Forbidden,
    #[error("a challenge is already active; end it first")]
    ChallengeActive,
    #[error("a challenge is already being generated")]
    GenerationInFlight,
    #[error("no active challenge")]
    NoChallenge,
    #[error("you already solved this challenge")]
    AlreadySolved,
    #[error("challenge generation is not configured")]
    GeneratorUnavailable,
    #[error("code execution is not configured")]
    EvaluatorUnavailable,
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
}

impl ErrorCode for ChallengeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "E_ROOM_NOT_FOUND",
            Self::WrongMode => "E_WRONG_MODE",
            Self::UserNotFound(_) => "E_USER_NOT_FOUND",
            Self::Forbidden => "E_FORBIDDEN",
            Self::ChallengeActive => "E_CHALLENGE_ACTIVE",
            Self::GenerationInFlight => "E_GENERATION_IN_FLIGHT",
            Self::NoChallenge => "E_NO_CHALLENGE",
            Self::AlreadySolved => "E_ALREADY_SOLVED",
            Self::GeneratorUnavailable => "E_GENERATOR_UNAVAILABLE",
            Self::EvaluatorUnavailable => "E_EVALUATOR_UNAVAILABLE",
            Self::UnsupportedLanguage(_) => "E_VALIDATION",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::GenerationInFlight)
    }
}

/// What fired the end transition. The owner path checks authorization; the
/// timer path checks it is ending the challenge it was started for.
#[derive(Debug, Clone, Copy)]
pub enum EndReason {
    Owner(Uuid),
    Timer(Uuid),
}

/// Countdown length for a challenge, by difficulty. `CHALLENGE_DURATION_SECS`
/// overrides all three.
#[must_use]
pub fn duration_for(difficulty: Difficulty) -> Duration {
    if let Some(secs) = std::env::var("CHALLENGE_DURATION_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        return Duration::from_secs(secs);
    }
    Duration::from_secs(match difficulty {
        Difficulty::Easy => DEFAULT_EASY_SECS,
        Difficulty::Medium => DEFAULT_MEDIUM_SECS,
        Difficulty::Hard => DEFAULT_HARD_SECS,
    })
}

// =============================================================================
// LEADERBOARD
// =============================================================================

/// Derive the leaderboard from accepted submissions: best score per user,
/// score descending, ties broken by earliest accepted submission.
#[must_use]
pub fn leaderboard(room: &RoomState) -> Vec<LeaderboardEntry> {
    let mut best: Vec<&Submission> = Vec::new();
    for sub in &room.submissions {
        if sub.status != SubmissionStatus::Accepted {
            continue;
        }
        match best.iter_mut().find(|b| b.user_id == sub.user_id) {
            Some(existing) => {
                if sub.score > existing.score
                    || (sub.score == existing.score && sub.submitted_at < existing.submitted_at)
                {
                    *existing = sub;
                }
            }
            None => best.push(sub),
        }
    }
    best.sort_by(|a, b| b.score.cmp(&a.score).then(a.submitted_at.cmp(&b.submitted_at)));

    best.into_iter()
        .map(|sub| {
            let user = room.users.get(&sub.user_id);
            LeaderboardEntry {
                user_id: sub.user_id,
                user_name: user.map_or_else(|| "unknown".into(), |u| u.name.clone()),
                user_color: user.map_or_else(|| "#9E9E9E".into(), |u| u.color.clone()),
                score: sub.score,
            }
        })
        .collect()
}

// =============================================================================
// GENERATION
// =============================================================================

/// Kick off challenge generation. Validation and the in-flight guard run
/// under the lock; the external call runs in a spawned task that re-acquires
/// the lock only to apply the outcome. Broadcasts `new-challenge` on
/// success, `ai-generation-failed` on failure. The countdown length comes
/// from the resolved difficulty unless `duration` overrides it.
///
/// # Errors
///
/// Fails before any external work when the requester is not the owner, a
/// challenge is active, a generation is already in flight, or no generator
/// is configured.
pub async fn generate(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    difficulty: Option<Difficulty>,
    topic: &str,
    duration: Option<Duration>,
) -> Result<(), ChallengeError> {
    let (llm, difficulty, duration) = {
        let mut rooms = state.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| ChallengeError::RoomNotFound(room_id.to_string()))?;
        if room.mode != RoomMode::Challenge {
            return Err(ChallengeError::WrongMode);
        }
        if !room.users.contains_key(&user_id) {
            return Err(ChallengeError::UserNotFound(user_id));
        }
        if !room.is_owner(user_id) {
            return Err(ChallengeError::Forbidden);
        }
        if room.status == RoomStatus::Active {
            return Err(ChallengeError::ChallengeActive);
        }
        if room.generating {
            return Err(ChallengeError::GenerationInFlight);
        }
        let llm = state.llm.clone().ok_or(ChallengeError::GeneratorUnavailable)?;
        // The countdown must match the difficulty the challenge is stamped
        // with, so both resolve from the same value here.
        let difficulty = difficulty.or(room.difficulty).unwrap_or(Difficulty::Medium);
        let duration = duration.unwrap_or_else(|| duration_for(difficulty));
        room.generating = true;
        (llm, difficulty, duration)
    };

    let state = state.clone();
    let room_id = room_id.to_string();
    let topic = topic.to_string();
    tokio::spawn(async move {
        let result = llm.generate(difficulty, &topic).await;
        apply_generation(&state, &room_id, difficulty, &topic, duration, result).await;
    });
    Ok(())
}

/// Apply a finished generation request to the room, whichever way it went.
async fn apply_generation(
    state: &AppState,
    room_id: &str,
    difficulty: Difficulty,
    topic: &str,
    duration: Duration,
    result: Result<crate::llm::GeneratedChallenge, crate::llm::LlmError>,
) {
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(room_id) else {
        debug!(%room_id, "challenge: room gone before generation finished");
        return;
    };
    room.generating = false;

    let generated = match result {
        Ok(generated) => generated,
        Err(err) => {
            warn!(%room_id, error = %err, "challenge: generation failed");
            let event = Event::named("ai-generation-failed")
                .with_data("error", err.to_string())
                .with_data("retryable", err.retryable());
            broadcast_room(room, &event, None);
            return;
        }
    };

    let challenge = Challenge {
        id: Uuid::new_v4(),
        title: generated.title,
        description: generated.description,
        difficulty,
        topic: topic.to_string(),
        examples: generated
            .examples
            .into_iter()
            .map(|e| ChallengeExample { input: e.input, output: e.output })
            .collect(),
        template: generated.template,
    };
    info!(%room_id, challenge_id = %challenge.id, title = %challenge.title, "challenge: generated");

    room.submissions.clear();
    room.status = RoomStatus::Active;
    room.current_challenge = Some(challenge.clone());
    room.challenge_deadline = Some(Instant::now() + duration);
    if let Some(old) = room.challenge_timer.take() {
        old.abort();
    }
    room.challenge_timer = Some(spawn_countdown(state.clone(), room_id.to_string(), challenge.id, duration));

    let event = Event::named("new-challenge")
        .with_data("challenge", json(&challenge))
        .with_data("remainingTime", i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .with_data("status", json(&RoomStatus::Active));
    broadcast_room(room, &event, None);
}

fn spawn_countdown(
    state: AppState,
    room_id: String,
    challenge_id: Uuid,
    duration: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        if let Err(err) = end(&state, &room_id, EndReason::Timer(challenge_id)).await {
            debug!(%room_id, error = %err, "challenge: countdown found nothing to end");
        }
    })
}

// =============================================================================
// END
// =============================================================================

/// End the active challenge: owner request or countdown expiry. Broadcasts
/// `challenge-ended` with the final leaderboard exactly once, then hands the
/// game result to the statistics store fire-and-forget.
///
/// # Errors
///
/// Fails when there is no active challenge, the requester is not the owner,
/// or (timer path) the challenge was already replaced.
pub async fn end(state: &AppState, room_id: &str, reason: EndReason) -> Result<(), ChallengeError> {
    let mut rooms = state.rooms.write().await;
    let room = rooms
        .get_mut(room_id)
        .ok_or_else(|| ChallengeError::RoomNotFound(room_id.to_string()))?;
    if room.mode != RoomMode::Challenge {
        return Err(ChallengeError::WrongMode);
    }
    let challenge = room.current_challenge.as_ref().ok_or(ChallengeError::NoChallenge)?;

    match reason {
        EndReason::Owner(user_id) => {
            if !room.users.contains_key(&user_id) {
                return Err(ChallengeError::UserNotFound(user_id));
            }
            if !room.is_owner(user_id) {
                return Err(ChallengeError::Forbidden);
            }
        }
        EndReason::Timer(challenge_id) => {
            // A regenerated challenge has its own timer; a stale one loses.
            if challenge.id != challenge_id {
                return Err(ChallengeError::NoChallenge);
            }
        }
    }

    let ended = room.current_challenge.take().ok_or(ChallengeError::NoChallenge)?;
    room.status = RoomStatus::Ended;
    room.challenge_deadline = None;
    if let Some(timer) = room.challenge_timer.take() {
        // The timer path is the timer task itself; aborting would cancel
        // this very call mid-flight.
        if matches!(reason, EndReason::Owner(_)) {
            timer.abort();
        }
    }

    let board = leaderboard(room);
    info!(%room_id, challenge_id = %ended.id, entries = board.len(), "challenge: ended");

    let event = Event::named("challenge-ended")
        .with_data("status", json(&RoomStatus::Ended))
        .with_data("challengeId", ended.id.to_string())
        .with_data("leaderboard", json(&board));
    broadcast_room(room, &event, None);

    if let Some(pool) = state.pool.clone() {
        let result = stats::GameResult::from_room(room, &ended, &board);
        tokio::spawn(async move {
            stats::record_game(&pool, result).await;
        });
    }
    Ok(())
}

// =============================================================================
// SUBMISSION
// =============================================================================

/// Accept a solution attempt: record it pending, broadcast the optimistic
/// acknowledgment, and spawn evaluation against every example. The
/// already-solved guard runs before any execution work is dispatched.
///
/// # Errors
///
/// Fails when there is no active challenge, the user already has an
/// accepted submission for it, the language is unknown, or no execution
/// service is configured.
pub async fn submit(
    state: &AppState,
    room_id: &str,
    user_id: Uuid,
    language: &str,
    code: &str,
) -> Result<Submission, ChallengeError> {
    let language_id = judge::language_id(language)
        .ok_or_else(|| ChallengeError::UnsupportedLanguage(language.to_string()))?;

    let (submission, examples, runner) = {
        let mut rooms = state.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| ChallengeError::RoomNotFound(room_id.to_string()))?;
        if room.mode != RoomMode::Challenge {
            return Err(ChallengeError::WrongMode);
        }
        if !room.users.contains_key(&user_id) {
            return Err(ChallengeError::UserNotFound(user_id));
        }
        let challenge = room.current_challenge.as_ref().ok_or(ChallengeError::NoChallenge)?;
        if room.status != RoomStatus::Active {
            return Err(ChallengeError::NoChallenge);
        }
        let already = room.submissions.iter().any(|s| {
            s.user_id == user_id
                && s.challenge_id == challenge.id
                && s.status == SubmissionStatus::Accepted
        });
        if already {
            return Err(ChallengeError::AlreadySolved);
        }
        let runner = state.judge.clone().ok_or(ChallengeError::EvaluatorUnavailable)?;

        let submission = Submission {
            id: Uuid::new_v4(),
            challenge_id: challenge.id,
            user_id,
            language: language.to_string(),
            code: code.to_string(),
            status: SubmissionStatus::Pending,
            test_results: Vec::new(),
            score: 0,
            submitted_at: now_ms(),
        };
        let examples = challenge.examples.clone();
        room.submissions.push(submission.clone());

        let event = Event::named("solution-submitted").with_data("submission", json(&submission));
        broadcast_room(room, &event, None);
        (submission, examples, runner)
    };

    let state = state.clone();
    let room_id = room_id.to_string();
    let sub_id = submission.id;
    let challenge_id = submission.challenge_id;
    let code = code.to_string();
    tokio::spawn(async move {
        evaluate(&state, &room_id, sub_id, challenge_id, &code, language_id, &examples, runner).await;
    });
    Ok(submission)
}

/// Run the submission against every example and apply the verdict. The room
/// lock is held only before and after the external calls.
#[allow(clippy::too_many_arguments)]
async fn evaluate(
    state: &AppState,
    room_id: &str,
    submission_id: Uuid,
    challenge_id: Uuid,
    code: &str,
    language_id: u32,
    examples: &[ChallengeExample],
    runner: Arc<dyn RunCode>,
) {
    let mut results = Vec::with_capacity(examples.len());
    for example in examples {
        match runner.run(code, language_id, &example.input).await {
            Ok(outcome) => {
                let actual = outcome.stdout.as_deref().unwrap_or("").trim().to_string();
                let passed = outcome.ran_clean() && actual == example.output.trim();
                results.push(TestResult {
                    input: example.input.clone(),
                    expected: example.output.clone(),
                    actual,
                    passed,
                    error: (!outcome.ran_clean()).then(|| outcome.failure_detail()),
                });
            }
            Err(err) => {
                // Execution-service failure, not a wrong answer: the
                // submission stays pending and the submitter may retry.
                warn!(%room_id, %submission_id, error = %err, "challenge: evaluation failed");
                let mut rooms = state.rooms.write().await;
                if let Some(room) = rooms.get_mut(room_id) {
                    let event = Event::named("evaluation-error")
                        .with_data("submissionId", submission_id.to_string())
                        .with_data("error", err.to_string())
                        .with_data("retryable", err.retryable());
                    broadcast_room(room, &event, None);
                }
                return;
            }
        }
    }

    let accepted = results.iter().all(|r| r.passed);
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(room_id) else {
        debug!(%room_id, "challenge: room gone before evaluation finished");
        return;
    };
    // Verdict for a challenge that has since ended or been replaced is
    // discarded.
    if room.current_challenge.as_ref().map(|c| c.id) != Some(challenge_id) {
        debug!(%room_id, %submission_id, "challenge: discarding late verdict");
        return;
    }
    let Some(submission) = room.submissions.iter_mut().find(|s| s.id == submission_id) else {
        return;
    };
    submission.status = if accepted { SubmissionStatus::Accepted } else { SubmissionStatus::Rejected };
    submission.score = if accepted { 100 } else { 0 };
    submission.test_results = results;
    let snapshot = submission.clone();
    info!(%room_id, %submission_id, accepted, "challenge: evaluation finished");

    let event = Event::named("evaluation-result").with_data("submission", json(&snapshot));
    broadcast_room(room, &event, None);

    if accepted {
        let board = leaderboard(room);
        let event = Event::named("leaderboard-updated").with_data("leaderboard", json(&board));
        broadcast_room(room, &event, None);
    }
}

#[cfg(test)]
#[path = "challenge_test.rs"]
mod tests;
