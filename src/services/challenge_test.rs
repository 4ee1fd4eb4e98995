use std::collections::HashMap;

use super::*;
use crate::judge::{ExecutionOutcome, JudgeError, STATUS_ACCEPTED};
use crate::llm::{GeneratedChallenge, GeneratedExample, LlmError};
use crate::state::test_helpers;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

async fn assert_channel_has_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("event receive timed out")
        .expect("channel closed")
}

async fn assert_channel_empty(rx: &mut mpsc::Receiver<Event>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected channel to remain empty"
    );
}

// ===== MOCKS =====

struct FixedLlm;

#[async_trait::async_trait]
impl GenerateChallenge for FixedLlm {
    async fn generate(&self, _: Difficulty, _: &str) -> Result<GeneratedChallenge, LlmError> {
        Ok(GeneratedChallenge {
            title: "Two Sum".into(),
            description: "Find two numbers adding to the target.".into(),
            examples: vec![GeneratedExample { input: "1 2\n3".into(), output: "0 1".into() }],
            template: HashMap::new(),
        })
    }
}

struct FailingLlm;

#[async_trait::async_trait]
impl GenerateChallenge for FailingLlm {
    async fn generate(&self, _: Difficulty, _: &str) -> Result<GeneratedChallenge, LlmError> {
        Err(LlmError::ApiRequest("connection refused".into()))
    }
}

fn clean_run(stdout: &str) -> ExecutionOutcome {
    ExecutionOutcome {
        stdout: Some(format!("{stdout}\n")),
        stderr: None,
        compile_output: None,
        time: Some("0.01".into()),
        memory: Some(1024),
        status_id: STATUS_ACCEPTED,
        status_description: "Accepted".into(),
    }
}

/// Answers each run by looking the stdin up in a fixed table; unknown stdin
/// produces empty output.
struct MapJudge {
    answers: HashMap<String, String>,
    delay: Duration,
}

impl MapJudge {
    fn for_challenge(challenge: &Challenge) -> Self {
        Self {
            answers: challenge
                .examples
                .iter()
                .map(|e| (e.input.clone(), e.output.clone()))
                .collect(),
            delay: Duration::ZERO,
        }
    }
}

#[async_trait::async_trait]
impl RunCode for MapJudge {
    async fn run(&self, _: &str, _: u32, stdin: &str) -> Result<ExecutionOutcome, JudgeError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        Ok(clean_run(self.answers.get(stdin).map_or("", String::as_str)))
    }
}

struct WrongJudge;

#[async_trait::async_trait]
impl RunCode for WrongJudge {
    async fn run(&self, _: &str, _: u32, _: &str) -> Result<ExecutionOutcome, JudgeError> {
        Ok(clean_run("wrong answer"))
    }
}

struct ErrJudge;

#[async_trait::async_trait]
impl RunCode for ErrJudge {
    async fn run(&self, _: &str, _: u32, _: &str) -> Result<ExecutionOutcome, JudgeError> {
        Err(JudgeError::ApiRequest("connection refused".into()))
    }
}

/// Seed an active challenge into a room, bypassing generation.
async fn activate_challenge(state: &AppState, room_id: &str) -> Challenge {
    let challenge = test_helpers::dummy_challenge();
    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut(room_id).expect("room should be seeded");
    room.status = RoomStatus::Active;
    room.current_challenge = Some(challenge.clone());
    room.challenge_deadline = Some(Instant::now() + Duration::from_secs(600));
    challenge
}

// ===== GENERATION =====

#[tokio::test]
async fn generation_is_owner_only() {
    let state = test_helpers::test_app_state_with_llm(Arc::new(FixedLlm));
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (bob_id, _, _rx) = test_helpers::join_user(&state, "dsa-1", "bob").await;

    let err = generate(&state, "dsa-1", bob_id, None, "arrays", None)
        .await
        .expect_err("non-owner rejected");
    assert!(matches!(err, ChallengeError::Forbidden));
}

#[tokio::test]
async fn successful_generation_activates_the_room_and_broadcasts() {
    let state = test_helpers::test_app_state_with_llm(Arc::new(FixedLlm));
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, mut rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;

    generate(&state, "dsa-1", alice_id, None, "arrays", None)
        .await
        .expect("generate should dispatch");

    let event = assert_channel_has_event(&mut rx).await;
    assert_eq!(event.name, "new-challenge");
    let challenge = event.data.get("challenge").expect("challenge payload");
    assert_eq!(challenge.get("title").and_then(|v| v.as_str()), Some("Two Sum"));

    let rooms = state.rooms.read().await;
    let room = rooms.get("dsa-1").expect("room");
    assert_eq!(room.status, RoomStatus::Active);
    assert!(room.current_challenge.is_some());
    assert!(!room.generating);
    assert!(room.submissions.is_empty());
    assert!(room.remaining_ms().expect("countdown running") > 0);
}

#[tokio::test]
async fn countdown_follows_the_room_difficulty_when_the_request_omits_it() {
    let state = test_helpers::test_app_state_with_llm(Arc::new(FixedLlm));
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Hard).await;
    let (alice_id, _, mut rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;

    generate(&state, "dsa-1", alice_id, None, "arrays", None)
        .await
        .expect("generate should dispatch");

    let event = assert_channel_has_event(&mut rx).await;
    assert_eq!(event.name, "new-challenge");
    let challenge = event.data.get("challenge").expect("challenge payload");
    assert_eq!(challenge.get("difficulty").and_then(|v| v.as_str()), Some("hard"));
    let remaining = event.data.get("remainingTime").and_then(serde_json::Value::as_i64);
    assert_eq!(remaining, Some(i64::try_from(duration_for(Difficulty::Hard).as_millis()).unwrap()));
}

#[tokio::test]
async fn failed_generation_broadcasts_and_leaves_state_untouched() {
    let state = test_helpers::test_app_state_with_llm(Arc::new(FailingLlm));
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, mut rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;

    generate(&state, "dsa-1", alice_id, None, "arrays", None)
        .await
        .expect("generate should dispatch");

    let event = assert_channel_has_event(&mut rx).await;
    assert_eq!(event.name, "ai-generation-failed");
    assert!(event.data.get("error").and_then(|v| v.as_str()).is_some());

    let rooms = state.rooms.read().await;
    let room = rooms.get("dsa-1").expect("room");
    assert_eq!(room.status, RoomStatus::Waiting);
    assert!(room.current_challenge.is_none());
    assert!(!room.generating);
}

#[tokio::test]
async fn generation_while_active_is_rejected() {
    let state = test_helpers::test_app_state_with_llm(Arc::new(FixedLlm));
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, _rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    activate_challenge(&state, "dsa-1").await;

    let err = generate(&state, "dsa-1", alice_id, None, "arrays", None)
        .await
        .expect_err("active room rejects regeneration");
    assert!(matches!(err, ChallengeError::ChallengeActive));
}

#[tokio::test]
async fn generation_in_flight_is_rejected() {
    let state = test_helpers::test_app_state_with_llm(Arc::new(FixedLlm));
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, _rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    {
        let mut rooms = state.rooms.write().await;
        rooms.get_mut("dsa-1").expect("room").generating = true;
    }

    let err = generate(&state, "dsa-1", alice_id, None, "arrays", None)
        .await
        .expect_err("in-flight generation rejected");
    assert!(matches!(err, ChallengeError::GenerationInFlight));
}

#[tokio::test]
async fn generation_without_a_configured_generator_is_rejected() {
    let state = test_helpers::test_app_state();
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, _rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;

    let err = generate(&state, "dsa-1", alice_id, None, "arrays", None)
        .await
        .expect_err("no generator configured");
    assert!(matches!(err, ChallengeError::GeneratorUnavailable));
}

// ===== END =====

#[tokio::test]
async fn owner_end_broadcasts_final_leaderboard_and_clears_the_challenge() {
    let state = test_helpers::test_app_state();
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, mut rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    let challenge = activate_challenge(&state, "dsa-1").await;
    {
        let mut rooms = state.rooms.write().await;
        let room = rooms.get_mut("dsa-1").expect("room");
        let mut sub = test_helpers::pending_submission(challenge.id, alice_id);
        sub.status = SubmissionStatus::Accepted;
        sub.score = 100;
        room.submissions.push(sub);
    }

    end(&state, "dsa-1", EndReason::Owner(alice_id)).await.expect("end should succeed");

    let event = assert_channel_has_event(&mut rx).await;
    assert_eq!(event.name, "challenge-ended");
    let board = event.data.get("leaderboard").and_then(|v| v.as_array()).expect("leaderboard");
    assert_eq!(board.len(), 1);
    assert_eq!(board[0].get("userName").and_then(|v| v.as_str()), Some("alice"));

    let rooms = state.rooms.read().await;
    let room = rooms.get("dsa-1").expect("room");
    assert_eq!(room.status, RoomStatus::Ended);
    assert!(room.current_challenge.is_none());
    assert!(room.challenge_deadline.is_none());
}

#[tokio::test]
async fn ending_twice_fails_the_second_time() {
    let state = test_helpers::test_app_state();
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, _rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    activate_challenge(&state, "dsa-1").await;

    end(&state, "dsa-1", EndReason::Owner(alice_id)).await.expect("first end succeeds");
    let err = end(&state, "dsa-1", EndReason::Owner(alice_id))
        .await
        .expect_err("nothing left to end");
    assert!(matches!(err, ChallengeError::NoChallenge));
}

#[tokio::test]
async fn end_is_owner_only() {
    let state = test_helpers::test_app_state();
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (_, _, _rx_a) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    let (bob_id, _, _rx_b) = test_helpers::join_user(&state, "dsa-1", "bob").await;
    activate_challenge(&state, "dsa-1").await;

    let err = end(&state, "dsa-1", EndReason::Owner(bob_id)).await.expect_err("non-owner rejected");
    assert!(matches!(err, ChallengeError::Forbidden));
}

#[tokio::test]
async fn countdown_expiry_ends_the_challenge_exactly_once() {
    let state = test_helpers::test_app_state_with_llm(Arc::new(FixedLlm));
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, mut rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;

    generate(&state, "dsa-1", alice_id, None, "arrays", Some(Duration::from_millis(50)))
        .await
        .expect("generate should dispatch");

    assert_eq!(assert_channel_has_event(&mut rx).await.name, "new-challenge");
    assert_eq!(assert_channel_has_event(&mut rx).await.name, "challenge-ended");
    assert_channel_empty(&mut rx).await;

    let rooms = state.rooms.read().await;
    assert_eq!(rooms.get("dsa-1").expect("room").status, RoomStatus::Ended);
}

#[tokio::test]
async fn stale_timer_for_a_replaced_challenge_does_nothing() {
    let state = test_helpers::test_app_state();
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (_, _, _rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    activate_challenge(&state, "dsa-1").await;

    let err = end(&state, "dsa-1", EndReason::Timer(Uuid::new_v4()))
        .await
        .expect_err("stale timer loses");
    assert!(matches!(err, ChallengeError::NoChallenge));

    let rooms = state.rooms.read().await;
    assert_eq!(rooms.get("dsa-1").expect("room").status, RoomStatus::Active);
}

// ===== SUBMISSION =====

#[tokio::test]
async fn accepted_submission_updates_the_leaderboard() {
    let state = test_helpers::test_app_state();
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, mut rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    let challenge = activate_challenge(&state, "dsa-1").await;
    let state = AppState { judge: Some(Arc::new(MapJudge::for_challenge(&challenge))), ..state };

    let submission = submit(&state, "dsa-1", alice_id, "python", "print(answer)")
        .await
        .expect("submit should succeed");
    assert_eq!(submission.status, SubmissionStatus::Pending);

    assert_eq!(assert_channel_has_event(&mut rx).await.name, "solution-submitted");
    let verdict = assert_channel_has_event(&mut rx).await;
    assert_eq!(verdict.name, "evaluation-result");
    let sub = verdict.data.get("submission").expect("submission payload");
    assert_eq!(sub.get("status").and_then(|v| v.as_str()), Some("accepted"));
    assert_eq!(sub.get("score").and_then(serde_json::Value::as_u64), Some(100));

    let board_event = assert_channel_has_event(&mut rx).await;
    assert_eq!(board_event.name, "leaderboard-updated");
    let board = board_event.data.get("leaderboard").and_then(|v| v.as_array()).expect("board");
    assert_eq!(board.len(), 1);
}

#[tokio::test]
async fn wrong_output_is_rejected_without_a_leaderboard_update() {
    let state = test_helpers::test_app_state_with_judge(Arc::new(WrongJudge));
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, mut rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    activate_challenge(&state, "dsa-1").await;

    submit(&state, "dsa-1", alice_id, "python", "print('no')")
        .await
        .expect("submit should succeed");

    assert_eq!(assert_channel_has_event(&mut rx).await.name, "solution-submitted");
    let verdict = assert_channel_has_event(&mut rx).await;
    assert_eq!(verdict.name, "evaluation-result");
    let sub = verdict.data.get("submission").expect("submission payload");
    assert_eq!(sub.get("status").and_then(|v| v.as_str()), Some("rejected"));
    assert_channel_empty(&mut rx).await;
}

#[tokio::test]
async fn execution_failure_leaves_the_submission_pending() {
    let state = test_helpers::test_app_state_with_judge(Arc::new(ErrJudge));
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, mut rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    activate_challenge(&state, "dsa-1").await;

    let submission = submit(&state, "dsa-1", alice_id, "python", "print('x')")
        .await
        .expect("submit should succeed");

    assert_eq!(assert_channel_has_event(&mut rx).await.name, "solution-submitted");
    let failure = assert_channel_has_event(&mut rx).await;
    assert_eq!(failure.name, "evaluation-error");
    assert_eq!(failure.data.get("retryable").and_then(serde_json::Value::as_bool), Some(true));

    let rooms = state.rooms.read().await;
    let room = rooms.get("dsa-1").expect("room");
    let stored = room.submissions.iter().find(|s| s.id == submission.id).expect("submission");
    assert_eq!(stored.status, SubmissionStatus::Pending);
}

#[tokio::test]
async fn already_accepted_users_are_rejected_before_any_execution() {
    let state = test_helpers::test_app_state_with_judge(Arc::new(ErrJudge));
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, mut rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    let challenge = activate_challenge(&state, "dsa-1").await;
    {
        let mut rooms = state.rooms.write().await;
        let room = rooms.get_mut("dsa-1").expect("room");
        let mut sub = test_helpers::pending_submission(challenge.id, alice_id);
        sub.status = SubmissionStatus::Accepted;
        room.submissions.push(sub);
    }

    let err = submit(&state, "dsa-1", alice_id, "python", "print('again')")
        .await
        .expect_err("second accepted attempt rejected");
    assert!(matches!(err, ChallengeError::AlreadySolved));
    // No solution-submitted, no ErrJudge call: nothing was dispatched.
    assert_channel_empty(&mut rx).await;
}

#[tokio::test]
async fn submitting_with_no_active_challenge_fails() {
    let state = test_helpers::test_app_state_with_judge(Arc::new(WrongJudge));
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, _rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;

    let err = submit(&state, "dsa-1", alice_id, "python", "print('x')")
        .await
        .expect_err("waiting room has no challenge");
    assert!(matches!(err, ChallengeError::NoChallenge));
}

#[tokio::test]
async fn unsupported_language_is_rejected() {
    let state = test_helpers::test_app_state_with_judge(Arc::new(WrongJudge));
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, _rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    activate_challenge(&state, "dsa-1").await;

    let err = submit(&state, "dsa-1", alice_id, "cobol", "DISPLAY 'x'")
        .await
        .expect_err("unknown language rejected");
    assert!(matches!(err, ChallengeError::UnsupportedLanguage(_)));
}

#[tokio::test]
async fn verdict_arriving_after_the_challenge_ended_is_discarded() {
    let state = test_helpers::test_app_state();
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, mut rx) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    let challenge = activate_challenge(&state, "dsa-1").await;
    let slow = MapJudge { delay: Duration::from_millis(150), ..MapJudge::for_challenge(&challenge) };
    let state = AppState { judge: Some(Arc::new(slow)), ..state };

    let submission = submit(&state, "dsa-1", alice_id, "python", "print(answer)")
        .await
        .expect("submit should succeed");
    assert_eq!(assert_channel_has_event(&mut rx).await.name, "solution-submitted");

    end(&state, "dsa-1", EndReason::Owner(alice_id)).await.expect("end should succeed");
    assert_eq!(assert_channel_has_event(&mut rx).await.name, "challenge-ended");

    sleep(Duration::from_millis(400)).await;
    assert_channel_empty(&mut rx).await;
    let rooms = state.rooms.read().await;
    let room = rooms.get("dsa-1").expect("room");
    let stored = room.submissions.iter().find(|s| s.id == submission.id).expect("submission");
    assert_eq!(stored.status, SubmissionStatus::Pending);
}

// ===== LEADERBOARD =====

#[tokio::test]
async fn leaderboard_orders_by_score_then_earliest_acceptance() {
    let state = test_helpers::test_app_state();
    test_helpers::seed_challenge_room(&state, "dsa-1", "alice", Difficulty::Easy).await;
    let (alice_id, _, _rx_a) = test_helpers::join_user(&state, "dsa-1", "alice").await;
    let (bob_id, _, _rx_b) = test_helpers::join_user(&state, "dsa-1", "bob").await;
    let challenge = activate_challenge(&state, "dsa-1").await;

    let mut rooms = state.rooms.write().await;
    let room = rooms.get_mut("dsa-1").expect("room");
    let mut late = test_helpers::pending_submission(challenge.id, alice_id);
    late.status = SubmissionStatus::Accepted;
    late.score = 100;
    late.submitted_at = 2_000;
    let mut early = test_helpers::pending_submission(challenge.id, bob_id);
    early.status = SubmissionStatus::Accepted;
    early.score = 100;
    early.submitted_at = 1_000;
    room.submissions.push(late);
    room.submissions.push(early);

    let board = leaderboard(room);
    assert_eq!(board.len(), 2);
    assert_eq!(board[0].user_name, "bob");
    assert_eq!(board[1].user_name, "alice");
}
