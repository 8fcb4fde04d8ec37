//! End-to-end flows through the orchestrator with a scripted provider.

mod common;

use std::collections::HashMap;

use tempfile::TempDir;

use common::{clarifier_act_json, orchestrator_with, scripted_provider, Script};
use reqforge::bus::{EventKind, EventPayload};
use reqforge::orchestrator::Orchestrator;
use reqforge::session::{Question, SessionMode, SessionPhase};
use reqforge::store::SessionStore;

/// Reads the stream, answering every question message, until the terminal
/// event. Returns all observed (seq, kind) pairs and the terminal payload.
async fn drive_to_terminal(
    orchestrator: &Orchestrator,
    session_id: &str,
) -> (Vec<(u64, EventKind)>, EventPayload) {
    let mut stream = orchestrator.subscribe(session_id, 0).await.unwrap();
    let mut observed = Vec::new();

    loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(30), stream.recv())
            .await
            .expect("stream stalled")
            .expect("stream closed before terminal");
        observed.push((event.seq, event.kind));

        match &event.payload {
            EventPayload::Message { message } => {
                if let reqforge::session::MessagePayload::Questions { questions, .. } =
                    &message.payload
                {
                    let answers: HashMap<String, String> = questions
                        .iter()
                        .map(|q: &Question| (q.id.clone(), format!("answer to {}", q.text)))
                        .collect();
                    orchestrator
                        .submit_answer(session_id, answers)
                        .await
                        .unwrap();
                }
            }
            payload @ EventPayload::Terminal { .. } => {
                let payload = payload.clone();
                assert!(stream.recv().await.is_none(), "stream must close after terminal");
                return (observed, payload);
            }
            _ => {}
        }
    }
}

fn assert_seqs_strictly_increasing(observed: &[(u64, EventKind)]) {
    for pair in observed.windows(2) {
        assert!(
            pair[1].0 > pair[0].0,
            "sequence regressed: {} then {}",
            pair[0].0,
            pair[1].0
        );
    }
}

#[tokio::test]
async fn test_quick_happy_path() {
    let dir = TempDir::new().unwrap();
    let script = Script::new();
    // Round 1 fails the gate with three questions; round 2 passes at 0.82.
    script.push_clarifier_round(clarifier_act_json(0.5, 3));
    script.push_clarifier_round(clarifier_act_json(0.82, 0));

    let orchestrator = orchestrator_with(scripted_provider(script), &dir);
    let session_id = orchestrator
        .start("Build a personal todo app", SessionMode::Quick, None)
        .await
        .unwrap();

    let (observed, terminal) = drive_to_terminal(&orchestrator, &session_id).await;
    assert_seqs_strictly_increasing(&observed);

    match terminal {
        EventPayload::Terminal { phase, error } => {
            assert_eq!(phase, SessionPhase::Done);
            assert!(error.is_none());
        }
        other => panic!("unexpected terminal payload: {:?}", other),
    }

    let snapshot = orchestrator.get_session(&session_id).await.unwrap();
    assert_eq!(snapshot.phase, SessionPhase::Done);
    assert!((snapshot.progress - 1.0).abs() < 1e-9);
    assert_eq!(snapshot.artifacts.len(), 1);
    assert_eq!(snapshot.artifacts[0].name, "requirements_spec.md");
    let round = snapshot.last_round.expect("one clarification round");
    assert_eq!(round.questions.len(), 3);
    assert!(round.all_answered());

    // Quick mode never enters reviewing.
    let store = SessionStore::new(dir.path()).unwrap();
    let record = store.load(&session_id).await.unwrap();
    assert!(record.tasks.iter().all(|t| !t.id.starts_with("review")));
    assert!(record.tasks.iter().all(|t| t.status.is_success()));
}

#[tokio::test]
async fn test_deep_path_with_review_retry() {
    let dir = TempDir::new().unwrap();
    let script = Script::new();
    script.push_clarifier_round(clarifier_act_json(0.55, 2));
    script.push_clarifier_round(clarifier_act_json(0.85, 0));
    // review-1 fails its gate on both reflect cycles, review-2 passes.
    script.push_review_score(0.65);
    script.push_review_score(0.65);
    script.push_review_score(0.78);

    let orchestrator = orchestrator_with(scripted_provider(script), &dir);
    let session_id = orchestrator
        .start("Build an order management platform", SessionMode::Deep, None)
        .await
        .unwrap();

    let (observed, terminal) = drive_to_terminal(&orchestrator, &session_id).await;
    assert_seqs_strictly_increasing(&observed);
    assert!(matches!(
        terminal,
        EventPayload::Terminal {
            phase: SessionPhase::Done,
            error: None
        }
    ));

    // Exactly two documenting task groups exist, and both produced the
    // specification artifact.
    let store = SessionStore::new(dir.path()).unwrap();
    let record = store.load(&session_id).await.unwrap();
    let documents: Vec<&str> = record
        .tasks
        .iter()
        .filter(|t| t.id.starts_with("document-"))
        .map(|t| t.id.as_str())
        .collect();
    assert_eq!(documents, vec!["document-1", "document-2"]);
    assert!(record.tasks.iter().any(|t| t.id == "review-2"));
    assert_eq!(record.artifacts.len(), 2);
}

#[tokio::test]
async fn test_standard_review_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let script = Script::new();
    script.push_clarifier_round(clarifier_act_json(0.9, 0));
    // Standard mode gets no re-document iteration.
    script.push_review_score(0.5);
    script.push_review_score(0.5);

    let orchestrator = orchestrator_with(scripted_provider(script), &dir);
    let session_id = orchestrator
        .start("Build a reporting service", SessionMode::Standard, None)
        .await
        .unwrap();

    let (_, terminal) = drive_to_terminal(&orchestrator, &session_id).await;
    match terminal {
        EventPayload::Terminal { phase, error } => {
            assert_eq!(phase, SessionPhase::Failed);
            assert_eq!(error.unwrap().kind, "fatal");
        }
        other => panic!("unexpected terminal payload: {:?}", other),
    }
}

#[tokio::test]
async fn test_cancellation_mid_analysis() {
    let dir = TempDir::new().unwrap();
    let script = Script::new();
    script.push_clarifier_round(clarifier_act_json(0.9, 0));

    // A per-call latency keeps analysis tasks in flight long enough for the
    // cancellation to land mid-phase.
    let provider =
        scripted_provider(script).with_delay(std::time::Duration::from_millis(100));
    let orchestrator = orchestrator_with(provider, &dir);
    let session_id = orchestrator
        .start("Build a billing system", SessionMode::Standard, None)
        .await
        .unwrap();

    let mut stream = orchestrator.subscribe(&session_id, 0).await.unwrap();
    let mut terminal = None;
    let mut cancelled = false;
    loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(30), stream.recv())
            .await
            .expect("stream stalled")
            .expect("stream closed before terminal");
        match &event.payload {
            EventPayload::TaskUpdate { task_id, status, .. }
                if !cancelled
                    && task_id.starts_with("analyze.")
                    && *status == reqforge::session::AgentState::Running =>
            {
                cancelled = true;
                orchestrator.cancel(&session_id).await.unwrap();
            }
            EventPayload::Terminal { error, .. } => {
                terminal = error.clone();
                break;
            }
            _ => {}
        }
    }
    assert!(cancelled, "never observed a running analysis task");
    assert_eq!(terminal.unwrap().kind, "cancelled");

    // Every in-flight task wound up; nothing is left running.
    let store = SessionStore::new(dir.path()).unwrap();
    let record = store.load(&session_id).await.unwrap();
    assert!(
        record
            .tasks
            .iter()
            .all(|t| !t.status.is_active()),
        "tasks left active: {:?}",
        record
            .tasks
            .iter()
            .filter(|t| t.status.is_active())
            .map(|t| &t.id)
            .collect::<Vec<_>>()
    );
    assert!(record
        .tasks
        .iter()
        .any(|t| t.status == reqforge::session::AgentState::Interrupted));
}

#[tokio::test]
async fn test_start_rejects_empty_requirement() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator_with(scripted_provider(Script::new()), &dir);

    let err = orchestrator
        .start("   ", SessionMode::Quick, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
    // No session, no events.
    assert_eq!(orchestrator.active_sessions(), 0);
}

#[tokio::test]
async fn test_session_cap_returns_busy() {
    let dir = TempDir::new().unwrap();
    let script = Script::new();
    script.push_clarifier_round(clarifier_act_json(0.4, 1));
    let provider = scripted_provider(script);
    let mut config = common::test_config(&dir);
    config.orchestrator.max_sessions = 1;
    let orchestrator = Orchestrator::new(config, std::sync::Arc::new(provider)).unwrap();

    let _first = orchestrator
        .start("First requirement", SessionMode::Standard, None)
        .await
        .unwrap();
    let err = orchestrator
        .start("Second requirement", SessionMode::Standard, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "busy");
}

#[tokio::test]
async fn test_submit_answer_validation() {
    let dir = TempDir::new().unwrap();
    let script = Script::new();
    script.push_clarifier_round(clarifier_act_json(0.9, 0));

    let orchestrator = orchestrator_with(scripted_provider(script), &dir);
    let err = orchestrator
        .submit_answer("no-such-session", HashMap::from([("q".into(), "a".into())]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_session");

    let session_id = orchestrator
        .start("Build something small", SessionMode::Quick, None)
        .await
        .unwrap();
    let (_, terminal) = drive_to_terminal(&orchestrator, &session_id).await;
    assert!(matches!(
        terminal,
        EventPayload::Terminal {
            phase: SessionPhase::Done,
            ..
        }
    ));

    let err = orchestrator
        .submit_answer(&session_id, HashMap::from([("q".into(), "a".into())]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "session_terminal");
}
