//! Failure-path behavior: idle timeout, provider outage, replay and
//! restart recovery.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use tempfile::TempDir;

use common::{clarifier_act_json, orchestrator_with, scripted_provider, test_config, Script};
use reqforge::bus::{EventKind, EventPayload};
use reqforge::error::EngineError;
use reqforge::llm::MockProvider;
use reqforge::orchestrator::Orchestrator;
use reqforge::session::{AgentState, Session, SessionMode, SessionPhase};
use reqforge::store::SessionStore;
use reqforge::task::Task;

async fn collect_until_terminal(
    orchestrator: &Orchestrator,
    session_id: &str,
    from_seq: u64,
) -> Vec<(u64, EventKind)> {
    let mut stream = orchestrator.subscribe(session_id, from_seq).await.unwrap();
    let mut observed = Vec::new();
    while let Some(event) = stream.recv().await {
        observed.push((event.seq, event.kind));
    }
    observed
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_fails_session() {
    let dir = TempDir::new().unwrap();
    let script = Script::new();
    script.push_clarifier_round(clarifier_act_json(0.5, 3));

    let orchestrator = orchestrator_with(scripted_provider(script), &dir);
    let session_id = orchestrator
        .start("Build a todo app", SessionMode::Standard, None)
        .await
        .unwrap();

    // Never submit answers; virtual time runs past the 1800s idle budget.
    let mut stream = orchestrator.subscribe(&session_id, 0).await.unwrap();
    let mut terminal = None;
    while let Some(event) = stream.recv().await {
        if let EventPayload::Terminal { phase, error } = event.payload {
            terminal = Some((phase, error));
        }
    }

    let (phase, error) = terminal.expect("terminal event");
    assert_eq!(phase, SessionPhase::Failed);
    assert_eq!(error.unwrap().kind, "idle_timeout");

    let snapshot = orchestrator.get_session(&session_id).await.unwrap();
    assert!(snapshot.artifacts.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_llm_outage_opens_circuit_and_fails_session() {
    let dir = TempDir::new().unwrap();
    // Every provider call fails with a retryable network error; the breaker
    // opens after five consecutive failures mid-flight.
    let provider = MockProvider::new()
        .with_handler(|_req| Err(EngineError::Transient("network: connection refused".into())));
    let orchestrator = orchestrator_with(provider, &dir);

    let session_id = orchestrator
        .start("Build a todo app", SessionMode::Standard, None)
        .await
        .unwrap();

    let observed = collect_until_terminal(&orchestrator, &session_id, 0).await;
    let kinds: Vec<EventKind> = observed.iter().map(|(_, k)| *k).collect();
    assert!(kinds.contains(&EventKind::Terminal));

    let snapshot = orchestrator.get_session(&session_id).await.unwrap();
    assert_eq!(snapshot.phase, SessionPhase::Failed);
    assert_eq!(snapshot.error.unwrap().kind, "llm_unavailable");

    // A state-delta marked the clarifier failed.
    let store = SessionStore::new(dir.path()).unwrap();
    let events = store.events_after(&session_id, 1).await.unwrap();
    let clarifier_failed = events.iter().any(|e| {
        matches!(
            &e.payload,
            EventPayload::StateDelta {
                role: Some(role),
                state: Some(AgentState::Failed),
                ..
            } if role == "clarifier"
        )
    });
    assert!(clarifier_failed);

    // Replaying from the start yields the identical sequence.
    let replay_a = collect_until_terminal(&orchestrator, &session_id, 0).await;
    let replay_b = collect_until_terminal(&orchestrator, &session_id, 0).await;
    assert_eq!(replay_a, replay_b);
    assert!(!replay_a.is_empty());
}

#[tokio::test]
async fn test_subscriber_reconnect_no_gaps_no_duplicates() {
    let dir = TempDir::new().unwrap();
    let script = Script::new();
    script.push_clarifier_round(clarifier_act_json(0.9, 0));

    let orchestrator = orchestrator_with(scripted_provider(script), &dir);
    let session_id = orchestrator
        .start("Build a todo app", SessionMode::Quick, None)
        .await
        .unwrap();

    // First subscriber reads a prefix, disconnects, reconnects after.
    let mut stream = orchestrator.subscribe(&session_id, 0).await.unwrap();
    let mut seen = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(std::time::Duration::from_secs(30), stream.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(event.seq);
    }
    drop(stream);

    let resume_from = seen.last().unwrap() + 1;
    let rest = collect_until_terminal(&orchestrator, &session_id, resume_from).await;
    let mut all: Vec<u64> = seen;
    all.extend(rest.iter().map(|(seq, _)| *seq));

    let expected: Vec<u64> = (1..=*all.last().unwrap()).collect();
    assert_eq!(all, expected, "gaps or duplicates across reconnect");
}

#[tokio::test]
async fn test_subscribe_unknown_session() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator_with(scripted_provider(Script::new()), &dir);
    let err = orchestrator.subscribe("missing", 0).await.unwrap_err();
    assert_eq!(err.kind(), "unknown_session");
}

#[tokio::test]
async fn test_stale_session_failed_on_recovery() {
    let dir = TempDir::new().unwrap();

    // A crashed engine left an active session behind, idle for an hour.
    {
        let store = SessionStore::new(dir.path()).unwrap();
        let mut session = Session::new("stale-1", "Old requirement", SessionMode::Standard);
        session.updated_at = chrono::Utc::now() - chrono::Duration::hours(1);
        store.save(&session).await.unwrap();
    }

    let orchestrator = orchestrator_with(scripted_provider(Script::new()), &dir);
    let resumed = orchestrator.recover().await.unwrap();
    assert_eq!(resumed, 0);

    let snapshot = orchestrator.get_session("stale-1").await.unwrap();
    assert_eq!(snapshot.phase, SessionPhase::Failed);
    assert_eq!(snapshot.error.unwrap().kind, "stale_session");

    // Subscribers observe the terminal event.
    let observed = collect_until_terminal(&orchestrator, "stale-1", 0).await;
    assert!(observed.iter().any(|(_, k)| *k == EventKind::Terminal));
}

#[tokio::test]
async fn test_fresh_session_resumes_to_completion() {
    let dir = TempDir::new().unwrap();

    // An active quick-mode session persisted moments before the "crash",
    // with its task tree seeded but clarification not yet started.
    {
        let store = SessionStore::new(dir.path()).unwrap();
        let mut session = Session::new("fresh-1", "Build a todo app", SessionMode::Quick);
        session.tasks = vec![
            Task::new("root", "fresh-1", "requirements analysis"),
            Task::new("clarify", "fresh-1", "clarify requirement").with_parent("root"),
            Task::new("analyze", "fresh-1", "analyze requirement")
                .with_parent("root")
                .with_dependencies(vec!["clarify".into()]),
            Task::new("document-1", "fresh-1", "write specification")
                .with_parent("root")
                .with_dependencies(vec!["analyze".into()]),
        ];
        store.save(&session).await.unwrap();
    }

    let script = Script::new();
    script.push_clarifier_round(clarifier_act_json(0.9, 0));
    let orchestrator = orchestrator_with(scripted_provider(script), &dir);
    let resumed = orchestrator.recover().await.unwrap();
    assert_eq!(resumed, 1);

    let observed = collect_until_terminal(&orchestrator, "fresh-1", 0).await;
    assert!(observed.iter().any(|(_, k)| *k == EventKind::Terminal));

    let snapshot = orchestrator.get_session("fresh-1").await.unwrap();
    assert_eq!(snapshot.phase, SessionPhase::Done);
    assert_eq!(snapshot.artifacts.len(), 1);
}

#[tokio::test]
async fn test_cancel_is_idempotent_after_terminal() {
    let dir = TempDir::new().unwrap();
    let script = Script::new();
    script.push_clarifier_round(clarifier_act_json(0.9, 0));

    let orchestrator = orchestrator_with(scripted_provider(script), &dir);
    let session_id = orchestrator
        .start("Build a todo app", SessionMode::Quick, None)
        .await
        .unwrap();

    let observed = collect_until_terminal(&orchestrator, &session_id, 0).await;
    let terminals = observed
        .iter()
        .filter(|(_, k)| *k == EventKind::Terminal)
        .count();
    assert_eq!(terminals, 1);

    // Cancelling a finished session neither errors nor re-publishes.
    orchestrator.cancel(&session_id).await.unwrap();
    let again = collect_until_terminal(&orchestrator, &session_id, 0).await;
    let terminals_again = again
        .iter()
        .filter(|(_, k)| *k == EventKind::Terminal)
        .count();
    assert_eq!(terminals_again, 1);
}

#[tokio::test]
async fn test_duplicate_answers_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let script = Script::new();
    script.push_clarifier_round(clarifier_act_json(0.5, 2));
    script.push_clarifier_round(clarifier_act_json(0.85, 0));

    let orchestrator = orchestrator_with(scripted_provider(script), &dir);
    let session_id = orchestrator
        .start("Build a todo app", SessionMode::Quick, None)
        .await
        .unwrap();

    // Wait for the questions, then answer the same question twice.
    let mut stream = orchestrator.subscribe(&session_id, 0).await.unwrap();
    let questions = loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(30), stream.recv())
            .await
            .unwrap()
            .unwrap();
        if let EventPayload::Message { message } = &event.payload
            && let reqforge::session::MessagePayload::Questions { questions, .. } =
                &message.payload
        {
            break questions.clone();
        }
    };

    let answers: HashMap<String, String> = questions
        .iter()
        .map(|q| (q.id.clone(), "same answer".to_string()))
        .collect();
    orchestrator
        .submit_answer(&session_id, answers.clone())
        .await
        .unwrap();
    // The duplicate is acknowledged but appends nothing.
    let _ = orchestrator.submit_answer(&session_id, answers).await;

    let mut terminal_count = 0;
    let mut answer_messages = 0;
    while let Some(event) = stream.recv().await {
        match &event.payload {
            EventPayload::Message { message } => {
                if matches!(
                    message.payload,
                    reqforge::session::MessagePayload::Answers { .. }
                ) {
                    answer_messages += 1;
                }
            }
            EventPayload::Terminal { .. } => terminal_count += 1,
            _ => {}
        }
    }
    assert_eq!(terminal_count, 1);
    assert_eq!(answer_messages, 1, "duplicate batch must not emit events");
}

#[tokio::test]
async fn test_clarification_exhausted_below_floor() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.orchestrator.max_rounds = 2;

    let script = Script::new();
    script.push_clarifier_round(clarifier_act_json(0.3, 1));
    script.push_clarifier_round(clarifier_act_json(0.4, 1));

    let orchestrator =
        Orchestrator::new(config, Arc::new(scripted_provider(Arc::clone(&script)))).unwrap();
    let session_id = orchestrator
        .start("Vague idea", SessionMode::Standard, None)
        .await
        .unwrap();

    let mut stream = orchestrator.subscribe(&session_id, 0).await.unwrap();
    let mut terminal_error = None;
    while let Some(event) = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        stream.recv(),
    )
    .await
    .unwrap()
    {
        match &event.payload {
            EventPayload::Message { message } => {
                if let reqforge::session::MessagePayload::Questions { questions, .. } =
                    &message.payload
                {
                    let answers: HashMap<String, String> = questions
                        .iter()
                        .map(|q| (q.id.clone(), "an answer".to_string()))
                        .collect();
                    orchestrator
                        .submit_answer(&session_id, answers)
                        .await
                        .unwrap();
                }
            }
            EventPayload::Terminal { error, .. } => {
                terminal_error = error.clone();
            }
            _ => {}
        }
    }
    assert_eq!(terminal_error.unwrap().kind, "clarification_exhausted");
}

#[tokio::test]
async fn test_round_cap_with_floor_promotes() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.orchestrator.max_rounds = 2;

    let script = Script::new();
    script.push_clarifier_round(clarifier_act_json(0.5, 1));
    // Exactly the floor: promotion, not failure.
    script.push_clarifier_round(clarifier_act_json(0.6, 0));

    let orchestrator =
        Orchestrator::new(config, Arc::new(scripted_provider(Arc::clone(&script)))).unwrap();
    let session_id = orchestrator
        .start("Modest idea", SessionMode::Quick, None)
        .await
        .unwrap();

    let mut stream = orchestrator.subscribe(&session_id, 0).await.unwrap();
    let mut phase = None;
    while let Some(event) = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        stream.recv(),
    )
    .await
    .unwrap()
    {
        match &event.payload {
            EventPayload::Message { message } => {
                if let reqforge::session::MessagePayload::Questions { questions, .. } =
                    &message.payload
                {
                    let answers: HashMap<String, String> = questions
                        .iter()
                        .map(|q| (q.id.clone(), "an answer".to_string()))
                        .collect();
                    orchestrator
                        .submit_answer(&session_id, answers)
                        .await
                        .unwrap();
                }
            }
            EventPayload::Terminal { phase: p, .. } => {
                phase = Some(*p);
            }
            _ => {}
        }
    }
    assert_eq!(phase, Some(SessionPhase::Done));
}
