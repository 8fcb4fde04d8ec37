//! Shared fixtures: a scripted provider that answers each agent stage by
//! recognizing its prompt, plus orchestrator construction over a temp store.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use reqforge::config::EngineConfig;
use reqforge::error::EngineError;
use reqforge::llm::MockProvider;
use reqforge::orchestrator::Orchestrator;

pub const THINK_JSON: &str = r#"{"summary": "planned", "insights": ["requirement is short"],
    "next_actions": ["proceed"], "confidence": 0.8, "reasoning_chain": ["terse input"]}"#;

pub fn reflect_json(value: f64) -> String {
    format!(
        r#"{{"completeness": {v}, "accuracy": {v}, "professionalism": {v},
            "clarity": {v}, "actionability": {v}, "innovation": {v}}}"#,
        v = value
    )
}

/// Clarifier act output: uniform dimension scores plus `questions`
/// high-priority drafts on the critical dimensions.
pub fn clarifier_act_json(score: f64, questions: usize) -> String {
    let dims = [
        "functional",
        "non_functional",
        "user_roles",
        "business_rules",
        "constraints",
        "acceptance_criteria",
        "integration",
        "data",
    ];
    let dimensions = dims
        .iter()
        .map(|d| format!(r#""{}": {{"score": {}, "missing_aspects": []}}"#, d, score))
        .collect::<Vec<_>>()
        .join(", ");

    let categories = ["user_roles", "functional", "acceptance_criteria", "data", "constraints"];
    let questions = (0..questions)
        .map(|i| {
            format!(
                r#"{{"text": "Question {}?", "category": "{}", "priority": "high"}}"#,
                i,
                categories[i % categories.len()]
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"{{"content": "assessment complete", "data": {{"clarifier.assessment": {{"dimensions": {{{}}}, "questions": [{}]}}}}}}"#,
        dimensions, questions
    )
}

fn analysis_act_json(prompt: &str) -> String {
    // The act template names its staging key: "data": {"analysis.<step>": ...
    let key = prompt
        .find("analysis.")
        .map(|at| {
            let rest = &prompt[at..];
            rest.split('"').next().unwrap_or("analysis.unknown")
        })
        .unwrap_or("analysis.unknown");
    format!(
        r#"{{"content": "findings for {key}", "data": {{"{key}": "condensed findings"}}}}"#,
    )
}

const WRITER_DOC: &str = "# Requirements Specification\n\n## Scope\nA complete specification.\n";

const REVIEWER_ACT: &str =
    r#"{"content": "REVIEW: two minor omissions", "data": {"review.findings": "minor"}}"#;

/// Scripted responses that vary per turn: clarifier assessments are consumed
/// round by round, reviewer reflect scores verdict by verdict.
#[derive(Default)]
pub struct Script {
    pub clarifier_rounds: Mutex<VecDeque<String>>,
    pub review_scores: Mutex<VecDeque<f64>>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_clarifier_round(&self, act_json: String) {
        self.clarifier_rounds.lock().push_back(act_json);
    }

    pub fn push_review_score(&self, score: f64) {
        self.review_scores.lock().push_back(score);
    }
}

pub fn scripted_provider(script: Arc<Script>) -> MockProvider {
    MockProvider::new().with_handler(move |req| {
        let prompt = req.prompt.as_str();

        if prompt.contains("Plan your approach") {
            return Ok(THINK_JSON.to_string());
        }
        if prompt.contains("Assess the requirement below across eight dimensions") {
            return script
                .clarifier_rounds
                .lock()
                .pop_front()
                .ok_or_else(|| EngineError::Internal("script ran out of clarifier rounds".into()));
        }
        if prompt.contains("Score the following work output") {
            // Reviewer output carries its marker into the reflect prompt.
            if prompt.contains("REVIEW:") {
                let score = script.review_scores.lock().pop_front().unwrap_or(0.9);
                return Ok(reflect_json(score));
            }
            return Ok(reflect_json(0.9));
        }
        if prompt.contains("Write a complete requirements specification") {
            return Ok(WRITER_DOC.to_string());
        }
        if prompt.contains("Review the specification") {
            return Ok(REVIEWER_ACT.to_string());
        }
        if prompt.contains("analysis.") {
            return Ok(analysis_act_json(prompt));
        }
        Err(EngineError::Internal(format!(
            "unscripted prompt: {:.80}",
            prompt
        )))
    })
}

pub fn test_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.store.path = dir.path().to_path_buf();
    config
}

pub fn orchestrator_with(provider: MockProvider, dir: &TempDir) -> Orchestrator {
    Orchestrator::new(test_config(dir), Arc::new(provider)).unwrap()
}
