//! Clarification dialogue entities and the quality gate.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QualityConfig;

/// Inclusive-boundary comparisons on parsed floats.
const SCORE_EPSILON: f64 = 1e-9;

/// The eight requirement dimensions scored on every clarification turn.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Functional,
    NonFunctional,
    UserRoles,
    BusinessRules,
    Constraints,
    AcceptanceCriteria,
    Integration,
    Data,
}

impl Dimension {
    pub const ALL: [Dimension; 8] = [
        Dimension::Functional,
        Dimension::NonFunctional,
        Dimension::UserRoles,
        Dimension::BusinessRules,
        Dimension::Constraints,
        Dimension::AcceptanceCriteria,
        Dimension::Integration,
        Dimension::Data,
    ];

    /// Critical dimensions must individually clear the critical threshold
    /// for the gate to pass.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Functional | Self::AcceptanceCriteria | Self::UserRoles
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Functional => "functional",
            Self::NonFunctional => "non_functional",
            Self::UserRoles => "user_roles",
            Self::BusinessRules => "business_rules",
            Self::Constraints => "constraints",
            Self::AcceptanceCriteria => "acceptance_criteria",
            Self::Integration => "integration",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionPriority {
    High,
    Med,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub category: Dimension,
    pub priority: QuestionPriority,
}

impl Question {
    pub fn new(text: impl Into<String>, category: Dimension, priority: QuestionPriority) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            category,
            priority,
        }
    }
}

/// Score and deficiencies for a single dimension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionScore {
    pub score: f64,
    #[serde(default)]
    pub missing: Vec<String>,
}

/// Immutable quality assessment computed on each clarification turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySnapshot {
    pub scores: BTreeMap<Dimension, DimensionScore>,
    pub overall: f64,
    pub gate_passed: bool,
}

impl QualitySnapshot {
    /// Computes overall quality (equal-weighted mean over the eight
    /// dimensions; absent dimensions count as zero) and evaluates the gate.
    pub fn compute(scores: BTreeMap<Dimension, DimensionScore>, config: &QualityConfig) -> Self {
        let sum: f64 = Dimension::ALL
            .iter()
            .map(|d| scores.get(d).map(|s| s.score).unwrap_or(0.0))
            .sum();
        let overall = sum / Dimension::ALL.len() as f64;

        let criticals_ok = Dimension::ALL.iter().filter(|d| d.is_critical()).all(|d| {
            scores.get(d).map(|s| s.score).unwrap_or(0.0) + SCORE_EPSILON
                >= config.critical_threshold
        });
        let gate_passed =
            overall + SCORE_EPSILON >= config.overall_threshold && criticals_ok;

        Self {
            scores,
            overall,
            gate_passed,
        }
    }

    /// True when the overall floor is met at the round cap (inclusive).
    pub fn meets_floor(&self, config: &QualityConfig) -> bool {
        self.overall + SCORE_EPSILON >= config.floor_threshold
    }

    /// Dimensions ordered lowest score first, used to target questions.
    pub fn lowest_dimensions(&self) -> Vec<Dimension> {
        let mut dims: Vec<(Dimension, f64)> = Dimension::ALL
            .iter()
            .map(|d| (*d, self.scores.get(d).map(|s| s.score).unwrap_or(0.0)))
            .collect();
        dims.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        dims.into_iter().map(|(d, _)| d).collect()
    }
}

/// Outcome of recording one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// Same question answered with the same text before; a no-op.
    Duplicate,
    UnknownQuestion,
}

/// One question-answer turn. Appended as the dialogue progresses and never
/// mutated retroactively except for answer recording on the open round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationRound {
    pub id: String,
    pub sequence: u32,
    pub questions: Vec<Question>,
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
    pub quality: QualitySnapshot,
    pub asked_at: DateTime<Utc>,
}

impl ClarificationRound {
    pub fn new(sequence: u32, questions: Vec<Question>, quality: QualitySnapshot) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence,
            questions,
            answers: BTreeMap::new(),
            quality,
            asked_at: Utc::now(),
        }
    }

    /// Records an answer idempotently.
    pub fn record_answer(&mut self, question_id: &str, answer: &str) -> RecordOutcome {
        if !self.questions.iter().any(|q| q.id == question_id) {
            return RecordOutcome::UnknownQuestion;
        }
        match self.answers.get(question_id) {
            Some(existing) if existing == answer => RecordOutcome::Duplicate,
            _ => {
                self.answers
                    .insert(question_id.to_string(), answer.to_string());
                RecordOutcome::Recorded
            }
        }
    }

    pub fn all_answered(&self) -> bool {
        self.questions
            .iter()
            .all(|q| self.answers.contains_key(&q.id))
    }
}
