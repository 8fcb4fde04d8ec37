//! Typed parsers for LLM output.
//!
//! Each stage owns a parser returning a typed record; free-form maps never
//! cross component boundaries. Parsers tolerate fenced code blocks and
//! leading prose around the JSON body.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::session::{Dimension, QuestionPriority};

/// Output of the Think stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThinkOutput {
    pub summary: String,
    pub insights: Vec<String>,
    pub next_actions: Vec<String>,
    pub confidence: f64,
    pub reasoning_chain: Vec<String>,
}

/// Output of one Act sub-step. `data` entries land in the staging map and
/// reach CollaborationState only at cycle commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActOutput {
    pub content: String,
    pub data: HashMap<String, serde_json::Value>,
}

/// Reflect rubric scores, each in [0,1].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectScores {
    pub completeness: f64,
    pub accuracy: f64,
    pub professionalism: f64,
    pub clarity: f64,
    pub actionability: f64,
    pub innovation: f64,
}

/// Per-dimension assessment produced by the Clarifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DimensionAssessment {
    pub score: f64,
    pub missing_aspects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionDraft {
    pub text: String,
    pub category: Dimension,
    #[serde(default = "default_priority")]
    pub priority: QuestionPriority,
}

fn default_priority() -> QuestionPriority {
    QuestionPriority::Med
}

/// Full Clarifier turn output: dimension scores plus candidate questions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClarifierAssessment {
    pub dimensions: BTreeMap<Dimension, DimensionAssessment>,
    pub questions: Vec<QuestionDraft>,
}

/// Extracts the JSON body from an LLM reply: a fenced block if present,
/// otherwise the outermost brace span.
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let body = after[..end].trim();
            if !body.is_empty() {
                return Some(body);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        Some(&trimmed[start..=end])
    } else {
        None
    }
}

fn parse_typed<T: for<'de> Deserialize<'de>>(text: &str, stage: &str) -> Result<T> {
    let body = extract_json(text)
        .ok_or_else(|| EngineError::Transient(format!("{}_parse", stage)))?;
    serde_json::from_str(body).map_err(|_| EngineError::Transient(format!("{}_parse", stage)))
}

pub fn parse_think(text: &str) -> Result<ThinkOutput> {
    let output: ThinkOutput = parse_typed(text, "think")?;
    if output.summary.is_empty() {
        return Err(EngineError::Transient("think_parse".into()));
    }
    Ok(output)
}

/// Act output falls back to plain text: roles that write documents reply
/// with markdown rather than JSON.
pub fn parse_act(text: &str) -> ActOutput {
    if let Some(body) = extract_json(text)
        && let Ok(output) = serde_json::from_str::<ActOutput>(body)
        && !output.content.is_empty()
    {
        return output;
    }
    ActOutput {
        content: text.trim().to_string(),
        data: HashMap::new(),
    }
}

pub fn parse_reflect(text: &str) -> Result<ReflectScores> {
    parse_typed(text, "reflect")
}

pub fn parse_clarifier(text: &str) -> Result<ClarifierAssessment> {
    let assessment: ClarifierAssessment = parse_typed(text, "clarifier")?;
    if assessment.dimensions.is_empty() {
        return Err(EngineError::Transient("clarifier_parse".into()));
    }
    Ok(assessment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fence() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_json_from_braces() {
        let text = "Sure! {\"a\": {\"b\": 2}} hope that helps";
        assert_eq!(extract_json(text), Some("{\"a\": {\"b\": 2}}"));
    }

    #[test]
    fn test_parse_think() {
        let text = r#"{"summary": "todo app", "insights": ["needs auth"],
            "next_actions": ["ask about users"], "confidence": 0.7,
            "reasoning_chain": ["short requirement"]}"#;
        let output = parse_think(text).unwrap();
        assert_eq!(output.summary, "todo app");
        assert_eq!(output.insights.len(), 1);
        assert!((output.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_parse_think_rejects_empty_summary() {
        let err = parse_think("{\"confidence\": 0.5}").unwrap_err();
        assert!(matches!(err, EngineError::Transient(kind) if kind == "think_parse"));
    }

    #[test]
    fn test_parse_think_rejects_garbage() {
        let err = parse_think("I could not produce JSON, sorry").unwrap_err();
        assert!(matches!(err, EngineError::Transient(_)));
    }

    #[test]
    fn test_parse_act_json() {
        let text = r#"{"content": "analysis text", "data": {"analysis.risk": "low"}}"#;
        let output = parse_act(text);
        assert_eq!(output.content, "analysis text");
        assert_eq!(output.data.len(), 1);
    }

    #[test]
    fn test_parse_act_plain_markdown() {
        let text = "# Requirements Specification\n\n## Scope\n...";
        let output = parse_act(text);
        assert!(output.content.starts_with("# Requirements Specification"));
        assert!(output.data.is_empty());
    }

    #[test]
    fn test_parse_reflect() {
        let text = r#"{"completeness": 0.8, "accuracy": 0.9, "professionalism": 0.7,
            "clarity": 0.8, "actionability": 0.6, "innovation": 0.5}"#;
        let scores = parse_reflect(text).unwrap();
        assert!((scores.accuracy - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_parse_clarifier() {
        let text = r#"{
            "dimensions": {
                "functional": {"score": 0.6, "missing_aspects": ["no CRUD detail"]},
                "user_roles": {"score": 0.4, "missing_aspects": ["roles undefined"]}
            },
            "questions": [
                {"text": "Who uses the app?", "category": "user_roles", "priority": "high"}
            ]
        }"#;
        let assessment = parse_clarifier(text).unwrap();
        assert_eq!(assessment.dimensions.len(), 2);
        assert_eq!(assessment.questions.len(), 1);
        assert_eq!(assessment.questions[0].category, Dimension::UserRoles);
        assert_eq!(assessment.questions[0].priority, QuestionPriority::High);
    }

    #[test]
    fn test_parse_clarifier_requires_dimensions() {
        let err = parse_clarifier("{\"questions\": []}").unwrap_err();
        assert!(matches!(err, EngineError::Transient(_)));
    }
}
