//! Builtin role registry.
//!
//! Roles are data: sub-steps, prompt templates, rubric weights and a gate
//! threshold. The Clarifier drives the dialogue, the Analyst decomposes
//! the requirement, the Writer renders the specification document and the
//! Reviewer scores it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::{RoleSpec, RubricWeights, SubStep};
use crate::error::{EngineError, Result};

pub const ROLE_CLARIFIER: &str = "clarifier";
pub const ROLE_ANALYST: &str = "analyst";
pub const ROLE_WRITER: &str = "writer";
pub const ROLE_REVIEWER: &str = "reviewer";

/// File name of the specification artifact produced by the Writer.
pub const SPEC_ARTIFACT_NAME: &str = "requirements_spec.md";

/// Sub-steps of the analyze phase; each becomes a schedulable task.
pub const ANALYSIS_SUB_STEPS: [&str; 4] =
    ["business_process", "business_rules", "value", "risk"];

const THINK_TEMPLATE: &str = r#"You are working on a requirements-engineering task: {task}.

Requirement:
{requirement}

Shared findings so far:
{shared}

Related knowledge:
{knowledge}

Plan your approach. Reply with JSON only:
{"summary": "...", "insights": ["..."], "next_actions": ["..."], "confidence": 0.0, "reasoning_chain": ["..."]}"#;

const REFLECT_TEMPLATE: &str = r#"Score the following work output on each dimension from 0.0 to 1.0.

Output:
{content}

Reply with JSON only:
{"completeness": 0.0, "accuracy": 0.0, "professionalism": 0.0, "clarity": 0.0, "actionability": 0.0, "innovation": 0.0}"#;

fn clarifier() -> RoleSpec {
    RoleSpec {
        id: ROLE_CLARIFIER.into(),
        name: "Requirement Clarifier".into(),
        system_prompt: "You are a requirements analyst who identifies gaps in project descriptions."
            .into(),
        think_template: THINK_TEMPLATE.into(),
        sub_steps: vec![SubStep {
            id: "assess_requirement".into(),
            name: "Assess requirement quality".into(),
            prompt_template: r#"Assess the requirement below across eight dimensions
(functional, non_functional, user_roles, business_rules, constraints,
acceptance_criteria, integration, data), scoring each from 0.0 to 1.0, and
propose clarification questions for the weakest dimensions.

Requirement:
{requirement}

Prior findings:
{shared}

Reply with JSON only:
{"content": "one-paragraph assessment", "data": {"clarifier.assessment": {"dimensions": {"functional": {"score": 0.0, "missing_aspects": ["..."]}}, "questions": [{"text": "...", "category": "functional", "priority": "high"}]}}}"#
                .into(),
        }],
        reflect_template: REFLECT_TEMPLATE.into(),
        quality_weights: RubricWeights::default(),
        threshold: 0.6,
    }
}

fn analyst() -> RoleSpec {
    let sub_step = |id: &str, focus: &str| SubStep {
        id: id.into(),
        name: format!("Analyze {}", id),
        prompt_template: format!(
            r#"Analyze the {} of the requirement below, building on the clarified answers.

Requirement:
{{requirement}}

Planning summary: {{summary}}
Key insights: {{insights}}

Prior findings:
{{shared}}

Reply with JSON only:
{{"content": "analysis text", "data": {{"analysis.{}": "condensed findings"}}}}"#,
            focus, id
        ),
    };

    RoleSpec {
        id: ROLE_ANALYST.into(),
        name: "Business Analyst".into(),
        system_prompt: "You are a business analyst decomposing requirements into structured findings."
            .into(),
        think_template: THINK_TEMPLATE.into(),
        sub_steps: vec![
            sub_step("business_process", "end-to-end business processes"),
            sub_step("business_rules", "governing business rules and policies"),
            sub_step("value", "business value and success metrics"),
            sub_step("risk", "delivery and operational risks"),
        ],
        reflect_template: REFLECT_TEMPLATE.into(),
        quality_weights: RubricWeights::default(),
        threshold: 0.7,
    }
}

fn writer() -> RoleSpec {
    RoleSpec {
        id: ROLE_WRITER.into(),
        name: "Technical Writer".into(),
        system_prompt: "You are a technical writer producing specification documents.".into(),
        think_template: THINK_TEMPLATE.into(),
        sub_steps: vec![SubStep {
            id: "compose_document".into(),
            name: "Compose requirements specification".into(),
            prompt_template: r#"Write a complete requirements specification document in markdown,
covering scope, user roles, functional requirements, non-functional
requirements, business rules, constraints, acceptance criteria,
integrations and data requirements.

Requirement:
{requirement}

Analysis findings:
{shared}

Reply with the markdown document only."#
                .into(),
        }],
        reflect_template: REFLECT_TEMPLATE.into(),
        quality_weights: RubricWeights {
            clarity: 2.0,
            professionalism: 2.0,
            ..RubricWeights::default()
        },
        threshold: 0.7,
    }
}

fn reviewer() -> RoleSpec {
    RoleSpec {
        id: ROLE_REVIEWER.into(),
        name: "Quality Reviewer".into(),
        system_prompt: "You are a demanding reviewer of requirements specifications.".into(),
        think_template: THINK_TEMPLATE.into(),
        sub_steps: vec![SubStep {
            id: "review_document".into(),
            name: "Review specification".into(),
            prompt_template: r#"Review the specification stored in the shared findings against the
original requirement. List concrete defects and omissions.

Requirement:
{requirement}

Shared findings (including the document):
{shared}

Reply with JSON only:
{"content": "review findings", "data": {"review.findings": "condensed defect list"}}"#
                .into(),
        }],
        reflect_template: REFLECT_TEMPLATE.into(),
        quality_weights: RubricWeights {
            completeness: 2.0,
            accuracy: 2.0,
            ..RubricWeights::default()
        },
        threshold: 0.7,
    }
}

#[derive(Clone)]
pub struct RoleRegistry {
    roles: HashMap<String, Arc<RoleSpec>>,
}

impl RoleRegistry {
    /// Registry with the four builtin roles.
    pub fn builtin() -> Self {
        let mut roles = HashMap::new();
        for role in [clarifier(), analyst(), writer(), reviewer()] {
            roles.insert(role.id.clone(), Arc::new(role));
        }
        Self { roles }
    }

    pub fn get(&self, id: &str) -> Result<Arc<RoleSpec>> {
        self.roles
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("unknown role: {}", id)))
    }

    /// Registers or replaces a role. Adding a role is a data change.
    pub fn register(&mut self, role: RoleSpec) {
        self.roles.insert(role.id.clone(), Arc::new(role));
    }

    pub fn ids(&self) -> Vec<&str> {
        self.roles.keys().map(|s| s.as_str()).collect()
    }
}
