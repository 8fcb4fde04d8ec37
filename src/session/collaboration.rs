//! Shared collaboration state for one session.
//!
//! A revisioned key-value map plus per-role agent states. Mutations are
//! serialized behind the lock and each mutation bumps the revision exactly
//! once; reads take a copy-on-read snapshot at the current revision.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Execution state shared by agents and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Preparing,
    Running,
    Succeeded,
    Failed,
    Interrupted,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Interrupted)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Preparing | Self::Running)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Default)]
struct CollaborationInner {
    roles: HashMap<String, AgentState>,
    shared: HashMap<String, serde_json::Value>,
    revision: u64,
}

/// Thread-safe collaboration state. Owned by the orchestrator; agents hold
/// it only for the duration of a single task and read via snapshots.
#[derive(Debug, Clone, Default)]
pub struct CollaborationState {
    inner: Arc<RwLock<CollaborationInner>>,
}

impl CollaborationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores state persisted with a session record.
    pub fn restore(
        roles: HashMap<String, AgentState>,
        shared: HashMap<String, serde_json::Value>,
        revision: u64,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CollaborationInner {
                roles,
                shared,
                revision,
            })),
        }
    }

    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    pub fn role_state(&self, role: &str) -> AgentState {
        self.inner
            .read()
            .roles
            .get(role)
            .copied()
            .unwrap_or_default()
    }

    /// Transitions a role's state, bumping the revision. Returns the
    /// post-transition revision.
    pub fn set_role_state(&self, role: &str, state: AgentState) -> u64 {
        let mut inner = self.inner.write();
        inner.roles.insert(role.to_string(), state);
        inner.revision += 1;
        inner.revision
    }

    /// Commits a staging map atomically: last-writer-wins per key, a single
    /// revision bump for the whole batch. Returns the post-commit revision
    /// and the keys written.
    pub fn commit(&self, staging: HashMap<String, serde_json::Value>) -> (u64, Vec<String>) {
        let mut inner = self.inner.write();
        let mut keys: Vec<String> = staging.keys().cloned().collect();
        keys.sort();
        for (key, value) in staging {
            inner.shared.insert(key, value);
        }
        inner.revision += 1;
        (inner.revision, keys)
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().shared.get(key).cloned()
    }

    /// Copy-on-read snapshot at the current revision.
    pub fn snapshot(&self) -> CollabSnapshot {
        let inner = self.inner.read();
        CollabSnapshot {
            revision: inner.revision,
            roles: inner.roles.clone(),
            shared: inner.shared.clone(),
        }
    }
}

/// Immutable view of the collaboration state at one revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabSnapshot {
    pub revision: u64,
    pub roles: HashMap<String, AgentState>,
    pub shared: HashMap<String, serde_json::Value>,
}

impl CollabSnapshot {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.shared.get(key)
    }

    /// Renders shared entries for prompt composition, sorted for stability.
    pub fn render_shared(&self) -> String {
        let mut keys: Vec<&String> = self.shared.keys().collect();
        keys.sort();
        keys.iter()
            .filter_map(|k| {
                self.shared
                    .get(*k)
                    .map(|v| format!("- {}: {}", k, compact_json(v)))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn compact_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
