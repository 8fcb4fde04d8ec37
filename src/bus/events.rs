//! Streamed session events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;
use crate::session::{AgentState, Message, QualitySnapshot, SessionPhase};

/// Wire-level event kinds observed by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    StateDelta,
    Message,
    TaskUpdate,
    Quality,
    Phase,
    Heartbeat,
    Terminal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Collaboration state mutated; carries the post-mutation revision.
    StateDelta {
        revision: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<AgentState>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        changed_keys: Vec<String>,
    },
    Message {
        message: Message,
    },
    /// Task state transition. Never evicted from the replay window.
    TaskUpdate {
        task_id: String,
        status: AgentState,
        progress: f64,
    },
    /// Progress-only update; evictable when the window is full.
    TaskProgress {
        task_id: String,
        progress: f64,
    },
    Quality {
        round: u32,
        snapshot: QualitySnapshot,
    },
    Phase {
        from: SessionPhase,
        to: SessionPhase,
    },
    Heartbeat,
    Terminal {
        phase: SessionPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StateDelta { .. } => EventKind::StateDelta,
            Self::Message { .. } => EventKind::Message,
            Self::TaskUpdate { .. } | Self::TaskProgress { .. } => EventKind::TaskUpdate,
            Self::Quality { .. } => EventKind::Quality,
            Self::Phase { .. } => EventKind::Phase,
            Self::Heartbeat => EventKind::Heartbeat,
            Self::Terminal { .. } => EventKind::Terminal,
        }
    }

    /// Eviction rank when the replay window overflows: heartbeats first,
    /// then progress-only updates. Replay-critical events return None.
    pub fn evict_rank(&self) -> Option<u8> {
        match self {
            Self::Heartbeat => Some(0),
            Self::TaskProgress { .. } => Some(1),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }

    pub fn state_delta(revision: u64, role: &str, state: AgentState) -> Self {
        Self::StateDelta {
            revision,
            role: Some(role.to_string()),
            state: Some(state),
            changed_keys: Vec::new(),
        }
    }

    pub fn state_commit(revision: u64, changed_keys: Vec<String>) -> Self {
        Self::StateDelta {
            revision,
            role: None,
            state: None,
            changed_keys,
        }
    }
}

/// One event in a session's totally ordered stream. Sequence numbers are
/// dense, strictly increasing, and assigned before publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: EventPayload,
}

impl SessionEvent {
    pub fn new(seq: u64, payload: EventPayload) -> Self {
        Self {
            seq,
            ts: Utc::now(),
            kind: payload.kind(),
            payload,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}
