//! Per-session execution context: owns the live record, the collaboration
//! state and the event pipeline (sequence assignment, durable append,
//! revision/publication ordering).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::agent::AgentEvents;
use crate::bus::{EventPayload, SessionChannel};
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorInfo, Result};
use crate::scope::CancelScope;
use crate::session::{
    AgentState, CollaborationState, Message, MessagePayload, MessageRole, QualitySnapshot,
    Session, SessionPhase,
};
use crate::store::SessionStore;
use crate::task::TaskTree;

pub(crate) struct SessionCtx {
    pub session_id: String,
    pub config: EngineConfig,
    pub store: Arc<SessionStore>,
    pub channel: Arc<SessionChannel>,
    pub collab: CollaborationState,
    pub record: Mutex<Session>,
    pub tree: Mutex<TaskTree>,
    pub scope: CancelScope,
    /// Serializes revision bumps with their state-delta publication so
    /// revision order matches sequence order.
    publish_mu: Mutex<()>,
    /// Last progress emission per task, for rate limiting.
    progress_emitted: SyncMutex<HashMap<String, Instant>>,
}

impl SessionCtx {
    pub fn new(
        session: Session,
        tree: TaskTree,
        config: EngineConfig,
        store: Arc<SessionStore>,
        channel: Arc<SessionChannel>,
        collab: CollaborationState,
        scope: CancelScope,
    ) -> Self {
        Self {
            session_id: session.id.clone(),
            config,
            store,
            channel,
            collab,
            record: Mutex::new(session),
            tree: Mutex::new(tree),
            scope,
            publish_mu: Mutex::new(()),
            progress_emitted: SyncMutex::new(HashMap::new()),
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        self.record.lock().await.phase
    }

    /// Assigns the next sequence, delivers to live subscribers, and appends
    /// durably to the event log.
    pub async fn publish(&self, payload: EventPayload) -> u64 {
        let Some(event) = self.channel.publish(payload) else {
            return self.channel.last_seq();
        };
        let seq = event.seq;

        if let Err(e) = self.store.append_event(&self.session_id, event).await {
            error!(
                session_id = %self.session_id,
                seq,
                error = %e,
                "Failed to append event durably"
            );
        }

        let mut record = self.record.lock().await;
        record.last_seq = record.last_seq.max(seq);
        seq
    }

    /// Persists the live record with fresh task-tree and collaboration
    /// snapshots.
    pub async fn persist(&self) -> Result<()> {
        let tasks = self.tree.lock().await.snapshot();
        let collab = self.collab.snapshot();
        let mut record = self.record.lock().await;
        record.tasks = tasks;
        record.revision = collab.revision;
        record.collab_shared = collab.shared;
        record.collab_roles = collab.roles;
        record.touch();
        self.store.save(&record).await
    }

    /// Validated phase transition; publishes the phase event and persists.
    pub async fn change_phase(&self, to: SessionPhase) -> Result<()> {
        let from = {
            let mut record = self.record.lock().await;
            let from = record.phase;
            if from == to {
                return Ok(());
            }
            if !from.can_transition_to(to) {
                return Err(EngineError::Internal(format!(
                    "illegal phase transition {} -> {}",
                    from, to
                )));
            }
            record.phase = to;
            record.touch();
            from
        };

        info!(session_id = %self.session_id, %from, %to, "Phase transition");
        self.publish(EventPayload::Phase { from, to }).await;
        self.persist().await
    }

    /// Terminal transition: records the outcome, publishes the final phase
    /// event and exactly one terminal event, then persists. A session that
    /// is already terminal is left untouched.
    pub async fn finish(&self, phase: SessionPhase, error: Option<ErrorInfo>) {
        debug_assert!(phase.is_terminal());
        let from = {
            let mut record = self.record.lock().await;
            if record.phase.is_terminal() {
                return;
            }
            let from = record.phase;
            record.phase = phase;
            record.error = error.clone();
            record.touch();
            from
        };

        info!(
            session_id = %self.session_id,
            %from,
            %phase,
            error = error.as_ref().map(|e| e.kind.as_str()).unwrap_or("none"),
            "Session finished"
        );

        self.publish(EventPayload::Phase { from, to: phase }).await;
        self.publish(EventPayload::Terminal { phase, error }).await;
        if let Err(e) = self.persist().await {
            error!(session_id = %self.session_id, error = %e, "Failed to persist terminal state");
        }
    }

    /// Appends a message to the record and publishes it.
    pub async fn message(&self, role: MessageRole, author: &str, payload: MessagePayload) {
        let message = Message::new(&self.session_id, role, author, payload);
        self.record.lock().await.messages.push(message.clone());
        self.publish(EventPayload::Message { message }).await;
    }

    pub async fn quality(&self, round: u32, snapshot: QualitySnapshot) {
        self.publish(EventPayload::Quality { round, snapshot }).await;
    }

    /// Task state transition event; always published, never evicted.
    pub async fn task_update(&self, task_id: &str) {
        let (status, progress) = {
            let tree = self.tree.lock().await;
            match tree.get(task_id) {
                Some(task) => (task.status, task.progress),
                None => return,
            }
        };
        self.publish(EventPayload::TaskUpdate {
            task_id: task_id.to_string(),
            status,
            progress,
        })
        .await;
        self.refresh_session_progress().await;
    }

    /// Recomputes the session progress from the root task roll-up.
    pub async fn refresh_session_progress(&self) {
        let rolled = {
            let mut tree = self.tree.lock().await;
            tree.roll_up(super::ROOT_TASK_ID)
        };
        let mut record = self.record.lock().await;
        if rolled > record.progress {
            record.progress = rolled;
        }
    }
}

#[async_trait::async_trait]
impl AgentEvents for SessionCtx {
    async fn set_role_state(&self, role: &str, state: AgentState) {
        let _guard = self.publish_mu.lock().await;
        let revision = self.collab.set_role_state(role, state);
        self.publish(EventPayload::state_delta(revision, role, state))
            .await;
    }

    async fn commit_shared(&self, staging: HashMap<String, serde_json::Value>) -> u64 {
        let _guard = self.publish_mu.lock().await;
        let (revision, keys) = self.collab.commit(staging);
        self.publish(EventPayload::state_commit(revision, keys)).await;
        revision
    }

    async fn task_progress(&self, task_id: &str, progress: f64) {
        {
            let mut tree = self.tree.lock().await;
            if let Some(task) = tree.get_mut(task_id) {
                task.set_progress(progress);
            }
        }

        // Rate limit: at most one progress event per task per interval;
        // completion (1.0) always goes out.
        let interval = Duration::from_millis(self.config.orchestrator.progress_interval_ms);
        let emit = {
            let mut emitted = self.progress_emitted.lock();
            let now = Instant::now();
            let due = emitted
                .get(task_id)
                .map(|last| now.duration_since(*last) >= interval)
                .unwrap_or(true);
            if due || progress >= 1.0 {
                emitted.insert(task_id.to_string(), now);
                true
            } else {
                false
            }
        };

        if emit {
            self.publish(EventPayload::TaskProgress {
                task_id: task_id.to_string(),
                progress,
            })
            .await;
            self.refresh_session_progress().await;
        } else {
            debug!(task_id, progress, "Progress event rate-limited");
        }
    }

    async fn agent_message(&self, role: &str, payload: MessagePayload) {
        self.message(MessageRole::Agent, role, payload).await;
    }
}
