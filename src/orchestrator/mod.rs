//! Flow orchestrator: session lifecycle, clarification dialogue, task
//! scheduling and event publication.

mod clarify;
mod context;
mod engine;
mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::AgentRuntime;
use crate::bus::{EventBus, EventPayload, EventStream};
use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorInfo, Result};
use crate::knowledge::{KnowledgeSearch, NullKnowledge};
use crate::llm::{LlmGateway, LlmProvider};
use crate::roles::RoleRegistry;
use crate::scope::CancelScope;
use crate::session::{
    CollaborationState, Session, SessionMode, SessionPhase, SessionSnapshot,
};
use crate::store::SessionStore;
use crate::task::{Task, TaskTree};

use context::SessionCtx;
use engine::SessionDriver;
use scheduler::PhaseScheduler;

pub(crate) const ROOT_TASK_ID: &str = "root";
pub(crate) const CLARIFY_TASK_ID: &str = "clarify";
pub(crate) const ANALYZE_TASK_ID: &str = "analyze";

/// One `submit_answer` payload: question id to answer text.
pub type AnswerBatch = HashMap<String, String>;

struct SessionHandle {
    scope: CancelScope,
    answers_tx: mpsc::Sender<AnswerBatch>,
    ctx: Arc<SessionCtx>,
    driver: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

struct OrchestratorInner {
    config: EngineConfig,
    store: Arc<SessionStore>,
    bus: EventBus,
    gateway: Arc<LlmGateway>,
    runtime: Arc<AgentRuntime>,
    roles: RoleRegistry,
    knowledge: Arc<dyn KnowledgeSearch>,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    root_scope: CancelScope,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, provider: Arc<dyn LlmProvider>) -> Result<Self> {
        Self::with_knowledge(config, provider, Arc::new(NullKnowledge))
    }

    pub fn with_knowledge(
        config: EngineConfig,
        provider: Arc<dyn LlmProvider>,
        knowledge: Arc<dyn KnowledgeSearch>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(SessionStore::new(&config.store.path)?);
        let bus = EventBus::new(config.bus.clone());
        let gateway = Arc::new(LlmGateway::new(provider, config.llm.clone()));
        let runtime = Arc::new(AgentRuntime::new(config.agent.clone()));

        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                config,
                store,
                bus,
                gateway,
                runtime,
                roles: RoleRegistry::builtin(),
                knowledge,
                sessions: RwLock::new(HashMap::new()),
                root_scope: CancelScope::new(),
            }),
        })
    }

    /// Starts a new session: allocates it, seeds the task tree, publishes
    /// the initial phase event and spawns the phase driver.
    pub async fn start(
        &self,
        requirement_text: &str,
        mode: SessionMode,
        project_context: Option<String>,
    ) -> Result<String> {
        let requirement = requirement_text.trim();
        if requirement.is_empty() {
            return Err(EngineError::InvalidInput("empty requirement text".into()));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(&session_id, requirement, mode)
            .with_project_context(project_context);
        let tree = seed_task_tree(&session)?;

        let limit = self.inner.config.orchestrator.max_sessions;
        if self.inner.sessions.read().len() >= limit {
            return Err(EngineError::Busy { limit });
        }

        let mut session = session;
        session.tasks = tree.snapshot();
        self.inner.store.save(&session).await?;

        self.spawn_session(
            session,
            tree,
            CollaborationState::new(),
            Some(EventPayload::Phase {
                from: SessionPhase::Clarifying,
                to: SessionPhase::Clarifying,
            }),
        )
        .await?;

        info!(session_id = %session_id, %mode, "Session started");
        Ok(session_id)
    }

    /// Appends user answers to the current clarification round.
    pub async fn submit_answer(&self, session_id: &str, answers: AnswerBatch) -> Result<()> {
        if answers.is_empty() {
            return Err(EngineError::InvalidInput("no answers supplied".into()));
        }

        let handle = self.inner.sessions.read().get(session_id).cloned();
        match handle {
            Some(handle) => {
                let phase = handle.ctx.phase().await;
                if phase.is_terminal() {
                    return Err(EngineError::SessionTerminal(session_id.to_string()));
                }
                if phase != SessionPhase::Clarifying {
                    return Err(EngineError::NotClarifying(session_id.to_string()));
                }
                handle
                    .answers_tx
                    .send(answers)
                    .await
                    .map_err(|_| EngineError::NotClarifying(session_id.to_string()))
            }
            None => {
                let session = self.inner.store.load(session_id).await?;
                if session.is_terminal() {
                    Err(EngineError::SessionTerminal(session_id.to_string()))
                } else {
                    Err(EngineError::NotClarifying(session_id.to_string()))
                }
            }
        }
    }

    /// Subscribes to a session's event stream from a cursor.
    pub async fn subscribe(&self, session_id: &str, from_seq: u64) -> Result<EventStream> {
        if let Some(channel) = self.inner.bus.existing(session_id) {
            return channel.subscribe(from_seq);
        }

        if !self.inner.store.exists(session_id).await {
            return Err(EngineError::UnknownSession(session_id.to_string()));
        }
        let events = self
            .inner
            .store
            .event_tail(session_id, self.inner.config.bus.retention)
            .await?;
        let channel = self.inner.bus.restore(session_id, events);
        channel.subscribe(from_seq)
    }

    /// Requests cooperative cancellation. Terminal sessions are left as-is;
    /// a live session publishes its terminal event once wind-up completes.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let handle = self.inner.sessions.read().get(session_id).cloned();
        match handle {
            Some(handle) => {
                info!(session_id, "Cancellation requested");
                handle.scope.cancel();
                Ok(())
            }
            None => {
                let session = self.inner.store.load(session_id).await?;
                if session.is_terminal() {
                    return Ok(());
                }
                // Active in the store but not live in this process.
                self.fail_cold(session, &EngineError::Cancelled).await
            }
        }
    }

    /// Snapshot of a session's externally visible state.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot> {
        let handle = self.inner.sessions.read().get(session_id).cloned();
        match handle {
            Some(handle) => {
                let record = handle.ctx.record.lock().await;
                Ok(SessionSnapshot::from(&*record))
            }
            None => {
                let session = self.inner.store.load(session_id).await?;
                Ok(SessionSnapshot::from(&session))
            }
        }
    }

    /// Restart recovery: stale sessions are failed, fresh ones resumed.
    /// Returns the number of sessions resumed.
    pub async fn recover(&self) -> Result<usize> {
        self.inner.store.init().await?;
        let active = self.inner.store.list_active().await?;
        let stale_after =
            ChronoDuration::seconds(self.inner.config.orchestrator.stale_threshold_secs as i64);
        let mut resumed = 0;

        for session in active {
            let last_activity = self
                .inner
                .store
                .last_event_ts(&session.id)
                .await?
                .unwrap_or(session.updated_at);

            if Utc::now() - last_activity > stale_after {
                warn!(session_id = %session.id, "Stale session failed during recovery");
                self.fail_cold(session, &EngineError::StaleSession("recovery".into()))
                    .await?;
                continue;
            }

            debug!(session_id = %session.id, phase = %session.phase, "Resuming session");
            let events = self
                .inner
                .store
                .event_tail(&session.id, self.inner.config.bus.retention)
                .await?;
            self.inner.bus.restore(&session.id, events);

            let collab = CollaborationState::restore(
                session.collab_roles.clone(),
                session.collab_shared.clone(),
                session.revision,
            );
            let tree = TaskTree::from_tasks(session.tasks.clone());
            self.spawn_session(session, tree, collab, None).await?;
            resumed += 1;
        }

        self.purge_expired().await?;
        Ok(resumed)
    }

    /// Purges terminal sessions past the retention TTL.
    pub async fn purge_expired(&self) -> Result<usize> {
        let expired = self
            .inner
            .store
            .expired(self.inner.config.orchestrator.retention_days)
            .await?;
        let count = expired.len();
        for session_id in expired {
            info!(session_id = %session_id, "Purging expired session");
            self.inner.store.purge(&session_id).await?;
            self.inner.bus.remove(&session_id);
        }
        Ok(count)
    }

    /// Cancels every live session and waits for drivers to wind up.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.inner.root_scope.cancel();

        let drivers: Vec<JoinHandle<()>> = {
            let sessions = self.inner.sessions.read();
            sessions
                .values()
                .filter_map(|handle| handle.driver.lock().take())
                .collect()
        };
        let windup =
            std::time::Duration::from_secs(self.inner.config.orchestrator.cancel_windup_secs + 1);
        for driver in drivers {
            let _ = tokio::time::timeout(windup, driver).await;
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Builds the per-session context, publishes the initial event if any,
    /// then spawns the driver and heartbeat.
    async fn spawn_session(
        &self,
        session: Session,
        tree: TaskTree,
        collab: CollaborationState,
        initial: Option<EventPayload>,
    ) -> Result<Arc<SessionCtx>> {
        let session_id = session.id.clone();
        let scope = self.inner.root_scope.child();
        let channel = self.inner.bus.channel(&session_id);
        let (answers_tx, answers_rx) = mpsc::channel(32);

        let ctx = Arc::new(SessionCtx::new(
            session,
            tree,
            self.inner.config.clone(),
            Arc::clone(&self.inner.store),
            Arc::clone(&channel),
            collab,
            scope.clone(),
        ));

        if let Some(payload) = initial {
            ctx.publish(payload).await;
        }

        let driver = SessionDriver {
            scheduler: PhaseScheduler {
                runtime: Arc::clone(&self.inner.runtime),
                gateway: Arc::clone(&self.inner.gateway),
                knowledge: Arc::clone(&self.inner.knowledge),
            },
            roles: self.inner.roles.clone(),
        };

        // Heartbeat keeps silent sessions observable.
        let heartbeat_ctx = Arc::clone(&ctx);
        let heartbeat_scope = scope.clone();
        let interval = self.inner.bus.heartbeat_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = heartbeat_scope.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if heartbeat_ctx.channel.is_closed() {
                            break;
                        }
                        if heartbeat_ctx.channel.heartbeat_due(interval) {
                            heartbeat_ctx.publish(EventPayload::Heartbeat).await;
                        }
                    }
                }
            }
        });

        let driver_ctx = Arc::clone(&ctx);
        let inner = Arc::clone(&self.inner);
        let driver_id = session_id.clone();
        let driver_handle = tokio::spawn(async move {
            driver.run(driver_ctx, answers_rx).await;
            inner.sessions.write().remove(&driver_id);
        });

        let handle = Arc::new(SessionHandle {
            scope,
            answers_tx,
            ctx: Arc::clone(&ctx),
            driver: parking_lot::Mutex::new(Some(driver_handle)),
        });
        self.inner.sessions.write().insert(session_id, handle);
        Ok(ctx)
    }

    /// Fails a session that has no live driver: publishes the final phase
    /// and terminal events durably and persists the record.
    async fn fail_cold(&self, mut session: Session, err: &EngineError) -> Result<()> {
        let events = self
            .inner
            .store
            .event_tail(&session.id, self.inner.config.bus.retention)
            .await?;
        let channel = self.inner.bus.restore(&session.id, events);

        let from = session.phase;
        session.phase = SessionPhase::Failed;
        session.error = Some(ErrorInfo::from(err));
        session.touch();

        for payload in [
            EventPayload::Phase {
                from,
                to: SessionPhase::Failed,
            },
            EventPayload::Terminal {
                phase: SessionPhase::Failed,
                error: session.error.clone(),
            },
        ] {
            if let Some(event) = channel.publish(payload) {
                session.last_seq = session.last_seq.max(event.seq);
                self.inner.store.append_event(&session.id, event).await?;
            }
        }

        self.inner.store.save(&session).await
    }
}

/// Seeds the task tree for a new session: root plus the phase tasks the
/// mode will visit, chained by dependencies.
fn seed_task_tree(session: &Session) -> Result<TaskTree> {
    let mut tree = TaskTree::new();
    let sid = &session.id;

    tree.insert(Task::new(ROOT_TASK_ID, sid, "requirements analysis"))?;
    tree.insert(
        Task::new(CLARIFY_TASK_ID, sid, "clarify requirement")
            .with_parent(ROOT_TASK_ID)
            .with_participant(crate::task::Participant::new(
                crate::roles::ROLE_CLARIFIER,
                CLARIFY_TASK_ID,
            )),
    )?;
    tree.insert(
        Task::new(ANALYZE_TASK_ID, sid, "analyze requirement")
            .with_parent(ROOT_TASK_ID)
            .with_dependencies(vec![CLARIFY_TASK_ID.to_string()])
            .with_participant(crate::task::Participant::new(
                crate::roles::ROLE_ANALYST,
                ANALYZE_TASK_ID,
            )),
    )?;
    tree.insert(
        Task::new("document-1", sid, "write specification")
            .with_parent(ROOT_TASK_ID)
            .with_dependencies(vec![ANALYZE_TASK_ID.to_string()])
            .with_participant(crate::task::Participant::new(
                crate::roles::ROLE_WRITER,
                "document-1",
            )),
    )?;
    if !session.mode.skips_review() {
        tree.insert(
            Task::new("review-1", sid, "review specification")
                .with_parent(ROOT_TASK_ID)
                .with_dependencies(vec!["document-1".to_string()])
                .with_participant(crate::task::Participant::new(
                    crate::roles::ROLE_REVIEWER,
                    "review-1",
                )),
        )?;
    }
    Ok(tree)
}
