//! Per-session publish/subscribe with bounded replay.
//!
//! Each session owns a channel assigning dense sequence numbers under its
//! lock, retaining a bounded replay window, and fanning out live events to
//! any number of subscribers with independent cursors.

mod events;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use events::{EventKind, EventPayload, SessionEvent};

use crate::config::BusConfig;
use crate::error::{EngineError, Result};

#[derive(Debug)]
struct ChannelInner {
    next_seq: u64,
    retained: VecDeque<SessionEvent>,
    last_publish_at: Instant,
    closed: bool,
}

/// Event channel for one session.
#[derive(Debug)]
pub struct SessionChannel {
    session_id: String,
    config: BusConfig,
    tx: broadcast::Sender<SessionEvent>,
    inner: Mutex<ChannelInner>,
}

impl SessionChannel {
    fn new(session_id: &str, config: BusConfig) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity);
        Self {
            session_id: session_id.to_string(),
            config,
            tx,
            inner: Mutex::new(ChannelInner {
                next_seq: 1,
                retained: VecDeque::new(),
                last_publish_at: Instant::now(),
                closed: false,
            }),
        }
    }

    /// Seeds the channel from persisted events during recovery.
    fn restore(&self, events: Vec<SessionEvent>) {
        let mut inner = self.inner.lock();
        if let Some(last) = events.last() {
            inner.next_seq = last.seq + 1;
            inner.closed = events.iter().any(|e| e.is_terminal());
        }
        let skip = events.len().saturating_sub(self.config.retention);
        inner.retained = events.into_iter().skip(skip).collect();
    }

    /// Assigns the next sequence number and publishes. Non-blocking: the
    /// replay window evicts by rank when full, live delivery drops laggards.
    /// Returns the published event, or None if the channel is closed.
    pub fn publish(&self, payload: EventPayload) -> Option<SessionEvent> {
        let mut inner = self.inner.lock();
        if inner.closed {
            warn!(
                session_id = %self.session_id,
                kind = ?payload.kind(),
                "Publish after terminal event dropped"
            );
            return None;
        }

        let event = SessionEvent::new(inner.next_seq, payload);
        inner.next_seq += 1;
        inner.last_publish_at = Instant::now();
        if event.is_terminal() {
            inner.closed = true;
        }

        if inner.retained.len() >= self.config.retention {
            Self::evict_one(&mut inner.retained);
        }
        inner.retained.push_back(event.clone());
        drop(inner);

        // No receivers is fine; replay covers late subscribers.
        let _ = self.tx.send(event.clone());
        Some(event)
    }

    fn evict_one(retained: &mut VecDeque<SessionEvent>) {
        for rank in 0..=1u8 {
            if let Some(pos) = retained
                .iter()
                .position(|e| e.payload.evict_rank() == Some(rank))
            {
                retained.remove(pos);
                return;
            }
        }
        // Window full of replay-critical events: the window slides.
        retained.pop_front();
    }

    /// Subscribes from a cursor: replays retained events with
    /// `seq >= from_seq`, then yields live events in order.
    pub fn subscribe(self: &Arc<Self>, from_seq: u64) -> Result<EventStream> {
        let inner = self.inner.lock();
        let from = from_seq.max(1);
        let oldest = inner.retained.front().map(|e| e.seq).unwrap_or(inner.next_seq);

        // The cursor fell out of the retention window.
        if from < oldest && oldest > 1 {
            return Err(EngineError::ReplayUnavailable {
                requested: from_seq,
                oldest,
            });
        }

        let replay: VecDeque<SessionEvent> = inner
            .retained
            .iter()
            .filter(|e| e.seq >= from)
            .cloned()
            .collect();
        // Subscribe under the lock so no event falls between replay and live.
        let rx = self.tx.subscribe();
        drop(inner);

        debug!(
            session_id = %self.session_id,
            from_seq,
            replayed = replay.len(),
            "Subscriber attached"
        );

        Ok(EventStream {
            channel: Arc::clone(self),
            replay,
            rx,
            last_seq: from.saturating_sub(1),
            terminated: false,
        })
    }

    /// Retained events strictly after `seq`; used to resynchronize lagged
    /// subscribers without gaps.
    fn retained_after(&self, seq: u64) -> VecDeque<SessionEvent> {
        self.inner
            .lock()
            .retained
            .iter()
            .filter(|e| e.seq > seq)
            .cloned()
            .collect()
    }

    /// True when nothing has been published for the heartbeat interval.
    pub fn heartbeat_due(&self, interval: std::time::Duration) -> bool {
        let inner = self.inner.lock();
        !inner.closed && inner.last_publish_at.elapsed() >= interval
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }
}

/// Ordered event stream for one subscriber. Yields `None` after the
/// terminal event has been delivered.
#[derive(Debug)]
pub struct EventStream {
    channel: Arc<SessionChannel>,
    replay: VecDeque<SessionEvent>,
    rx: broadcast::Receiver<SessionEvent>,
    last_seq: u64,
    terminated: bool,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            if self.terminated {
                return None;
            }
            if let Some(event) = self.replay.pop_front() {
                if event.seq <= self.last_seq {
                    continue;
                }
                return Some(self.deliver(event));
            }
            match self.rx.recv().await {
                Ok(event) if event.seq <= self.last_seq => continue,
                Ok(event) => return Some(self.deliver(event)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Subscriber lagged; resyncing from window");
                    self.replay = self.channel.retained_after(self.last_seq);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn deliver(&mut self, event: SessionEvent) -> SessionEvent {
        self.last_seq = event.seq;
        if event.is_terminal() {
            self.terminated = true;
        }
        event
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}

/// Registry of session channels.
pub struct EventBus {
    config: BusConfig,
    channels: RwLock<HashMap<String, Arc<SessionChannel>>>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Gets or creates the channel for a session.
    pub fn channel(&self, session_id: &str) -> Arc<SessionChannel> {
        if let Some(channel) = self.channels.read().get(session_id) {
            return Arc::clone(channel);
        }
        let mut channels = self.channels.write();
        Arc::clone(
            channels
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(SessionChannel::new(session_id, self.config.clone()))),
        )
    }

    pub fn existing(&self, session_id: &str) -> Option<Arc<SessionChannel>> {
        self.channels.read().get(session_id).cloned()
    }

    /// Seeds a channel from persisted events during restart recovery.
    pub fn restore(&self, session_id: &str, events: Vec<SessionEvent>) -> Arc<SessionChannel> {
        let channel = self.channel(session_id);
        channel.restore(events);
        channel
    }

    pub fn remove(&self, session_id: &str) {
        self.channels.write().remove(session_id);
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.heartbeat_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionPhase;

    fn bus() -> EventBus {
        EventBus::new(BusConfig::default())
    }

    fn small_bus(retention: usize) -> EventBus {
        EventBus::new(BusConfig {
            retention,
            ..BusConfig::default()
        })
    }

    #[tokio::test]
    async fn test_sequences_are_dense_and_increasing() {
        let bus = bus();
        let channel = bus.channel("s-1");
        for i in 1..=5u64 {
            let event = channel.publish(EventPayload::Heartbeat).unwrap();
            assert_eq!(event.seq, i);
        }
        assert_eq!(channel.last_seq(), 5);
    }

    #[tokio::test]
    async fn test_replay_then_live() {
        let bus = bus();
        let channel = bus.channel("s-1");
        channel.publish(EventPayload::Heartbeat);
        channel.publish(EventPayload::Heartbeat);

        let mut stream = channel.subscribe(1).unwrap();
        assert_eq!(stream.recv().await.unwrap().seq, 1);
        assert_eq!(stream.recv().await.unwrap().seq, 2);

        channel.publish(EventPayload::Heartbeat);
        assert_eq!(stream.recv().await.unwrap().seq, 3);
    }

    #[tokio::test]
    async fn test_terminal_closes_stream() {
        let bus = bus();
        let channel = bus.channel("s-1");
        channel.publish(EventPayload::Heartbeat);
        channel.publish(EventPayload::Terminal {
            phase: SessionPhase::Done,
            error: None,
        });

        let mut stream = channel.subscribe(0).unwrap();
        assert_eq!(stream.recv().await.unwrap().seq, 1);
        let terminal = stream.recv().await.unwrap();
        assert!(terminal.is_terminal());
        assert!(stream.recv().await.is_none());

        // Publishing after terminal is dropped.
        assert!(channel.publish(EventPayload::Heartbeat).is_none());
    }

    #[tokio::test]
    async fn test_independent_cursors() {
        let bus = bus();
        let channel = bus.channel("s-1");
        for _ in 0..4 {
            channel.publish(EventPayload::Heartbeat);
        }

        let mut early = channel.subscribe(1).unwrap();
        let mut late = channel.subscribe(3).unwrap();
        assert_eq!(early.recv().await.unwrap().seq, 1);
        assert_eq!(late.recv().await.unwrap().seq, 3);
    }

    #[tokio::test]
    async fn test_reconnect_resumes_without_duplicates() {
        let bus = bus();
        let channel = bus.channel("s-1");
        for _ in 0..5 {
            channel.publish(EventPayload::Heartbeat);
        }

        let mut stream = channel.subscribe(1).unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(stream.recv().await.unwrap().seq);
        }
        drop(stream);

        let mut resumed = channel.subscribe(seen.last().unwrap() + 1).unwrap();
        for _ in 0..2 {
            seen.push(resumed.recv().await.unwrap().seq);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_replay_unavailable_outside_window() {
        let bus = small_bus(4);
        let channel = bus.channel("s-1");
        // Fill beyond the window with non-evictable events.
        for i in 0..8u64 {
            channel.publish(EventPayload::TaskUpdate {
                task_id: format!("t-{}", i),
                status: crate::session::AgentState::Running,
                progress: 0.0,
            });
        }

        let err = channel.subscribe(1).unwrap_err();
        assert!(matches!(err, EngineError::ReplayUnavailable { .. }));

        // Within the window still works.
        let mut stream = channel.subscribe(5).unwrap();
        assert_eq!(stream.recv().await.unwrap().seq, 5);
    }

    #[tokio::test]
    async fn test_eviction_prefers_heartbeats_then_progress() {
        let bus = small_bus(3);
        let channel = bus.channel("s-1");
        channel.publish(EventPayload::Heartbeat); // seq 1
        channel.publish(EventPayload::TaskProgress {
            task_id: "t-1".into(),
            progress: 0.3,
        }); // seq 2
        channel.publish(EventPayload::TaskUpdate {
            task_id: "t-1".into(),
            status: crate::session::AgentState::Running,
            progress: 0.0,
        }); // seq 3
        // Overflow: the heartbeat goes first.
        channel.publish(EventPayload::Heartbeat); // seq 4
        // Overflow again: then the progress event.
        channel.publish(EventPayload::TaskUpdate {
            task_id: "t-1".into(),
            status: crate::session::AgentState::Succeeded,
            progress: 1.0,
        }); // seq 5

        let retained: Vec<u64> = channel.retained_after(0).iter().map(|e| e.seq).collect();
        assert_eq!(retained, vec![3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_due_after_silence() {
        let bus = bus();
        let channel = bus.channel("s-1");
        channel.publish(EventPayload::Heartbeat);
        assert!(!channel.heartbeat_due(std::time::Duration::from_secs(10)));
        tokio::time::advance(std::time::Duration::from_secs(11)).await;
        assert!(channel.heartbeat_due(std::time::Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_restore_continues_sequence() {
        let bus = bus();
        let events = vec![
            SessionEvent::new(1, EventPayload::Heartbeat),
            SessionEvent::new(2, EventPayload::Heartbeat),
        ];
        let channel = bus.restore("s-1", events);
        let event = channel.publish(EventPayload::Heartbeat).unwrap();
        assert_eq!(event.seq, 3);

        let mut stream = channel.subscribe(1).unwrap();
        assert_eq!(stream.recv().await.unwrap().seq, 1);
    }
}
