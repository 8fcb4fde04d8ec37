//! Durable session persistence: atomic whole-record writes plus the
//! append-only event log.

mod event_log;

use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use tokio::fs;
use tracing::debug;

pub use event_log::EventLog;

use crate::bus::SessionEvent;
use crate::error::{EngineError, Result};
use crate::session::Session;

pub struct SessionStore {
    sessions_dir: PathBuf,
    log: EventLog,
}

impl SessionStore {
    pub fn new(root: &Path) -> Result<Self> {
        let sessions_dir = root.join("sessions");
        std::fs::create_dir_all(&sessions_dir)?;
        let log = EventLog::new(root.join("events.db"))?;
        Ok(Self { sessions_dir, log })
    }

    pub async fn init(&self) -> Result<()> {
        self.recover_interrupted_writes().await;
        Ok(())
    }

    /// Whole-record atomic write: temp file, fsync, rename.
    pub async fn save(&self, session: &Session) -> Result<()> {
        let path = self.session_path(&session.id);
        let content = serde_yaml_bw::to_string(session)?;
        self.write_atomic(&path, &content).await
    }

    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let tmp_path = path.with_extension("yaml.tmp");

        fs::write(&tmp_path, content).await?;

        let tmp_path_clone = tmp_path.clone();
        let sync_result = tokio::task::spawn_blocking(move || {
            std::fs::File::open(&tmp_path_clone).and_then(|file| file.sync_all())
        })
        .await;

        match sync_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to sync temp file to disk"),
            Err(e) => tracing::warn!(error = %e, "Failed to sync temp file to disk"),
        }

        fs::rename(&tmp_path, path).await?;

        debug!(path = %path.display(), "Atomic write completed");
        Ok(())
    }

    async fn recover_interrupted_writes(&self) {
        if let Ok(mut entries) = fs::read_dir(&self.sessions_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "Removing interrupted write");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
    }

    pub async fn load(&self, session_id: &str) -> Result<Session> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Err(EngineError::UnknownSession(session_id.to_string()));
        }
        let content = fs::read_to_string(&path).await?;
        let session: Session = serde_yaml_bw::from_str(&content)?;
        Ok(session)
    }

    pub async fn exists(&self, session_id: &str) -> bool {
        self.session_path(session_id).exists()
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();

        if !self.sessions_dir.exists() {
            return Ok(sessions);
        }

        let mut entries = fs::read_dir(&self.sessions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "yaml")
                && let Ok(content) = fs::read_to_string(&path).await
                && let Ok(session) = serde_yaml_bw::from_str::<Session>(&content)
            {
                sessions.push(session);
            }
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// Sessions in a non-terminal phase, for restart recovery.
    pub async fn list_active(&self) -> Result<Vec<Session>> {
        let sessions = self.list().await?;
        Ok(sessions.into_iter().filter(|s| !s.is_terminal()).collect())
    }

    /// Removes the record and its event log rows.
    pub async fn purge(&self, session_id: &str) -> Result<()> {
        let path = self.session_path(session_id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        self.log.purge(session_id).await?;
        debug!(session_id, "Session purged");
        Ok(())
    }

    /// Terminal sessions idle past the retention TTL.
    pub async fn expired(&self, retention_days: u64) -> Result<Vec<String>> {
        let cutoff = Utc::now() - Duration::days(retention_days as i64);
        let sessions = self.list().await?;
        Ok(sessions
            .into_iter()
            .filter(|s| s.is_terminal() && s.updated_at < cutoff)
            .map(|s| s.id)
            .collect())
    }

    // Event log delegation.

    pub async fn append_event(&self, session_id: &str, event: SessionEvent) -> Result<()> {
        self.log.append(session_id, event).await
    }

    pub async fn events_after(&self, session_id: &str, from_seq: u64) -> Result<Vec<SessionEvent>> {
        self.log.events_after(session_id, from_seq).await
    }

    pub async fn event_tail(&self, session_id: &str, limit: usize) -> Result<Vec<SessionEvent>> {
        self.log.tail(session_id, limit).await
    }

    pub async fn max_seq(&self, session_id: &str) -> Result<u64> {
        self.log.max_seq(session_id).await
    }

    pub async fn last_event_ts(
        &self,
        session_id: &str,
    ) -> Result<Option<chrono::DateTime<Utc>>> {
        self.log.last_event_ts(session_id).await
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.yaml", session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventPayload;
    use crate::session::{SessionMode, SessionPhase};
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let (_dir, store) = temp_store();
        let mut session = Session::new("s-1", "Build a todo app", SessionMode::Standard);
        session.revision = 4;
        session.last_seq = 17;
        store.save(&session).await.unwrap();

        let loaded = store.load("s-1").await.unwrap();
        assert_eq!(loaded.phase, SessionPhase::Clarifying);
        assert_eq!(loaded.revision, 4);
        assert_eq!(loaded.last_seq, 17);
    }

    #[tokio::test]
    async fn test_load_unknown_session() {
        let (_dir, store) = temp_store();
        let err = store.load("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_list_active_excludes_terminal() {
        let (_dir, store) = temp_store();
        let active = Session::new("s-1", "req", SessionMode::Quick);
        let mut done = Session::new("s-2", "req", SessionMode::Quick);
        done.phase = SessionPhase::Done;
        store.save(&active).await.unwrap();
        store.save(&done).await.unwrap();

        let result = store.list_active().await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "s-1");
    }

    #[tokio::test]
    async fn test_purge_removes_record_and_events() {
        let (_dir, store) = temp_store();
        let session = Session::new("s-1", "req", SessionMode::Quick);
        store.save(&session).await.unwrap();
        store
            .append_event("s-1", SessionEvent::new(1, EventPayload::Heartbeat))
            .await
            .unwrap();

        store.purge("s-1").await.unwrap();
        assert!(!store.exists("s-1").await);
        assert_eq!(store.max_seq("s-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_interrupted_write_recovery() {
        let (dir, store) = temp_store();
        let stray = dir.path().join("sessions").join("s-9.yaml.tmp");
        fs::write(&stray, "partial").await.unwrap();

        store.init().await.unwrap();
        assert!(!stray.exists());
    }

    #[tokio::test]
    async fn test_recovery_reproduces_seq_and_revision() {
        let dir = TempDir::new().unwrap();
        {
            let store = SessionStore::new(dir.path()).unwrap();
            let mut session = Session::new("s-1", "req", SessionMode::Standard);
            session.revision = 2;
            session.last_seq = 3;
            store.save(&session).await.unwrap();
            for seq in 1..=3u64 {
                store
                    .append_event("s-1", SessionEvent::new(seq, EventPayload::Heartbeat))
                    .await
                    .unwrap();
            }
        }

        // Fresh store over the same directory, as after a restart.
        let store = SessionStore::new(dir.path()).unwrap();
        let session = store.load("s-1").await.unwrap();
        assert_eq!(session.revision, 2);
        assert_eq!(session.last_seq, 3);
        assert_eq!(store.max_seq("s-1").await.unwrap(), 3);
    }
}
