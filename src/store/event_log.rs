//! Durable append-only event log, keyed `(session_id, seq)`.
//!
//! Writes go through a dedicated writer thread and are acknowledged only
//! after the transaction commits; reads use a small pool of read-only
//! connections behind `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use chrono::DateTime;
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::bus::{EventPayload, SessionEvent};
use crate::error::{Result, store_err, store_err_with};

const READ_POOL_SIZE: usize = 2;

enum WriteCommand {
    Append {
        session_id: String,
        event: Box<SessionEvent>,
        response: oneshot::Sender<Result<()>>,
    },
    Purge {
        session_id: String,
        response: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

struct EventWriter {
    tx: Sender<WriteCommand>,
    handle: Option<JoinHandle<()>>,
}

impl EventWriter {
    fn new(db_path: PathBuf) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WriteCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let handle = thread::Builder::new()
            .name("event-log-writer".into())
            .spawn(move || match Self::init_db(&db_path) {
                Ok(conn) => {
                    let _ = ready_tx.send(Ok(()));
                    Self::process_commands(&conn, rx);
                }
                Err(e) => {
                    error!(error = %e, "Event log writer init failed");
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| store_err_with("Failed to spawn writer thread", e))?;

        ready_rx
            .recv()
            .map_err(|_| store_err("Writer thread died during init"))??;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    fn init_db(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .map_err(|e| store_err_with("Failed to open event log", e))?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS session_events (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                ts TEXT NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_session_ts
                ON session_events(session_id, ts);
            ",
        )
        .map_err(|e| store_err_with("Failed to init event log schema", e))?;
        Ok(conn)
    }

    fn process_commands(conn: &Connection, rx: Receiver<WriteCommand>) {
        for cmd in rx {
            match cmd {
                WriteCommand::Append {
                    session_id,
                    event,
                    response,
                } => {
                    let result = Self::append_event(conn, &session_id, &event);
                    let _ = response.send(result);
                }
                WriteCommand::Purge {
                    session_id,
                    response,
                } => {
                    let result = conn
                        .execute(
                            "DELETE FROM session_events WHERE session_id = ?1",
                            params![&session_id],
                        )
                        .map(|_| ())
                        .map_err(|e| store_err_with("Failed to purge events", e));
                    let _ = response.send(result);
                }
                WriteCommand::Shutdown => {
                    debug!("Event log writer received shutdown");
                    break;
                }
            }
        }
    }

    fn append_event(conn: &Connection, session_id: &str, event: &SessionEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| store_err_with("Failed to serialize event payload", e))?;
        let kind = serde_json::to_string(&event.kind)
            .map_err(|e| store_err_with("Failed to serialize event kind", e))?;

        conn.execute(
            "INSERT OR REPLACE INTO session_events (session_id, seq, kind, ts, payload)
               VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                event.seq as i64,
                kind.trim_matches('"'),
                event.ts.to_rfc3339(),
                payload,
            ],
        )
        .map_err(|e| store_err_with("Failed to insert event", e))?;

        debug!(session_id, seq = event.seq, "Event appended");
        Ok(())
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        let _ = self.tx.send(WriteCommand::Shutdown);
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.join()
        {
            warn!("Event log writer panicked: {:?}", e);
        }
    }
}

struct ReadPool {
    connections: Vec<Mutex<Connection>>,
    next: std::sync::atomic::AtomicUsize,
}

impl ReadPool {
    fn new(db_path: &Path, size: usize) -> Result<Self> {
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(
                db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| store_err_with("Failed to open read connection", e))?;
            connections.push(Mutex::new(conn));
        }
        Ok(Self {
            connections,
            next: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    fn acquire(&self) -> parking_lot::MutexGuard<'_, Connection> {
        let idx =
            self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.connections.len();
        self.connections[idx].lock()
    }
}

struct EventLogInner {
    writer_tx: Sender<WriteCommand>,
    read_pool: ReadPool,
    /// Keeps the writer thread alive for the log's lifetime.
    #[allow(dead_code)]
    writer: EventWriter,
}

#[derive(Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

impl EventLog {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| store_err_with("Failed to create log directory", e))?;
        }

        let writer = EventWriter::new(db_path.clone())?;
        let writer_tx = writer.tx.clone();
        let read_pool = ReadPool::new(&db_path, READ_POOL_SIZE)?;

        Ok(Self {
            inner: Arc::new(EventLogInner {
                writer_tx,
                read_pool,
                writer,
            }),
        })
    }

    /// Appends durably; resolves only after the row is committed.
    pub async fn append(&self, session_id: &str, event: SessionEvent) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .writer_tx
            .send(WriteCommand::Append {
                session_id: session_id.to_string(),
                event: Box::new(event),
                response: tx,
            })
            .map_err(|_| store_err("Writer thread disconnected"))?;
        rx.await
            .map_err(|_| store_err("Writer response channel dropped"))?
    }

    pub async fn purge(&self, session_id: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .writer_tx
            .send(WriteCommand::Purge {
                session_id: session_id.to_string(),
                response: tx,
            })
            .map_err(|_| store_err("Writer thread disconnected"))?;
        rx.await
            .map_err(|_| store_err("Writer response channel dropped"))?
    }

    /// Events with `seq >= from_seq`, in sequence order.
    pub async fn events_after(&self, session_id: &str, from_seq: u64) -> Result<Vec<SessionEvent>> {
        let session_id = session_id.to_string();
        let inner = Arc::clone(&self.inner);

        tokio::task::spawn_blocking(move || {
            let guard = inner.read_pool.acquire();
            let mut stmt = guard
                .prepare_cached(
                    "SELECT seq, ts, payload FROM session_events
                       WHERE session_id = ?1 AND seq >= ?2
                       ORDER BY seq ASC",
                )
                .map_err(|e| store_err_with("Failed to prepare statement", e))?;

            let rows = stmt
                .query_map(params![&session_id, from_seq as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|e| store_err_with("Failed to query events", e))?;

            let mut events = Vec::new();
            for row in rows {
                let (seq, ts, payload) =
                    row.map_err(|e| store_err_with("Failed to read row", e))?;
                events.push(row_to_event(seq, &ts, &payload)?);
            }
            Ok(events)
        })
        .await
        .map_err(|e| store_err_with("Query task failed", e))?
    }

    /// The last `limit` events in sequence order, for bus window recovery.
    pub async fn tail(&self, session_id: &str, limit: usize) -> Result<Vec<SessionEvent>> {
        let session_id = session_id.to_string();
        let inner = Arc::clone(&self.inner);

        tokio::task::spawn_blocking(move || {
            let guard = inner.read_pool.acquire();
            let mut stmt = guard
                .prepare_cached(
                    "SELECT seq, ts, payload FROM session_events
                       WHERE session_id = ?1
                       ORDER BY seq DESC
                       LIMIT ?2",
                )
                .map_err(|e| store_err_with("Failed to prepare statement", e))?;

            let rows = stmt
                .query_map(params![&session_id, limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|e| store_err_with("Failed to query tail", e))?;

            let mut events = Vec::new();
            for row in rows {
                let (seq, ts, payload) =
                    row.map_err(|e| store_err_with("Failed to read row", e))?;
                events.push(row_to_event(seq, &ts, &payload)?);
            }
            events.reverse();
            Ok(events)
        })
        .await
        .map_err(|e| store_err_with("Query task failed", e))?
    }

    pub async fn max_seq(&self, session_id: &str) -> Result<u64> {
        let session_id = session_id.to_string();
        let inner = Arc::clone(&self.inner);

        tokio::task::spawn_blocking(move || {
            let guard = inner.read_pool.acquire();
            guard
                .query_row(
                    "SELECT MAX(seq) FROM session_events WHERE session_id = ?1",
                    params![&session_id],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .map(|opt| opt.unwrap_or(0) as u64)
                .map_err(|e| store_err_with("Failed to get max seq", e))
        })
        .await
        .map_err(|e| store_err_with("Query task failed", e))?
    }

    /// Timestamp of the most recent event, used by the staleness reaper.
    pub async fn last_event_ts(
        &self,
        session_id: &str,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let session_id = session_id.to_string();
        let inner = Arc::clone(&self.inner);

        tokio::task::spawn_blocking(move || {
            let guard = inner.read_pool.acquire();
            let ts: Option<String> = guard
                .query_row(
                    "SELECT ts FROM session_events WHERE session_id = ?1
                       ORDER BY seq DESC LIMIT 1",
                    params![&session_id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(store_err_with("Failed to get last event ts", other)),
                })?;

            match ts {
                Some(ts) => DateTime::parse_from_rfc3339(&ts)
                    .map(|dt| Some(dt.with_timezone(&chrono::Utc)))
                    .map_err(|e| store_err_with("Failed to parse timestamp", e)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| store_err_with("Query task failed", e))?
    }
}

fn row_to_event(seq: i64, ts: &str, payload: &str) -> Result<SessionEvent> {
    let payload: EventPayload = serde_json::from_str(payload)
        .map_err(|e| store_err_with("Failed to deserialize payload", e))?;
    let ts = DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| store_err_with("Failed to parse timestamp", e))?;
    Ok(SessionEvent {
        seq: seq as u64,
        ts,
        kind: payload.kind(),
        payload,
    })
}
