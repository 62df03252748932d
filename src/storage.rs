//! SQLite persistence for history, reminders, and action/voice logs.
//!
//! All operations are synchronous and quick; the orchestrator calls them
//! outside its state lock. The connection is guarded by its own mutex so the
//! store can be shared behind an `Arc`.

use crate::error::{AssistantError, Result};
use crate::types::{JsonMap, utc_now_iso};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use serde::{Deserialize, Serialize};

/// One chat history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub session_id: String,
    pub user_text: String,
    pub assistant_text: String,
    pub mode: String,
    pub created_at: String,
}

/// One reminder row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: i64,
    pub note: String,
    pub due_at: String,
    pub is_done: bool,
    pub notified: bool,
    pub created_at: String,
}

/// Shared persistent store.
pub struct Storage {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Storage {
    /// Open (or create) the database at `path`, creating parent directories
    /// and the schema as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS history (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               session_id TEXT NOT NULL,
               user_text TEXT NOT NULL,
               assistant_text TEXT NOT NULL,
               mode TEXT NOT NULL,
               created_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS reminders (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               note TEXT NOT NULL,
               due_at TEXT NOT NULL,
               is_done INTEGER NOT NULL DEFAULT 0,
               notified INTEGER NOT NULL DEFAULT 0,
               created_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS voice_history (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               session_id TEXT NOT NULL,
               transcript TEXT NOT NULL,
               reply TEXT NOT NULL,
               mode TEXT NOT NULL,
               llm_backend TEXT NOT NULL,
               stt_backend TEXT NOT NULL,
               tts_backend TEXT NOT NULL,
               meta TEXT NOT NULL DEFAULT '{}',
               created_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS action_history (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               session_id TEXT NOT NULL,
               actor TEXT NOT NULL,
               tool TEXT NOT NULL,
               args TEXT NOT NULL DEFAULT '{}',
               success INTEGER NOT NULL,
               message TEXT NOT NULL,
               data TEXT NOT NULL DEFAULT '{}',
               created_at TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_owned(),
        })
    }

    /// Database file path this store was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AssistantError::Storage("connection lock poisoned".to_owned()))?;
        f(&conn).map_err(Into::into)
    }

    /// Append one chat exchange to history.
    pub fn save_history(
        &self,
        session_id: &str,
        user_text: &str,
        assistant_text: &str,
        mode: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO history(session_id, user_text, assistant_text, mode, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (session_id, user_text, assistant_text, mode, utc_now_iso()),
            )
            .map(|_| ())
        })
    }

    /// Most recent history rows for a session, newest first.
    pub fn list_recent_history(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, user_text, assistant_text, mode, created_at
                 FROM history WHERE session_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map((session_id, limit as i64), |row| {
                Ok(HistoryEntry {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    user_text: row.get(2)?,
                    assistant_text: row.get(3)?,
                    mode: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Insert a reminder; returns its id.
    pub fn add_reminder(&self, note: &str, due_at: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reminders(note, due_at, is_done, notified, created_at)
                 VALUES (?1, ?2, 0, 0, ?3)",
                (note, due_at, utc_now_iso()),
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// List reminders ordered by due time, optionally including completed ones.
    pub fn list_reminders(&self, include_done: bool) -> Result<Vec<Reminder>> {
        self.with_conn(|conn| {
            let sql = if include_done {
                "SELECT id, note, due_at, is_done, notified, created_at
                 FROM reminders ORDER BY due_at ASC"
            } else {
                "SELECT id, note, due_at, is_done, notified, created_at
                 FROM reminders WHERE is_done = 0 ORDER BY due_at ASC"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], row_to_reminder)?;
            rows.collect()
        })
    }

    /// Mark a reminder done. Returns `false` when the id does not exist.
    pub fn complete_reminder(&self, reminder_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE reminders SET is_done = 1 WHERE id = ?1",
                [reminder_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Reminders that are due at or before `before_iso`, not done, and not
    /// yet delivered. RFC 3339 strings compare lexically in due order.
    pub fn list_due_unnotified(&self, before_iso: &str) -> Result<Vec<Reminder>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, note, due_at, is_done, notified, created_at
                 FROM reminders
                 WHERE is_done = 0 AND notified = 0 AND due_at <= ?1
                 ORDER BY due_at ASC",
            )?;
            let rows = stmt.query_map([before_iso], row_to_reminder)?;
            rows.collect()
        })
    }

    /// Record that a due reminder was delivered, so it is never re-delivered.
    pub fn mark_reminder_notified(&self, reminder_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE reminders SET notified = 1 WHERE id = ?1",
                [reminder_id],
            )
            .map(|_| ())
        })
    }

    /// Append one ad-hoc tool execution record.
    pub fn save_action_history(
        &self,
        session_id: &str,
        actor: &str,
        tool: &str,
        args: &JsonMap,
        success: bool,
        message: &str,
        data: &JsonMap,
    ) -> Result<()> {
        let args_json = serde_json::Value::Object(args.clone()).to_string();
        let data_json = serde_json::Value::Object(data.clone()).to_string();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO action_history(session_id, actor, tool, args, success, message, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                (
                    session_id,
                    actor,
                    tool,
                    args_json,
                    success as i64,
                    message,
                    data_json,
                    utc_now_iso(),
                ),
            )
            .map(|_| ())
        })
    }

    /// Append one voice interaction record.
    #[allow(clippy::too_many_arguments)]
    pub fn save_voice_history(
        &self,
        session_id: &str,
        transcript: &str,
        reply: &str,
        mode: &str,
        llm_backend: &str,
        stt_backend: &str,
        tts_backend: &str,
        meta: &JsonMap,
    ) -> Result<()> {
        let meta_json = serde_json::Value::Object(meta.clone()).to_string();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO voice_history(session_id, transcript, reply, mode, llm_backend, stt_backend, tts_backend, meta, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                (
                    session_id,
                    transcript,
                    reply,
                    mode,
                    llm_backend,
                    stt_backend,
                    tts_backend,
                    meta_json,
                    utc_now_iso(),
                ),
            )
            .map(|_| ())
        })
    }
}

fn row_to_reminder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reminder> {
    Ok(Reminder {
        id: row.get(0)?,
        note: row.get(1)?,
        due_at: row.get(2)?,
        is_done: row.get::<_, i64>(3)? != 0,
        notified: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}
