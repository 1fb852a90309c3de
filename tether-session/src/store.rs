//! SQLite-backed transcript persistence.
//!
//! Stores final transcript entries per conversation (replaced by entry id) and
//! the last resume id each conversation reported.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tether_api::{ConversationId, Role, TranscriptEntry};

use crate::sink::TranscriptSink;

/// Database version for migrations.
const SCHEMA_VERSION: i32 = 1;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// A conversation known to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConversation {
    pub id: ConversationId,
    pub resume_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub entry_count: usize,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {:?}", path))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let version = schema_version(&conn);
        if version == 0 {
            create_schema(&conn)?;
        } else if version > SCHEMA_VERSION {
            return Err(anyhow!(
                "transcript database has schema version {version}, newer than supported {SCHEMA_VERSION}"
            ));
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("transcript database lock poisoned"))
    }

    // =========================================================================
    // Entries
    // =========================================================================

    /// Insert `entry`, or replace the stored entry with the same id.
    pub fn save_entry(&self, conversation: &ConversationId, entry: &TranscriptEntry) -> Result<()> {
        let tool_input = entry
            .tool_input
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let tool_result = entry
            .tool_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let usage = entry.usage.as_ref().map(serde_json::to_string).transpose()?;

        let conn = self.conn()?;
        touch_conversation(&conn, conversation)?;
        conn.execute(
            "INSERT INTO entries (conversation, entry_id, role, content, timestamp, tool_name,
                                  tool_input_json, tool_result_json, is_error, usage_json, cost, thinking)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(conversation, entry_id) DO UPDATE SET
                role = excluded.role,
                content = excluded.content,
                timestamp = excluded.timestamp,
                tool_name = excluded.tool_name,
                tool_input_json = excluded.tool_input_json,
                tool_result_json = excluded.tool_result_json,
                is_error = excluded.is_error,
                usage_json = excluded.usage_json,
                cost = excluded.cost,
                thinking = excluded.thinking",
            params![
                conversation.as_str(),
                entry.id,
                entry.role.as_str(),
                entry.content,
                entry.timestamp.to_rfc3339(),
                entry.tool_name,
                tool_input,
                tool_result,
                entry.is_error,
                usage,
                entry.cost,
                entry.thinking,
            ],
        )
        .with_context(|| format!("Failed to save entry {} of {}", entry.id, conversation))?;
        Ok(())
    }

    /// Stored entries of a conversation, in the order they were first saved.
    pub fn load_transcript(&self, conversation: &ConversationId) -> Result<Vec<TranscriptEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT entry_id, role, content, timestamp, tool_name, tool_input_json,
                    tool_result_json, is_error, usage_json, cost, thinking
             FROM entries
             WHERE conversation = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt
            .query_map(params![conversation.as_str()], |row| {
                Ok(StoredRow {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    timestamp: row.get(3)?,
                    tool_name: row.get(4)?,
                    tool_input: row.get(5)?,
                    tool_result: row.get(6)?,
                    is_error: row.get(7)?,
                    usage: row.get(8)?,
                    cost: row.get(9)?,
                    thinking: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(StoredRow::into_entry).collect()
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    pub fn save_resume_id(&self, conversation: &ConversationId, resume_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO conversations (id, resume_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET resume_id = excluded.resume_id, updated_at = excluded.updated_at",
            params![conversation.as_str(), resume_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_resume_id(&self, conversation: &ConversationId) -> Result<Option<String>> {
        let conn = self.conn()?;
        let resume_id = conn
            .query_row(
                "SELECT resume_id FROM conversations WHERE id = ?1",
                params![conversation.as_str()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(resume_id.flatten())
    }

    /// All conversations, most recently updated first.
    pub fn list_conversations(&self) -> Result<Vec<StoredConversation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.resume_id, c.updated_at,
                    (SELECT COUNT(*) FROM entries e WHERE e.conversation = c.id)
             FROM conversations c
             ORDER BY c.updated_at DESC",
        )?;
        let conversations = stmt
            .query_map([], |row| {
                Ok(StoredConversation {
                    id: ConversationId(row.get(0)?),
                    resume_id: row.get(1)?,
                    updated_at: parse_datetime(row.get::<_, String>(2)?),
                    entry_count: row.get::<_, i64>(3)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conversations)
    }
}

impl TranscriptSink for SqliteStore {
    fn record_entry(&self, conversation: &ConversationId, entry: &TranscriptEntry) -> Result<()> {
        self.save_entry(conversation, entry)
    }

    fn record_resume_id(&self, conversation: &ConversationId, resume_id: &str) -> Result<()> {
        self.save_resume_id(conversation, resume_id)
    }
}

struct StoredRow {
    id: String,
    role: String,
    content: String,
    timestamp: String,
    tool_name: Option<String>,
    tool_input: Option<String>,
    tool_result: Option<String>,
    is_error: bool,
    usage: Option<String>,
    cost: Option<f64>,
    thinking: Option<String>,
}

impl StoredRow {
    fn into_entry(self) -> Result<TranscriptEntry> {
        let role = Role::parse(&self.role)
            .ok_or_else(|| anyhow!("unknown role {:?} for entry {}", self.role, self.id))?;
        Ok(TranscriptEntry {
            id: self.id,
            role,
            content: self.content,
            timestamp: parse_datetime(self.timestamp),
            tool_name: self.tool_name,
            tool_input: self
                .tool_input
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Corrupt tool input")?,
            tool_result: self
                .tool_result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Corrupt tool result")?,
            is_error: self.is_error,
            usage: self
                .usage
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Corrupt usage")?,
            cost: self.cost,
            thinking: self.thinking,
            is_partial: false,
        })
    }
}

fn schema_version(conn: &Connection) -> i32 {
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='meta'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);

    if !exists {
        return 0;
    }

    conn.query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| {
        let v: String = row.get(0)?;
        Ok(v.parse().unwrap_or(0))
    })
    .unwrap_or(0)
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            resume_id TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation TEXT NOT NULL,
            entry_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            tool_name TEXT,
            tool_input_json TEXT,
            tool_result_json TEXT,
            is_error INTEGER NOT NULL DEFAULT 0,
            usage_json TEXT,
            cost REAL,
            thinking TEXT,
            UNIQUE (conversation, entry_id)
        );

        CREATE INDEX IF NOT EXISTS idx_entries_conversation ON entries(conversation);

        INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');
        "#,
    )
    .context("Failed to create transcript schema")?;
    Ok(())
}

fn touch_conversation(conn: &Connection, conversation: &ConversationId) -> Result<()> {
    conn.execute(
        "INSERT INTO conversations (id, updated_at) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
        params![conversation.as_str(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Parse an RFC3339 datetime string.
fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
