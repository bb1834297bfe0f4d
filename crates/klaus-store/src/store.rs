// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

use crate::{estimate_cost, StoreError};

type Result<T> = std::result::Result<T, StoreError>;

/// Tool names whose input carries a file path; used by [`Store::get_file_changes`].
const FILE_CHANGE_TOOLS: &[&str] = &["write_file", "apply_patch", "delete_file", "git_checkpoint"];

/// At most this many of the newest messages are scanned by
/// [`Store::search_sessions`].  An unbounded content scan over the whole
/// message log would make search latency grow with total history.
const SEARCH_RECENT_MESSAGES: usize = 500;

const MAX_TAGS: usize = 10;
const MAX_TAG_LEN: usize = 50;
const MAX_SUMMARY_LEN: usize = 500;

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub workspace_dir: String,
    pub summary: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub pinned: bool,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub tool_name: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub tool_name: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewToolCall {
    pub session_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallStats {
    pub tool_name: String,
    pub calls: u64,
    pub successes: u64,
    pub avg_duration_ms: f64,
}

/// Aggregated token usage with the derived dollar estimate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeRecord {
    pub key: String,
    pub value: String,
    pub category: String,
    pub updated_at: DateTime<Utc>,
}

/// A workspace-mutating tool call, with the file path recovered from its
/// stored input.
#[derive(Debug, Clone, Serialize)]
pub struct FileChange {
    pub session_id: String,
    pub tool_name: String,
    pub file_path: Option<String>,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Single-writer embedded store.  All methods are `&self`; the connection
/// mutex serialises access.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-query; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                workspace_dir TEXT NOT NULL,
                summary TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_name TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tool_calls (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                tool_name TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT,
                success INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS token_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                model TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS knowledge (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'general',
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session_created
                ON messages(session_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_tool_calls_session ON tool_calls(session_id);
            CREATE INDEX IF NOT EXISTS idx_tool_calls_name ON tool_calls(tool_name);
            CREATE INDEX IF NOT EXISTS idx_token_usage_session ON token_usage(session_id);
            "#,
        )?;

        // Columns added after the first release.  ALTER TABLE has no
        // IF NOT EXISTS, so the duplicate-column error is the idempotency
        // signal on an already-migrated database.
        for alter in [
            "ALTER TABLE sessions ADD COLUMN pinned INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE sessions ADD COLUMN tags TEXT NOT NULL DEFAULT '[]'",
        ] {
            if let Err(e) = conn.execute(alter, []) {
                if !e.to_string().contains("duplicate column name") {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    pub fn create_session(&self, id: &str, workspace_dir: &str) -> Result<SessionRecord> {
        let now = now_ts();
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO sessions (id, workspace_dir, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![id, workspace_dir, now],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(id.to_string()));
        }
        debug!(session = %id, "session created");
        self.get_session(id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_dir, summary, input_tokens, output_tokens,
                    pinned, tags, created_at, updated_at
             FROM sessions WHERE id = ?1",
        )?;
        let session = stmt.query_row([id], row_to_session).optional()?;
        Ok(session)
    }

    /// Pinned sessions first, then most recently updated.
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_dir, summary, input_tokens, output_tokens,
                    pinned, tags, created_at, updated_at
             FROM sessions
             ORDER BY pinned DESC, updated_at DESC
             LIMIT ?1",
        )?;
        let sessions = stmt
            .query_map([limit as i64], row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Match against session summaries and against the content of the
    /// [`SEARCH_RECENT_MESSAGES`] newest messages across the store; union,
    /// deduplicated by session id, newest-updated first.
    pub fn search_sessions(&self, query: &str, limit: usize) -> Result<Vec<SessionRecord>> {
        let pattern = format!("%{}%", query);
        let conn = self.conn();

        let mut ids: Vec<String> = Vec::new();
        {
            let mut stmt =
                conn.prepare("SELECT id FROM sessions WHERE summary LIKE ?1")?;
            for id in stmt.query_map([&pattern], |r| r.get::<_, String>(0))? {
                ids.push(id?);
            }
        }
        {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT session_id FROM (
                     SELECT session_id, content FROM messages
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?1
                 ) WHERE content LIKE ?2",
            )?;
            for id in
                stmt.query_map(params![SEARCH_RECENT_MESSAGES as i64, pattern], |r| {
                    r.get::<_, String>(0)
                })?
            {
                ids.push(id?);
            }
        }

        ids.sort();
        ids.dedup();

        let mut sessions = Vec::with_capacity(ids.len());
        {
            let mut stmt = conn.prepare(
                "SELECT id, workspace_dir, summary, input_tokens, output_tokens,
                        pinned, tags, created_at, updated_at
                 FROM sessions WHERE id = ?1",
            )?;
            for id in &ids {
                if let Some(s) = stmt.query_row([id], row_to_session).optional()? {
                    sessions.push(s);
                }
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    /// Summaries are display strings; anything past 500 chars is cut.
    pub fn update_session_summary(&self, id: &str, summary: &str) -> Result<()> {
        let text = truncate_chars(summary, MAX_SUMMARY_LEN);
        let changed = self.conn().execute(
            "UPDATE sessions SET summary = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, text, now_ts()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn toggle_pin(&self, id: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE sessions SET pinned = 1 - pinned, updated_at = ?2 WHERE id = ?1",
            params![id, now_ts()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let session = self.get_session(id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(session.pinned)
    }

    /// Replace the tag set.  Tags are trimmed, deduplicated, length-bounded
    /// and capped; invalid entries are dropped silently.
    pub fn set_tags(&self, id: &str, tags: &[String]) -> Result<Vec<String>> {
        let clean = sanitize_tags(tags);
        let changed = self.conn().execute(
            "UPDATE sessions SET tags = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, serde_json::to_string(&clean)?, now_ts()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(clean)
    }

    pub fn add_tag(&self, id: &str, tag: &str) -> Result<Vec<String>> {
        let session = self.get_session(id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut tags = session.tags;
        tags.push(tag.to_string());
        self.set_tags(id, &tags)
    }

    pub fn remove_tag(&self, id: &str, tag: &str) -> Result<Vec<String>> {
        let session = self.get_session(id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let tags: Vec<String> = session.tags.into_iter().filter(|t| t != tag).collect();
        self.set_tags(id, &tags)
    }

    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let changed = self.conn().execute("DELETE FROM sessions WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    pub fn clear_sessions(&self) -> Result<usize> {
        Ok(self.conn().execute("DELETE FROM sessions", [])?)
    }

    /// Delete unpinned sessions idle for longer than `ttl`.  Pinned sessions
    /// are kept regardless of age; pinning expresses "do not reap".
    pub fn expire_idle_sessions(&self, ttl: Duration) -> Result<usize> {
        if ttl.is_zero() {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let count = self.conn().execute(
            "DELETE FROM sessions WHERE pinned = 0 AND updated_at < ?1",
            [format_ts(cutoff)],
        )?;
        if count > 0 {
            debug!(count, "expired idle sessions");
        }
        Ok(count)
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub fn add_message(&self, entry: NewMessage) -> Result<MessageRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        let metadata = entry.metadata.as_ref().map(serde_json::to_string).transpose()?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO messages (id, session_id, role, content, tool_name, metadata, created_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
             WHERE EXISTS (SELECT 1 FROM sessions WHERE id = ?2)",
            params![id, entry.session_id, entry.role, entry.content, entry.tool_name, metadata, now],
        )?;
        if inserted == 0 {
            return Err(StoreError::NotFound(entry.session_id));
        }
        tx.execute(
            "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
            params![entry.session_id, now],
        )?;
        tx.commit()?;
        Ok(MessageRecord {
            id,
            session_id: entry.session_id,
            role: entry.role,
            content: entry.content,
            tool_name: entry.tool_name,
            metadata: entry.metadata,
            created_at: parse_ts(&now),
        })
    }

    /// The first `limit` messages, oldest first.
    pub fn get_messages(&self, session_id: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, tool_name, metadata, created_at
             FROM messages WHERE session_id = ?1
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?2",
        )?;
        let messages = stmt
            .query_map(params![session_id, limit as i64], row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// The **last** `limit` messages, still returned oldest first.
    pub fn get_recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, tool_name, metadata, created_at FROM (
                 SELECT id, session_id, role, content, tool_name, metadata, created_at, rowid AS rid
                 FROM messages WHERE session_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2
             ) ORDER BY created_at ASC, rid ASC",
        )?;
        let messages = stmt
            .query_map(params![session_id, limit as i64], row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub fn count_messages(&self, session_id: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            [session_id],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    // ── Tool calls ────────────────────────────────────────────────────────────

    pub fn record_tool_call(&self, call: NewToolCall) -> Result<ToolCallRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        self.conn().execute(
            "INSERT INTO tool_calls
                 (id, session_id, tool_name, input, output, success, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                call.session_id,
                call.tool_name,
                serde_json::to_string(&call.input)?,
                call.output,
                call.success,
                call.duration_ms as i64,
                now
            ],
        )?;
        Ok(ToolCallRecord {
            id,
            session_id: call.session_id,
            tool_name: call.tool_name,
            input: call.input,
            output: call.output,
            success: call.success,
            duration_ms: call.duration_ms,
            created_at: parse_ts(&now),
        })
    }

    pub fn get_tool_call_stats(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<ToolCallStats>> {
        let conn = self.conn();
        let sql = "SELECT tool_name, COUNT(*), SUM(success), AVG(duration_ms)
                   FROM tool_calls
                   WHERE (?1 IS NULL OR session_id = ?1)
                   GROUP BY tool_name
                   ORDER BY tool_name";
        let mut stmt = conn.prepare(sql)?;
        let stats = stmt
            .query_map([session_id], |row| {
                Ok(ToolCallStats {
                    tool_name: row.get(0)?,
                    calls: row.get::<_, i64>(1)? as u64,
                    successes: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                    avg_duration_ms: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    /// Workspace-mutating tool calls in chronological order, with the file
    /// path dug out of the stored JSON input.
    pub fn get_file_changes(&self, session_id: Option<&str>) -> Result<Vec<FileChange>> {
        let conn = self.conn();
        let placeholders = FILE_CHANGE_TOOLS
            .iter()
            .map(|t| format!("'{t}'"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT session_id, tool_name, input, success, created_at
             FROM tool_calls
             WHERE tool_name IN ({placeholders})
               AND (?1 IS NULL OR session_id = ?1)
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let changes = stmt
            .query_map([session_id], |row| {
                let input: String = row.get(2)?;
                let ts: String = row.get(4)?;
                Ok(FileChange {
                    session_id: row.get(0)?,
                    tool_name: row.get(1)?,
                    file_path: extract_file_path(&input),
                    success: row.get(3)?,
                    created_at: parse_ts(&ts),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(changes)
    }

    // ── Token usage ───────────────────────────────────────────────────────────

    /// Append a ledger entry and bump the session's denormalised totals in
    /// the same transaction, so totals always equal the ledger sum at rest.
    pub fn record_token_usage(
        &self,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        model: &str,
    ) -> Result<()> {
        let now = now_ts();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO token_usage (session_id, input_tokens, output_tokens, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, input_tokens as i64, output_tokens as i64, model, now],
        )?;
        let changed = tx.execute(
            "UPDATE sessions
             SET input_tokens = input_tokens + ?2,
                 output_tokens = output_tokens + ?3,
                 updated_at = ?4
             WHERE id = ?1",
            params![session_id, input_tokens as i64, output_tokens as i64, now],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_session_token_usage(&self, session_id: &str) -> Result<TokenTotals> {
        self.sum_token_usage(Some(session_id))
    }

    pub fn get_total_token_usage(&self) -> Result<TokenTotals> {
        self.sum_token_usage(None)
    }

    fn sum_token_usage(&self, session_id: Option<&str>) -> Result<TokenTotals> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT model, SUM(input_tokens), SUM(output_tokens)
             FROM token_usage
             WHERE (?1 IS NULL OR session_id = ?1)
             GROUP BY model",
        )?;
        let mut totals = TokenTotals::default();
        let rows = stmt.query_map([session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? as u64,
                row.get::<_, i64>(2)? as u64,
            ))
        })?;
        for row in rows {
            let (model, input, output) = row?;
            totals.input_tokens += input;
            totals.output_tokens += output;
            totals.estimated_cost_usd += estimate_cost(&model, input, output);
        }
        totals.total_tokens = totals.input_tokens + totals.output_tokens;
        Ok(totals)
    }

    // ── Knowledge ─────────────────────────────────────────────────────────────

    pub fn set_knowledge(&self, key: &str, value: &str, category: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO knowledge (key, value, category, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET value = ?2, category = ?3, updated_at = ?4",
            params![key, value, category, now_ts()],
        )?;
        Ok(())
    }

    pub fn get_knowledge(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM knowledge WHERE key = ?1", [key], |r| r.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn list_knowledge(&self, category: Option<&str>) -> Result<Vec<KnowledgeRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT key, value, category, updated_at
             FROM knowledge
             WHERE (?1 IS NULL OR category = ?1)
             ORDER BY key",
        )?;
        let entries = stmt
            .query_map([category], |row| {
                let ts: String = row.get(3)?;
                Ok(KnowledgeRecord {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    category: row.get(2)?,
                    updated_at: parse_ts(&ts),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete_knowledge(&self, key: &str) -> Result<bool> {
        Ok(self.conn().execute("DELETE FROM knowledge WHERE key = ?1", [key])? > 0)
    }

    pub fn clear_knowledge(&self, category: Option<&str>) -> Result<usize> {
        Ok(self.conn().execute(
            "DELETE FROM knowledge WHERE (?1 IS NULL OR category = ?1)",
            [category],
        )?)
    }

    pub fn clear_all(&self) -> Result<usize> {
        let sessions = self.clear_sessions()?;
        let knowledge = self.clear_knowledge(None)?;
        Ok(sessions + knowledge)
    }

    #[cfg(test)]
    fn backdate_session(&self, id: &str, updated_at: DateTime<Utc>) {
        self.conn()
            .execute(
                "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
                params![id, format_ts(updated_at)],
            )
            .unwrap();
    }
}

// ── Row mapping and helpers ───────────────────────────────────────────────────

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let tags_json: String = row.get(6)?;
    let created: String = row.get(7)?;
    let updated: String = row.get(8)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        workspace_dir: row.get(1)?,
        summary: row.get(2)?,
        input_tokens: row.get::<_, i64>(3)? as u64,
        output_tokens: row.get::<_, i64>(4)? as u64,
        pinned: row.get(5)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let metadata: Option<String> = row.get(5)?;
    let ts: String = row.get(6)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        tool_name: row.get(4)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: parse_ts(&ts),
    })
}

/// RFC 3339 with microseconds: fixed width, so lexicographic string order
/// equals chronological order inside SQLite.
fn now_ts() -> String {
    format_ts(Utc::now())
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn sanitize_tags(tags: &[String]) -> Vec<String> {
    let mut clean: Vec<String> = Vec::new();
    for tag in tags {
        let t = tag.trim();
        if t.is_empty() || t.chars().count() > MAX_TAG_LEN {
            continue;
        }
        if clean.iter().any(|existing| existing == t) {
            continue;
        }
        clean.push(t.to_string());
        if clean.len() == MAX_TAGS {
            break;
        }
    }
    clean
}

fn extract_file_path(input_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(input_json).ok()?;
    for key in ["path", "file_path"] {
        if let Some(p) = value.get(key).and_then(|v| v.as_str()) {
            return Some(p.to_string());
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn msg(session: &str, role: &str, content: &str) -> NewMessage {
        NewMessage {
            session_id: session.into(),
            role: role.into(),
            content: content.into(),
            tool_name: None,
            metadata: None,
        }
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    #[test]
    fn create_and_get_session() {
        let s = store();
        let created = s.create_session("s1", "/tmp/ws").unwrap();
        assert_eq!(created.id, "s1");
        assert_eq!(created.workspace_dir, "/tmp/ws");
        assert!(!created.pinned);
        assert!(s.get_session("s1").unwrap().is_some());
    }

    #[test]
    fn duplicate_session_id_is_a_conflict() {
        let s = store();
        s.create_session("s1", "/tmp/ws").unwrap();
        assert!(matches!(
            s.create_session("s1", "/tmp/other"),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn get_unknown_session_is_none() {
        assert!(store().get_session("nope").unwrap().is_none());
    }

    #[test]
    fn list_orders_pinned_first_then_recency() {
        let s = store();
        s.create_session("old", "/ws").unwrap();
        s.create_session("newer", "/ws").unwrap();
        s.create_session("pinned", "/ws").unwrap();
        s.backdate_session("old", Utc::now() - chrono::Duration::hours(2));
        s.backdate_session("pinned", Utc::now() - chrono::Duration::hours(3));
        s.toggle_pin("pinned").unwrap();

        let ids: Vec<String> =
            s.list_sessions(10).unwrap().into_iter().map(|x| x.id).collect();
        assert_eq!(ids[0], "pinned");
        assert_eq!(ids[1], "newer");
        assert_eq!(ids[2], "old");
    }

    #[test]
    fn toggle_pin_flips_both_ways() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        assert!(s.toggle_pin("s1").unwrap());
        assert!(!s.toggle_pin("s1").unwrap());
    }

    #[test]
    fn summary_is_truncated_to_500_chars() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        s.update_session_summary("s1", &"x".repeat(900)).unwrap();
        let summary = s.get_session("s1").unwrap().unwrap().summary.unwrap();
        assert_eq!(summary.chars().count(), 500);
    }

    #[test]
    fn update_summary_on_missing_session_is_not_found() {
        assert!(matches!(
            store().update_session_summary("ghost", "x"),
            Err(StoreError::NotFound(_))
        ));
    }

    // ── Tags ──────────────────────────────────────────────────────────────────

    #[test]
    fn tags_are_deduplicated_and_bounded() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        let raw: Vec<String> = (0..15)
            .map(|i| format!("tag{}", i % 12)) // dupes past 12
            .chain(["".to_string(), "y".repeat(60)])
            .collect();
        let tags = s.set_tags("s1", &raw).unwrap();
        assert_eq!(tags.len(), 10);
        assert!(tags.iter().all(|t| t.chars().count() <= 50 && !t.is_empty()));
    }

    #[test]
    fn add_and_remove_tag() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        s.add_tag("s1", "rust").unwrap();
        let tags = s.add_tag("s1", "agent").unwrap();
        assert_eq!(tags, vec!["rust", "agent"]);
        let tags = s.remove_tag("s1", "rust").unwrap();
        assert_eq!(tags, vec!["agent"]);
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    #[test]
    fn add_message_requires_existing_session() {
        let s = store();
        assert!(matches!(
            s.add_message(msg("ghost", "user", "hi")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn messages_are_ordered_and_counted() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        for i in 0..5 {
            s.add_message(msg("s1", "user", &format!("m{i}"))).unwrap();
        }
        assert_eq!(s.count_messages("s1").unwrap(), 5);
        let first = s.get_messages("s1", 3).unwrap();
        assert_eq!(
            first.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m0", "m1", "m2"]
        );
    }

    #[test]
    fn recent_messages_returns_last_n_oldest_first() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        for i in 0..5 {
            s.add_message(msg("s1", "user", &format!("m{i}"))).unwrap();
        }
        let recent = s.get_recent_messages("s1", 2).unwrap();
        assert_eq!(
            recent.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m3", "m4"]
        );
    }

    #[test]
    fn message_metadata_round_trips() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        let mut m = msg("s1", "tool", "done");
        m.tool_name = Some("read_file".into());
        m.metadata = Some(serde_json::json!({"duration_ms": 12}));
        s.add_message(m).unwrap();
        let stored = &s.get_messages("s1", 10).unwrap()[0];
        assert_eq!(stored.tool_name.as_deref(), Some("read_file"));
        assert_eq!(stored.metadata.as_ref().unwrap()["duration_ms"], 12);
    }

    #[test]
    fn add_message_touches_session_updated_at() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        s.backdate_session("s1", Utc::now() - chrono::Duration::hours(1));
        let before = s.get_session("s1").unwrap().unwrap().updated_at;
        s.add_message(msg("s1", "user", "hi")).unwrap();
        let after = s.get_session("s1").unwrap().unwrap().updated_at;
        assert!(after > before);
    }

    // ── Cascade delete ────────────────────────────────────────────────────────

    #[test]
    fn deleting_a_session_cascades() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        s.add_message(msg("s1", "user", "hi")).unwrap();
        s.record_tool_call(NewToolCall {
            session_id: "s1".into(),
            tool_name: "read_file".into(),
            input: serde_json::json!({"path": "a.rs"}),
            output: Some("ok".into()),
            success: true,
            duration_ms: 3,
        })
        .unwrap();
        s.record_token_usage("s1", 100, 50, "claude-haiku-4-5").unwrap();

        assert!(s.delete_session("s1").unwrap());
        assert_eq!(s.count_messages("s1").unwrap(), 0);
        assert!(s.get_tool_call_stats(Some("s1")).unwrap().is_empty());
        assert_eq!(s.get_session_token_usage("s1").unwrap().total_tokens, 0);
    }

    // ── Token usage ───────────────────────────────────────────────────────────

    #[test]
    fn totals_match_ledger_sum() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        s.record_token_usage("s1", 1000, 500, "claude-sonnet-4-5").unwrap();
        s.record_token_usage("s1", 2000, 1000, "claude-sonnet-4-5").unwrap();

        let usage = s.get_session_token_usage("s1").unwrap();
        assert_eq!(usage.input_tokens, 3000);
        assert_eq!(usage.output_tokens, 1500);
        assert_eq!(usage.total_tokens, 4500);

        let session = s.get_session("s1").unwrap().unwrap();
        assert_eq!(session.input_tokens, usage.input_tokens);
        assert_eq!(session.output_tokens, usage.output_tokens);
    }

    #[test]
    fn cost_is_summed_per_model_row() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        s.record_token_usage("s1", 1_000_000, 0, "claude-haiku-4-5").unwrap();
        s.record_token_usage("s1", 1_000_000, 0, "claude-opus-4-5").unwrap();
        let usage = s.get_total_token_usage().unwrap();
        // 0.80 (haiku) + 15.0 (opus)
        assert!((usage.estimated_cost_usd - 15.8).abs() < 1e-9);
    }

    #[test]
    fn usage_for_unknown_session_is_zero() {
        let usage = store().get_session_token_usage("ghost").unwrap();
        assert_eq!(usage.total_tokens, 0);
        assert_eq!(usage.estimated_cost_usd, 0.0);
    }

    // ── Tool calls ────────────────────────────────────────────────────────────

    #[test]
    fn tool_call_stats_aggregate() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        for success in [true, true, false] {
            s.record_tool_call(NewToolCall {
                session_id: "s1".into(),
                tool_name: "run_command".into(),
                input: serde_json::json!({"command": "ls"}),
                output: Some("files".into()),
                success,
                duration_ms: 10,
            })
            .unwrap();
        }
        let stats = s.get_tool_call_stats(Some("s1")).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].calls, 3);
        assert_eq!(stats[0].successes, 2);
        assert!((stats[0].avg_duration_ms - 10.0).abs() < 1e-9);
    }

    #[test]
    fn file_changes_extract_paths_chronologically() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        for (tool, input) in [
            ("write_file", serde_json::json!({"path": "src/a.rs", "content": "x"})),
            ("read_file", serde_json::json!({"path": "src/b.rs"})),
            ("git_checkpoint", serde_json::json!({"message": "wip"})),
            ("delete_file", serde_json::json!({"path": "src/c.rs"})),
        ] {
            s.record_tool_call(NewToolCall {
                session_id: "s1".into(),
                tool_name: tool.into(),
                input,
                output: None,
                success: true,
                duration_ms: 1,
            })
            .unwrap();
        }
        let changes = s.get_file_changes(Some("s1")).unwrap();
        // read_file is not a file change
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].file_path.as_deref(), Some("src/a.rs"));
        assert_eq!(changes[1].file_path, None); // checkpoint has no path
        assert_eq!(changes[2].file_path.as_deref(), Some("src/c.rs"));
    }

    // ── Search ────────────────────────────────────────────────────────────────

    #[test]
    fn search_matches_summary_and_content_deduplicated() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        s.create_session("s2", "/ws").unwrap();
        s.update_session_summary("s1", "refactor the tokenizer").unwrap();
        s.add_message(msg("s1", "user", "please refactor this")).unwrap();
        s.add_message(msg("s2", "user", "unrelated chatter")).unwrap();

        let hits = s.search_sessions("refactor", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "s1");
    }

    #[test]
    fn search_respects_limit_and_recency_order() {
        let s = store();
        for i in 0..3 {
            let id = format!("s{i}");
            s.create_session(&id, "/ws").unwrap();
            s.add_message(msg(&id, "user", "needle in here")).unwrap();
        }
        let hits = s.search_sessions("needle", 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].updated_at >= hits[1].updated_at);
    }

    // ── Knowledge ─────────────────────────────────────────────────────────────

    #[test]
    fn knowledge_upserts() {
        let s = store();
        s.set_knowledge("style", "tabs", "general").unwrap();
        s.set_knowledge("style", "spaces", "general").unwrap();
        assert_eq!(s.get_knowledge("style").unwrap().as_deref(), Some("spaces"));
    }

    #[test]
    fn knowledge_lists_by_category() {
        let s = store();
        s.set_knowledge("a", "1", "general").unwrap();
        s.set_knowledge("b", "2", "context").unwrap();
        assert_eq!(s.list_knowledge(Some("context")).unwrap().len(), 1);
        assert_eq!(s.list_knowledge(None).unwrap().len(), 2);
    }

    #[test]
    fn clear_knowledge_by_category_returns_count() {
        let s = store();
        s.set_knowledge("a", "1", "general").unwrap();
        s.set_knowledge("b", "2", "context").unwrap();
        assert_eq!(s.clear_knowledge(Some("context")).unwrap(), 1);
        assert_eq!(s.list_knowledge(None).unwrap().len(), 1);
    }

    #[test]
    fn delete_knowledge_reports_presence() {
        let s = store();
        s.set_knowledge("k", "v", "general").unwrap();
        assert!(s.delete_knowledge("k").unwrap());
        assert!(!s.delete_knowledge("k").unwrap());
    }

    // ── Expiry ────────────────────────────────────────────────────────────────

    #[test]
    fn expire_reaps_idle_but_spares_pinned() {
        let s = store();
        s.create_session("idle", "/ws").unwrap();
        s.create_session("pinned", "/ws").unwrap();
        s.create_session("fresh", "/ws").unwrap();
        s.toggle_pin("pinned").unwrap();
        let old = Utc::now() - chrono::Duration::hours(48);
        s.backdate_session("idle", old);
        s.backdate_session("pinned", old);

        let reaped = s.expire_idle_sessions(Duration::from_secs(3600)).unwrap();
        assert_eq!(reaped, 1);
        assert!(s.get_session("idle").unwrap().is_none());
        assert!(s.get_session("pinned").unwrap().is_some());
        assert!(s.get_session("fresh").unwrap().is_some());
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let s = store();
        s.create_session("s1", "/ws").unwrap();
        s.backdate_session("s1", Utc::now() - chrono::Duration::days(30));
        assert_eq!(s.expire_idle_sessions(Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn reopening_a_database_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("klaus.db");
        {
            let s = Store::open(&path).unwrap();
            s.create_session("s1", "/ws").unwrap();
            s.toggle_pin("s1").unwrap();
        }
        let s = Store::open(&path).unwrap();
        let session = s.get_session("s1").unwrap().unwrap();
        assert!(session.pinned);
    }
}
