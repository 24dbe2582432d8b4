//! Embedded relational + full-text storage.
//!
//! One SQLite file holds the task ledger, every derived artifact, and an
//! FTS5 index kept in sync by database-level triggers. The connection is
//! shared across threads behind a single mutex; every statement runs inside
//! that mutex, so callers get serialized, transactional writes without
//! holding long-lived references into store data.

mod integrity;

pub use integrity::{run_integrity_sweep, spawn_integrity_sweep, IntegritySummary};

use rusqlite::{params, Connection};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RecallError, Result};

/// SQLite caps bound parameters per statement; stay well under it.
const SQL_BATCH_CHUNK: usize = 500;

/// One unit of work for one file. Composite identity = (path, task_type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskType {
    Ocr,
    Embed,
    EmbedLlm,
    Llm,
    Delete,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Ocr => "OCR",
            TaskType::Embed => "EMBED",
            TaskType::EmbedLlm => "EMBED_LLM",
            TaskType::Llm => "LLM",
            TaskType::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OCR" => Some(TaskType::Ocr),
            "EMBED" => Some(TaskType::Embed),
            "EMBED_LLM" => Some(TaskType::EmbedLlm),
            "LLM" => Some(TaskType::Llm),
            "DELETE" => Some(TaskType::Delete),
            _ => None,
        }
    }

    /// Task families that appear in the stats snapshot (DELETE rows are
    /// transient and not interesting to operators).
    pub const STAT_FAMILIES: [TaskType; 4] =
        [TaskType::Ocr, TaskType::Embed, TaskType::EmbedLlm, TaskType::Llm];
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row destined for the `embeddings` table.
///
/// `chunk_index >= 0` is a content chunk; `chunk_index < 0` is the embedding
/// of the LLM-produced summary.
#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub path: String,
    pub chunk_index: i64,
    pub text_content: String,
    pub embedding: Vec<u8>,
    pub model_name: String,
}

/// An embedding row as fetched for semantic scoring.
#[derive(Debug, Clone)]
pub struct StoredVector {
    pub path: String,
    pub chunk_index: i64,
    pub text_content: String,
    pub embedding: Vec<u8>,
}

impl StoredVector {
    /// Search-index source tag this row contributes under.
    pub fn source(&self) -> &'static str {
        if self.chunk_index < 0 {
            "llm"
        } else {
            "embed"
        }
    }
}

/// One lexical hit from the FTS index. Lower `rank` is better (BM25).
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub path: String,
    pub content: String,
    pub source: String,
    pub rank: f64,
}

/// DONE/PENDING/FAILED counts for one task family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub done: u64,
    pub failed: u64,
}

/// Snapshot of the task ledger, per family, plus distinct tracked paths.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub per_type: BTreeMap<TaskType, StatusCounts>,
    pub total_files: u64,
}

const CREATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    path TEXT,
    task_type TEXT,
    status TEXT DEFAULT 'PENDING',
    file_mtime REAL,
    PRIMARY KEY(path, task_type)
);

CREATE INDEX IF NOT EXISTS idx_tasks_stats
ON tasks (task_type, status);

CREATE TABLE IF NOT EXISTS ocr_results (
    path TEXT PRIMARY KEY,
    text_content TEXT,
    model_name TEXT
);

CREATE TABLE IF NOT EXISTS embeddings (
    path TEXT,
    chunk_index INTEGER,
    text_content TEXT,
    embedding BLOB,
    model_name TEXT,
    PRIMARY KEY(path, chunk_index)
);

CREATE TABLE IF NOT EXISTS llm_analysis (
    path TEXT PRIMARY KEY,
    response TEXT,
    model_name TEXT
);

CREATE VIRTUAL TABLE IF NOT EXISTS search_index
USING fts5(path UNINDEXED, content, source UNINDEXED);
"#;

/// Insert-side triggers. The content column is always `path || ' ' || text`
/// so filename tokens contribute to lexical matches; the embeddings trigger
/// discriminates summary rows (`chunk_index < 0`) into source 'llm'.
const CREATE_INSERT_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS t_embed_insert AFTER INSERT ON embeddings
BEGIN
    INSERT INTO search_index (path, content, source)
    VALUES (
        new.path,
        new.path || ' ' || COALESCE(new.text_content, ''),
        CASE WHEN new.chunk_index < 0 THEN 'llm' ELSE 'embed' END
    );
END;

CREATE TRIGGER IF NOT EXISTS t_ocr_insert AFTER INSERT ON ocr_results
BEGIN
    INSERT INTO search_index (path, content, source)
    VALUES (new.path, new.path || ' ' || COALESCE(new.text_content, ''), 'ocr');
END;
"#;

/// Delete-side triggers. Bulk administrative operations drop these for
/// speed and must restore them even on error.
const CREATE_DELETE_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS t_embed_delete AFTER DELETE ON embeddings
BEGIN
    DELETE FROM search_index
    WHERE path = old.path
    AND source = CASE WHEN old.chunk_index < 0 THEN 'llm' ELSE 'embed' END;
END;

CREATE TRIGGER IF NOT EXISTS t_ocr_delete AFTER DELETE ON ocr_results
BEGIN
    DELETE FROM search_index WHERE path = old.path AND source = 'ocr';
END;
"#;

const DROP_DELETE_TRIGGERS: &str = r#"
DROP TRIGGER IF EXISTS t_embed_delete;
DROP TRIGGER IF EXISTS t_ocr_delete;
"#;

/// Thread-safe handle over the embedded store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at `db_path`, enable WAL, and install the
    /// schema and triggers.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RecallError::io(parent, format!("create data dir: {e}")))?;
        }
        let conn = Connection::open(db_path)?;

        // WAL lets reads proceed while a write is in flight
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "cache_size", -50_000)?;

        conn.execute_batch(CREATE_SCHEMA)?;
        conn.execute_batch(CREATE_INSERT_TRIGGERS)?;
        conn.execute_batch(CREATE_DELETE_TRIGGERS)?;

        debug!("Store opened at {:?}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_SCHEMA)?;
        conn.execute_batch(CREATE_INSERT_TRIGGERS)?;
        conn.execute_batch(CREATE_DELETE_TRIGGERS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-statement;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    // --- state management ---

    /// Insert or update a task row. Status is always overwritten; a zero
    /// mtime never clobbers a stored positive one.
    pub fn upsert_task(
        &self,
        path: &str,
        task_type: TaskType,
        status: TaskStatus,
        mtime: f64,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO tasks (path, task_type, status, file_mtime)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(path, task_type) DO UPDATE SET
                status = excluded.status,
                file_mtime = CASE WHEN excluded.file_mtime > 0
                                  THEN excluded.file_mtime
                                  ELSE tasks.file_mtime END
            "#,
            params![path, task_type.as_str(), status.as_str(), mtime],
        )?;
        Ok(())
    }

    /// Set status=DONE for the matched row; no-op if absent.
    pub fn mark_completed(&self, path: &str, task_type: TaskType) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE tasks SET status='DONE' WHERE path=?1 AND task_type=?2",
            params![path, task_type.as_str()],
        )?;
        Ok(())
    }

    /// Delete all traces of the given paths — tasks, artifacts, and their
    /// search-index rows — in one transaction.
    ///
    /// The delete-side triggers are dropped for the duration (the
    /// search_index rows are removed directly) and restored afterwards even
    /// when the deletes fail.
    pub fn remove_paths_bulk(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let conn = self.lock();
        conn.execute_batch(DROP_DELETE_TRIGGERS)?;

        let result = (|| -> Result<()> {
            let tx = conn.unchecked_transaction()?;
            for chunk in paths.chunks(SQL_BATCH_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(",");
                for table in ["ocr_results", "embeddings", "llm_analysis", "search_index", "tasks"]
                {
                    tx.execute(
                        &format!("DELETE FROM {table} WHERE path IN ({placeholders})"),
                        rusqlite::params_from_iter(chunk.iter()),
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })();

        let restore = conn.execute_batch(CREATE_DELETE_TRIGGERS);
        result?;
        restore?;
        debug!("Removed all rows for {} path(s)", paths.len());
        Ok(())
    }

    /// All PENDING tasks, used on startup to resume unfinished work.
    pub fn list_pending(&self) -> Result<Vec<(String, TaskType)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT path, task_type FROM tasks WHERE status='PENDING'")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut pending = Vec::new();
        for row in rows {
            let (path, type_str) = row?;
            match TaskType::parse(&type_str) {
                Some(task_type) => pending.push((path, task_type)),
                None => warn!("Ignoring task row with unknown type {type_str:?}"),
            }
        }
        Ok(pending)
    }

    /// `{path -> mtime}` across all task rows, for diffing against disk.
    pub fn list_file_states(&self) -> Result<HashMap<String, f64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT path, file_mtime FROM tasks")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1).unwrap_or(0.0)))
        })?;

        let mut states = HashMap::new();
        for row in rows {
            let (path, mtime) = row?;
            states.insert(path, mtime);
        }
        Ok(states)
    }

    // --- artifact persistence ---

    pub fn save_ocr(&self, path: &str, text: &str, model_name: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO ocr_results (path, text_content, model_name) VALUES (?1, ?2, ?3)",
            params![path, text, model_name],
        )?;
        Ok(())
    }

    pub fn save_llm(&self, path: &str, response: &str, model_name: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO llm_analysis (path, response, model_name) VALUES (?1, ?2, ?3)",
            params![path, response, model_name],
        )?;
        Ok(())
    }

    /// Save an embedding batch atomically.
    ///
    /// Existing rows for the referenced paths are wiped first, but only in
    /// the batch's sign class: a summary batch (`chunk_index < 0` anywhere)
    /// only clears old summary rows, a content batch only clears old content
    /// chunks. The insert-side trigger repopulates the search index.
    pub fn save_embeddings(&self, rows: &[EmbeddingRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let is_summary_update = rows.iter().any(|r| r.chunk_index < 0);
        let mut paths: Vec<&str> = rows.iter().map(|r| r.path.as_str()).collect();
        paths.sort_unstable();
        paths.dedup();

        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;

        let sign_clause = if is_summary_update {
            "chunk_index < 0"
        } else {
            "chunk_index >= 0"
        };
        for chunk in paths.chunks(SQL_BATCH_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            tx.execute(
                &format!("DELETE FROM embeddings WHERE {sign_clause} AND path IN ({placeholders})"),
                rusqlite::params_from_iter(chunk.iter()),
            )?;
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO embeddings (path, chunk_index, text_content, embedding, model_name)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.path,
                    row.chunk_index,
                    row.text_content,
                    row.embedding,
                    row.model_name
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // --- data retrieval ---

    pub fn get_llm(&self, path: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT response FROM llm_analysis WHERE path=?1")?;
        let mut rows = stmt.query(params![path])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Every embedding row produced by `model_name`. Vectors written by a
    /// different model are never mixed into a similarity computation.
    pub fn list_embeddings(&self, model_name: &str) -> Result<Vec<StoredVector>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT path, chunk_index, text_content, embedding FROM embeddings WHERE model_name=?1",
        )?;
        let rows = stmt.query_map(params![model_name], |row| {
            Ok(StoredVector {
                path: row.get(0)?,
                chunk_index: row.get(1)?,
                text_content: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                embedding: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// OCR text for the given paths, used to hydrate image previews.
    pub fn get_ocr_texts(&self, paths: &[String]) -> Result<HashMap<String, String>> {
        let mut texts = HashMap::new();
        if paths.is_empty() {
            return Ok(texts);
        }
        let conn = self.lock();
        for chunk in paths.chunks(SQL_BATCH_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT path, text_content FROM ocr_results WHERE path IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;
            for row in rows {
                let (path, text) = row?;
                if let Some(text) = text {
                    texts.insert(path, text);
                }
            }
        }
        Ok(texts)
    }

    /// Raw snapshot of the task ledger plus total tracked files.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock();
        let mut stats = StoreStats::default();
        for family in TaskType::STAT_FAMILIES {
            stats.per_type.insert(family, StatusCounts::default());
        }

        let mut stmt = conn.prepare(
            "SELECT task_type, status, COUNT(*) FROM tasks GROUP BY task_type, status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (type_str, status, count) = row?;
            let Some(task_type) = TaskType::parse(&type_str) else { continue };
            let Some(counts) = stats.per_type.get_mut(&task_type) else { continue };
            let count = count.max(0) as u64;
            match status.as_str() {
                "PENDING" => counts.pending = count,
                "DONE" => counts.done = count,
                "FAILED" => counts.failed = count,
                _ => {}
            }
        }

        let total: i64 =
            conn.query_row("SELECT COUNT(DISTINCT path) FROM tasks", [], |row| row.get(0))?;
        stats.total_files = total.max(0) as u64;
        Ok(stats)
    }

    // --- search ---

    /// Lexical search over the FTS index using BM25 ranking; results are
    /// returned already ordered, lower rank first. The expression is passed
    /// through to FTS5, so callers must quote raw user input
    /// (`utils::fts_match_expression`).
    pub fn search_lexical(&self, match_expression: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT path, content, source, bm25(search_index) AS rank
            FROM search_index
            WHERE search_index MATCH ?1
            ORDER BY rank
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![match_expression, limit as i64], |row| {
            Ok(LexicalHit {
                path: row.get(0)?,
                content: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                source: row.get(2)?,
                rank: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // --- administrative resets ---

    /// Reset every task that is not DONE back to PENDING so the orchestrator
    /// picks it up again.
    pub fn retry_all_failed(&self) -> Result<()> {
        let conn = self.lock();
        let changed =
            conn.execute("UPDATE tasks SET status='PENDING' WHERE status != 'DONE'", [])?;
        info!("Reset {changed} non-DONE tasks to PENDING");
        Ok(())
    }

    /// Destructive: delete all data for one service and reset its tasks to
    /// PENDING. `service_key` is `OCR`, `EMBED`, or `LLM`.
    ///
    /// Runs with the delete-side triggers dropped (search-index rows are
    /// removed directly); they are restored even on error.
    pub fn reset_service(&self, service_key: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(DROP_DELETE_TRIGGERS)?;

        let result = (|| -> Result<()> {
            let tx = conn.unchecked_transaction()?;
            match service_key {
                "OCR" => {
                    tx.execute("DELETE FROM search_index WHERE source = 'ocr'", [])?;
                    tx.execute("DELETE FROM ocr_results", [])?;
                    tx.execute("UPDATE tasks SET status='PENDING' WHERE task_type='OCR'", [])?;
                }
                "EMBED" => {
                    tx.execute("DELETE FROM search_index WHERE source = 'embed'", [])?;
                    tx.execute("DELETE FROM search_index WHERE source = 'llm'", [])?;
                    tx.execute("DELETE FROM embeddings", [])?;
                    tx.execute("UPDATE tasks SET status='PENDING' WHERE task_type='EMBED'", [])?;
                    tx.execute(
                        "UPDATE tasks SET status='PENDING' WHERE task_type='EMBED_LLM'",
                        [],
                    )?;
                }
                "LLM" => {
                    tx.execute("DELETE FROM llm_analysis", [])?;
                    tx.execute("UPDATE tasks SET status='PENDING' WHERE task_type='LLM'", [])?;
                    // EMBED_LLM rows will be remade by the LLM fan-out
                    tx.execute("DELETE FROM tasks WHERE task_type='EMBED_LLM'", [])?;
                    tx.execute("DELETE FROM search_index WHERE source = 'llm'", [])?;
                    tx.execute("DELETE FROM embeddings WHERE chunk_index < 0", [])?;
                }
                other => {
                    return Err(RecallError::store(format!(
                        "unknown service key {other:?} (expected OCR, EMBED, or LLM)"
                    )))
                }
            }
            tx.commit()?;
            Ok(())
        })();

        let restore = conn.execute_batch(CREATE_DELETE_TRIGGERS);
        result?;
        restore?;
        info!("Reset all data and tasks for service {service_key}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn search_index_rows(store: &Store) -> Vec<(String, String)> {
        let conn = store.lock();
        let mut stmt = conn
            .prepare("SELECT path, source FROM search_index ORDER BY path, source")
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    fn content_row(path: &str, index: i64, text: &str) -> EmbeddingRow {
        EmbeddingRow {
            path: path.to_string(),
            chunk_index: index,
            text_content: text.to_string(),
            embedding: vec![0u8; 8],
            model_name: "test-model".to_string(),
        }
    }

    #[test]
    fn test_upsert_and_list_pending() {
        let store = store();
        store
            .upsert_task("/a.md", TaskType::Embed, TaskStatus::Pending, 10.0)
            .unwrap();
        store
            .upsert_task("/a.md", TaskType::Llm, TaskStatus::Pending, 10.0)
            .unwrap();
        store
            .upsert_task("/b.png", TaskType::Ocr, TaskStatus::Done, 5.0)
            .unwrap();

        let mut pending = store.list_pending().unwrap();
        pending.sort();
        assert_eq!(
            pending,
            vec![
                ("/a.md".to_string(), TaskType::Embed),
                ("/a.md".to_string(), TaskType::Llm)
            ]
        );
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = store();
        store
            .upsert_task("/a.md", TaskType::Embed, TaskStatus::Pending, 10.0)
            .unwrap();
        store
            .upsert_task("/a.md", TaskType::Embed, TaskStatus::Pending, 10.0)
            .unwrap();
        assert_eq!(store.list_pending().unwrap().len(), 1);
        assert_eq!(store.stats().unwrap().total_files, 1);
    }

    #[test]
    fn test_zero_mtime_never_overwrites_positive() {
        let store = store();
        store
            .upsert_task("/a.md", TaskType::Embed, TaskStatus::Pending, 42.5)
            .unwrap();
        store
            .upsert_task("/a.md", TaskType::Embed, TaskStatus::Failed, 0.0)
            .unwrap();

        let states = store.list_file_states().unwrap();
        assert_eq!(states["/a.md"], 42.5);

        // A positive mtime still updates
        store
            .upsert_task("/a.md", TaskType::Embed, TaskStatus::Pending, 99.0)
            .unwrap();
        assert_eq!(store.list_file_states().unwrap()["/a.md"], 99.0);
    }

    #[test]
    fn test_mark_completed_missing_row_is_noop() {
        let store = store();
        store.mark_completed("/missing.md", TaskType::Embed).unwrap();
        assert_eq!(store.stats().unwrap().total_files, 0);
    }

    #[test]
    fn test_embedding_triggers_maintain_search_index() {
        let store = store();
        store
            .save_embeddings(&[
                content_row("/a.md", 0, "alpha beta"),
                content_row("/a.md", 1, "gamma"),
            ])
            .unwrap();

        assert_eq!(
            search_index_rows(&store),
            vec![
                ("/a.md".to_string(), "embed".to_string()),
                ("/a.md".to_string(), "embed".to_string())
            ]
        );

        // Re-saving the same sign class wipes and replaces, leaving exactly
        // one shadow row per live embedding row
        store
            .save_embeddings(&[content_row("/a.md", 0, "alpha beta rewritten")])
            .unwrap();
        assert_eq!(
            search_index_rows(&store),
            vec![("/a.md".to_string(), "embed".to_string())]
        );
    }

    #[test]
    fn test_summary_rows_use_llm_source_and_own_sign_class() {
        let store = store();
        store
            .save_embeddings(&[content_row("/a.md", 0, "content chunk")])
            .unwrap();
        store
            .save_embeddings(&[content_row("/a.md", -1, "summary text")])
            .unwrap();

        assert_eq!(
            search_index_rows(&store),
            vec![
                ("/a.md".to_string(), "embed".to_string()),
                ("/a.md".to_string(), "llm".to_string())
            ]
        );

        // A content re-save must not disturb the summary row
        store
            .save_embeddings(&[content_row("/a.md", 0, "new content")])
            .unwrap();
        assert_eq!(
            search_index_rows(&store),
            vec![
                ("/a.md".to_string(), "embed".to_string()),
                ("/a.md".to_string(), "llm".to_string())
            ]
        );
    }

    #[test]
    fn test_embedding_bytes_round_trip() {
        let store = store();
        let vector = crate::utils::vector_to_blob(&[0.1f32, -2.5, 3.75]);
        let mut row = content_row("/a.md", 0, "alpha");
        row.embedding = vector.clone();
        store.save_embeddings(&[row]).unwrap();

        let stored = store.list_embeddings("test-model").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].embedding, vector);
    }

    #[test]
    fn test_list_embeddings_filters_by_model() {
        let store = store();
        let mut other = content_row("/b.md", 0, "other");
        other.model_name = "different-model".to_string();
        store
            .save_embeddings(&[content_row("/a.md", 0, "mine")])
            .unwrap();
        store.save_embeddings(&[other]).unwrap();

        let mine = store.list_embeddings("test-model").unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].path, "/a.md");
    }

    #[test]
    fn test_ocr_trigger_and_lexical_search_includes_filename() {
        let store = store();
        store
            .save_ocr("/shots/receipt.png", "total 42 dollars", "test-ocr")
            .unwrap();

        // Content tokens match
        let hits = store.search_lexical("\"dollars\"", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, "ocr");

        // Filename tokens match too (content is path || ' ' || text)
        let hits = store.search_lexical("\"receipt\"", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "/shots/receipt.png");
    }

    #[test]
    fn test_search_lexical_orders_by_rank() {
        let store = store();
        store.save_ocr("/a.png", "cat", "m").unwrap();
        store
            .save_ocr("/b.png", "cat cat cat cat cat", "m")
            .unwrap();
        let hits = store.search_lexical("\"cat\"", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].rank <= hits[1].rank);
    }

    #[test]
    fn test_remove_paths_bulk_cascades_everywhere() {
        let store = store();
        store
            .upsert_task("/a.md", TaskType::Embed, TaskStatus::Done, 1.0)
            .unwrap();
        store
            .upsert_task("/a.md", TaskType::Llm, TaskStatus::Done, 1.0)
            .unwrap();
        store.save_embeddings(&[content_row("/a.md", 0, "text")]).unwrap();
        store.save_embeddings(&[content_row("/a.md", -1, "summary")]).unwrap();
        store.save_llm("/a.md", "analysis", "m").unwrap();
        store.save_ocr("/a.md", "ocr text", "m").unwrap();

        store.remove_paths_bulk(&["/a.md".to_string()]).unwrap();

        assert!(store.list_file_states().unwrap().is_empty());
        assert!(store.list_embeddings("test-model").unwrap().is_empty());
        assert!(store.get_llm("/a.md").unwrap().is_none());
        assert!(search_index_rows(&store).is_empty());
    }

    #[test]
    fn test_delete_triggers_restored_after_bulk_remove() {
        let store = store();
        store.remove_paths_bulk(&["/gone.md".to_string()]).unwrap();

        // If the delete trigger was not restored, this direct delete would
        // leave the shadow row behind
        store.save_ocr("/b.png", "words", "m").unwrap();
        {
            let conn = store.lock();
            conn.execute("DELETE FROM ocr_results WHERE path='/b.png'", [])
                .unwrap();
        }
        assert!(search_index_rows(&store).is_empty());
    }

    #[test]
    fn test_stats_counts() {
        let store = store();
        store
            .upsert_task("/a.md", TaskType::Embed, TaskStatus::Done, 1.0)
            .unwrap();
        store
            .upsert_task("/b.md", TaskType::Embed, TaskStatus::Pending, 1.0)
            .unwrap();
        store
            .upsert_task("/c.md", TaskType::Llm, TaskStatus::Failed, 1.0)
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.per_type[&TaskType::Embed].done, 1);
        assert_eq!(stats.per_type[&TaskType::Embed].pending, 1);
        assert_eq!(stats.per_type[&TaskType::Llm].failed, 1);
        assert_eq!(stats.per_type[&TaskType::Ocr], StatusCounts::default());
    }

    #[test]
    fn test_retry_all_failed() {
        let store = store();
        store
            .upsert_task("/a.md", TaskType::Llm, TaskStatus::Failed, 1.0)
            .unwrap();
        store
            .upsert_task("/b.md", TaskType::Llm, TaskStatus::Done, 1.0)
            .unwrap();

        store.retry_all_failed().unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.per_type[&TaskType::Llm].pending, 1);
        assert_eq!(stats.per_type[&TaskType::Llm].done, 1);
        assert_eq!(stats.per_type[&TaskType::Llm].failed, 0);
    }

    #[test]
    fn test_reset_service_embed() {
        let store = store();
        store
            .upsert_task("/a.md", TaskType::Embed, TaskStatus::Done, 1.0)
            .unwrap();
        store
            .upsert_task("/a.md", TaskType::EmbedLlm, TaskStatus::Done, 1.0)
            .unwrap();
        store.save_embeddings(&[content_row("/a.md", 0, "text")]).unwrap();
        store.save_embeddings(&[content_row("/a.md", -1, "summary")]).unwrap();

        store.reset_service("EMBED").unwrap();

        assert!(store.list_embeddings("test-model").unwrap().is_empty());
        assert!(search_index_rows(&store).is_empty());
        let stats = store.stats().unwrap();
        assert_eq!(stats.per_type[&TaskType::Embed].pending, 1);
        assert_eq!(stats.per_type[&TaskType::EmbedLlm].pending, 1);
    }

    #[test]
    fn test_reset_service_llm_drops_embed_llm_tasks() {
        let store = store();
        store
            .upsert_task("/a.md", TaskType::Llm, TaskStatus::Done, 1.0)
            .unwrap();
        store
            .upsert_task("/a.md", TaskType::EmbedLlm, TaskStatus::Done, 1.0)
            .unwrap();
        store.save_llm("/a.md", "analysis", "m").unwrap();
        store.save_embeddings(&[content_row("/a.md", 0, "content")]).unwrap();
        store.save_embeddings(&[content_row("/a.md", -1, "summary")]).unwrap();

        store.reset_service("LLM").unwrap();

        assert!(store.get_llm("/a.md").unwrap().is_none());
        // Content embeddings survive, summary embeddings do not
        let remaining = store.list_embeddings("test-model").unwrap();
        assert_eq!(remaining.len(), 1);
        let stats = store.stats().unwrap();
        assert_eq!(stats.per_type[&TaskType::Llm].pending, 1);
        assert_eq!(stats.per_type[&TaskType::EmbedLlm].pending, 0);
        assert_eq!(stats.per_type[&TaskType::EmbedLlm].done, 0);
    }

    #[test]
    fn test_reset_service_unknown_key_errors_and_restores_triggers() {
        let store = store();
        assert!(store.reset_service("BOGUS").is_err());

        // Triggers must still be live
        store.save_ocr("/a.png", "text", "m").unwrap();
        {
            let conn = store.lock();
            conn.execute("DELETE FROM ocr_results", []).unwrap();
        }
        assert!(search_index_rows(&store).is_empty());
    }

    #[test]
    fn test_get_ocr_texts() {
        let store = store();
        store.save_ocr("/a.png", "hello world", "m").unwrap();
        store.save_ocr("/b.png", "other", "m").unwrap();

        let texts = store
            .get_ocr_texts(&["/a.png".to_string(), "/missing.png".to_string()])
            .unwrap();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts["/a.png"], "hello world");
    }
}
