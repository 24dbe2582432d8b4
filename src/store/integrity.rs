//! Store healing and maintenance.
//!
//! Runs once at open, in a background thread: physical corruption check,
//! orphan purge (artifacts whose task row is gone), zombie reset (DONE
//! tasks whose artifact is gone), then reindex/vacuum/checkpoint.

use std::sync::Arc;
use std::thread;
use tracing::{error, info};

use super::Store;
use crate::error::Result;

/// What the sweep found and fixed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntegritySummary {
    pub integrity_ok: bool,
    pub orphans_removed: usize,
    pub zombies_reset: usize,
}

/// Artifact family ↔ task family pairs the logical checks iterate over.
/// Embeddings are split by sign of `chunk_index`: content chunks belong to
/// EMBED, summary rows to EMBED_LLM.
const ORPHAN_DELETES: &[&str] = &[
    "DELETE FROM ocr_results
     WHERE path NOT IN (SELECT path FROM tasks WHERE task_type='OCR')",
    "DELETE FROM embeddings
     WHERE chunk_index >= 0
     AND path NOT IN (SELECT path FROM tasks WHERE task_type='EMBED')",
    "DELETE FROM llm_analysis
     WHERE path NOT IN (SELECT path FROM tasks WHERE task_type='LLM')",
    "DELETE FROM embeddings
     WHERE chunk_index < 0
     AND path NOT IN (SELECT path FROM tasks WHERE task_type='EMBED_LLM')",
];

const ZOMBIE_RESETS: &[&str] = &[
    "UPDATE tasks SET status='PENDING'
     WHERE task_type='OCR' AND status='DONE'
     AND path NOT IN (SELECT path FROM ocr_results)",
    "UPDATE tasks SET status='PENDING'
     WHERE task_type='EMBED' AND status='DONE'
     AND path NOT IN (SELECT path FROM embeddings WHERE chunk_index >= 0)",
    "UPDATE tasks SET status='PENDING'
     WHERE task_type='LLM' AND status='DONE'
     AND path NOT IN (SELECT path FROM llm_analysis)",
    "UPDATE tasks SET status='PENDING'
     WHERE task_type='EMBED_LLM' AND status='DONE'
     AND path NOT IN (SELECT path FROM embeddings WHERE chunk_index < 0)",
];

/// Run the full sweep synchronously. The store lock is held for each phase,
/// not across the whole sweep, so normal work interleaves.
pub fn run_integrity_sweep(store: &Store) -> Result<IntegritySummary> {
    info!("Performing store integrity check...");
    let mut summary = IntegritySummary {
        integrity_ok: true,
        ..Default::default()
    };

    {
        let conn = store.lock();

        // Physical check: disk-level corruption, broken pages, bad indices
        conn.execute_batch("REINDEX;")?;
        let result: String = conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0))?;
        if result != "ok" {
            summary.integrity_ok = false;
            error!("CRITICAL: store corruption detected: {result}");
        }

        // Logical check: orphans (artifact rows with no matching task).
        // The delete-side triggers are live here, so the search_index rows
        // of purged artifacts go with them.
        for sql in ORPHAN_DELETES {
            summary.orphans_removed += conn.execute(sql, [])?;
        }

        // Logical check: zombies (DONE tasks whose artifact is missing)
        for sql in ZOMBIE_RESETS {
            summary.zombies_reset += conn.execute(sql, [])?;
        }
    }

    // Optimize after the deletions; checkpoint so the WAL sidecar shrinks
    {
        let conn = store.lock();
        if let Err(e) = conn.execute_batch("VACUUM;") {
            error!("Store optimization failed: {e}");
        }
        if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE);", [], |_| Ok(())) {
            error!("WAL checkpoint failed: {e}");
        }
    }

    info!(
        "Store integrity validation complete: ok={}, orphans_removed={}, zombies_reset={}",
        summary.integrity_ok, summary.orphans_removed, summary.zombies_reset
    );
    Ok(summary)
}

/// Run the sweep on a background thread (one-shot).
pub fn spawn_integrity_sweep(store: Arc<Store>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("integrity-sweep".to_string())
        .spawn(move || {
            if let Err(e) = run_integrity_sweep(&store) {
                error!("Integrity sweep failed: {e}");
            }
        })
        .expect("failed to spawn integrity sweep thread")
}
