//! Central constants for recall configuration
//!
//! All string literals for paths, filenames, and configuration should be defined here
//! to avoid duplication and ensure consistency across the codebase.

use std::sync::atomic::AtomicBool;

/// Name of the per-user data directory (under the platform local-data dir)
pub const APP_DIR_NAME: &str = "recall";

/// Name of the configuration file inside the data directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Name of the embedded store file (WAL and SHM sidecars live next to it)
pub const DB_FILE_NAME: &str = "app.db";

/// Default screenshot output directory inside the data directory
pub const SCREENSHOT_DIR_NAME: &str = "Screenshots";

/// Cloud auth token cache inside the data directory
pub const TOKEN_FILE_NAME: &str = "token.json";

/// Cloud client secret inside the data directory
pub const CREDENTIALS_FILE_NAME: &str = "credentials.json";

/// Name of fastembed cache directory (inside the data directory)
pub const FASTEMBED_CACHE_DIR: &str = "fastembed_cache";

/// Lock file name to indicate an active writer instance
/// This prevents multiple processes from writing to the same database
pub const WRITER_LOCK_FILE: &str = ".writer.lock";

/// Log directory and file names inside the data directory
pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_FILE_NAME: &str = "recall.log";

/// Days to keep rotated log files before the cleanup task removes them
pub const DEFAULT_LOG_RETENTION_DAYS: i64 = 14;

/// Dispatcher blocks this long on an empty queue before re-checking timers
pub const QUEUE_POP_TIMEOUT_MS: u64 = 500;

/// How often the dispatcher runs the stuck-job timeout check
pub const WATCHDOG_INTERVAL_SECS: u64 = 5;

/// Per-path coalescing window for live filesystem events
pub const DEBOUNCE_INTERVAL_MS: u64 = 1000;

/// Mtime deltas below this are read-back noise, not edits (seconds)
pub const MTIME_NOISE_THRESHOLD: f64 = 0.1;

/// Initial scan re-processes a file only when its mtime moved by more than this (seconds)
pub const SCAN_MTIME_TOLERANCE: f64 = 1.0;

/// Reciprocal Rank Fusion constant
pub const RRF_K: f32 = 60.0;

/// Interval between store stats snapshots logged by the daemon (seconds)
pub const STATS_POLL_INTERVAL_SECS: u64 = 30;

/// Mean per-pixel difference (0-255) a frame must exceed to be persisted
pub const CAPTURE_DIFF_THRESHOLD: f64 = 2.0;

/// Screenshot retention pruning runs at most once per this many seconds
pub const CAPTURE_CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Set by the CTRL-C handler; checked to distinguish first/second press
pub static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Folders that are never walked or watched, regardless of configuration
pub const ALWAYS_IGNORED_FOLDERS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "node_modules",
    "__pycache__",
    ".cache",
    ".Trash",
    "$RECYCLE.BIN",
    "System Volume Information",
];
