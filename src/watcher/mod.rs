//! File-watcher / reconciler.
//!
//! Startup runs one blocking reconciliation scan that diffs the filesystem
//! against the store: new and modified files get the full "shotgun" of
//! tasks (a changed file invalidates every derived artifact), paths that
//! exist only in the store become DELETE work. After that, live
//! notifications keep the two in sync — create/modify events are debounced
//! per path with a 1 s coalescing window, deletes go through immediately.

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::{Config, FileKind};
use crate::constants::{
    ALWAYS_IGNORED_FOLDERS, DEBOUNCE_INTERVAL_MS, MTIME_NOISE_THRESHOLD, SCAN_MTIME_TOLERANCE,
};
use crate::orchestrator::{Orchestrator, PRIORITY_NORMAL, PRIORITY_URGENT};
use crate::store::{Store, TaskType};
use crate::utils::{file_mtime, normalize_path};

/// Watches the configured roots and feeds the orchestrator.
pub struct FileWatcherService {
    orchestrator: Arc<Orchestrator>,
    store: Arc<Store>,
    config: Arc<Config>,
    /// Last known mtime per path; used to suppress read-back events where
    /// the platform bumps mtime on access
    known_mtimes: Mutex<HashMap<String, f64>>,
    /// Cancelable debounce timers keyed by path
    timers: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    /// Back-reference for handing clones to the event thread and timers
    weak: Weak<FileWatcherService>,
}

impl FileWatcherService {
    pub fn new(orchestrator: Arc<Orchestrator>, store: Arc<Store>, config: Arc<Config>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            orchestrator,
            store,
            config,
            known_mtimes: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("watcher is alive")
    }

    /// Watched roots that actually exist; the rest are logged and skipped.
    fn valid_roots(&self) -> Vec<PathBuf> {
        let mut roots = Vec::new();
        for root in self.config.sync_roots() {
            if root.exists() {
                roots.push(root);
            } else {
                error!("Sync directory not found: {:?}", root);
            }
        }
        roots
    }

    /// Run the initial reconciliation, then subscribe to live events.
    /// Must be called from within a tokio runtime (debounce timers are
    /// runtime tasks).
    pub fn start(&self) -> crate::error::Result<()> {
        let roots = self.valid_roots();
        if roots.is_empty() {
            error!("No valid sync directories found, watcher not starting");
            return Ok(());
        }

        info!("Performing initial sync scan...");
        self.initial_scan(&roots);

        let runtime = tokio::runtime::Handle::current();
        let (tx, rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |result| {
            let _ = tx.send(result);
        })
        .map_err(|e| crate::error::RecallError::backend(format!("watcher init failed: {e}")))?;

        for root in &roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| {
                    crate::error::RecallError::io(root, format!("watch failed: {e}"))
                })?;
            info!("Watcher monitoring {:?}", root);
        }
        *self.watcher.lock().unwrap_or_else(|p| p.into_inner()) = Some(watcher);

        // The event thread ends when the watcher is dropped and the channel
        // disconnects
        let service = self.arc();
        std::thread::Builder::new()
            .name("watcher-events".to_string())
            .spawn(move || {
                while let Ok(result) = rx.recv() {
                    match result {
                        Ok(event) => service.handle_event(&runtime, event),
                        Err(e) => warn!("File watch error: {e:?}"),
                    }
                }
                debug!("Watcher event thread exited");
            })
            .expect("failed to spawn watcher event thread");

        Ok(())
    }

    pub fn stop(&self) {
        self.watcher.lock().unwrap_or_else(|p| p.into_inner()).take();
        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        for (_, timer) in timers.drain() {
            timer.abort();
        }
        info!("Watcher stopped");
    }

    // --- filters ---

    fn is_ignored_dir_name(&self, name: &str) -> bool {
        if ALWAYS_IGNORED_FOLDERS.contains(&name) {
            return true;
        }
        if self.config.skip_hidden_folders && name.starts_with('.') {
            return true;
        }
        self.config.ignored_folders.iter().any(|f| f == name)
    }

    fn is_in_ignored_dir(&self, path: &Path) -> bool {
        path.components().any(|component| {
            component
                .as_os_str()
                .to_str()
                .map(|name| self.is_ignored_dir_name(name))
                .unwrap_or(false)
        })
    }

    /// A file worth tracking: not a directory, not hidden or an Office lock
    /// file, and carrying a configured text or image extension.
    pub(crate) fn is_valid_file(&self, path: &Path) -> bool {
        if path.is_dir() {
            return false;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.starts_with('.') || name.starts_with("~$") {
                return false;
            }
        }
        self.config.file_kind(path).is_some()
    }

    // --- initial reconciliation ---

    /// Diff the filesystem against the store and emit work. Blocking.
    pub fn initial_scan(&self, roots: &[PathBuf]) {
        let state = match self.store.list_file_states() {
            Ok(state) => state,
            Err(e) => {
                error!("Could not load file states for reconciliation: {e}");
                return;
            }
        };

        let mut disk_files: HashSet<String> = HashSet::new();

        for root in roots {
            for path in self.walk_root(root) {
                let normalized = normalize_path(&path);
                let mtime = match file_mtime(&path) {
                    Ok(mtime) => mtime,
                    Err(e) => {
                        warn!("Could not stat {normalized}: {e}");
                        continue;
                    }
                };

                disk_files.insert(normalized.clone());
                self.known_mtimes
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(normalized.clone(), mtime);

                match state.get(&normalized) {
                    None => {
                        info!("[Sync] Found new: {normalized}");
                        self.submit_shotgun(&normalized, mtime, PRIORITY_NORMAL);
                    }
                    Some(stored) if (mtime - stored).abs() > SCAN_MTIME_TOLERANCE => {
                        info!("[Sync] Found modified: {normalized}");
                        self.submit_shotgun(&normalized, mtime, PRIORITY_NORMAL);
                    }
                    Some(_) => {}
                }
            }
        }

        // Ghost cleanup: anything the store remembers that disk no longer
        // has (including files whose extension was removed from the config)
        for ghost in state.keys().filter(|path| !disk_files.contains(*path)) {
            info!("[Sync] Deleting ghost: {ghost}");
            self.orchestrator
                .submit_task(TaskType::Delete, ghost, PRIORITY_URGENT, 0.0);
        }
    }

    /// Recursively list valid files under a root, applying the ignored- and
    /// hidden-folder filters uniformly.
    fn walk_root(&self, root: &Path) -> Vec<PathBuf> {
        WalkDir::new(root)
            .into_iter()
            .filter_entry(|entry| {
                if !entry.file_type().is_dir() {
                    return true;
                }
                // The root itself is never filtered, even when hidden
                if entry.depth() == 0 {
                    return true;
                }
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !self.is_ignored_dir_name(name))
                    .unwrap_or(true)
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| self.is_valid_file(path))
            .collect()
    }

    /// Queue every applicable task for a file: EMBED and LLM always, OCR
    /// for images. A modified file invalidates every derived artifact.
    fn submit_shotgun(&self, path: &str, mtime: f64, priority: u8) {
        let Some(kind) = self.config.file_kind(Path::new(path)) else {
            return;
        };
        self.orchestrator
            .submit_task(TaskType::Embed, path, priority, mtime);
        self.orchestrator
            .submit_task(TaskType::Llm, path, priority, mtime);
        if kind == FileKind::Image {
            self.orchestrator
                .submit_task(TaskType::Ocr, path, priority, mtime);
        }
    }

    // --- live events ---

    fn handle_event(&self, runtime: &tokio::runtime::Handle, event: Event) {
        match event.kind {
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.handle_delete(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in &event.paths {
                    self.handle_delete(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                // Move: source dies, destination is a creation
                if let Some(from) = event.paths.first() {
                    self.handle_delete(from);
                }
                if let Some(to) = event.paths.get(1) {
                    self.debounce_upsert(runtime, to);
                }
            }
            // Covers data/metadata modifications and rename-to targets
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in &event.paths {
                    self.debounce_upsert(runtime, path);
                }
            }
            _ => {}
        }
    }

    /// Deletes are not debounced: submit for the exact path and, when it
    /// names a folder, for every stored path under it.
    pub(crate) fn handle_delete(&self, path: &Path) {
        if self.is_in_ignored_dir(path) {
            return;
        }
        let normalized = normalize_path(path);

        let mut known = self.known_mtimes.lock().unwrap_or_else(|p| p.into_inner());
        known.remove(&normalized);

        self.orchestrator
            .submit_task(TaskType::Delete, &normalized, PRIORITY_URGENT, 0.0);

        // The path may have been a folder; it is gone, so the store is the
        // only witness to what lived underneath
        let prefix = format!("{normalized}/");
        match self.store.list_file_states() {
            Ok(state) => {
                for stored in state.keys().filter(|p| p.starts_with(&prefix)) {
                    known.remove(stored);
                    self.orchestrator
                        .submit_task(TaskType::Delete, stored, PRIORITY_URGENT, 0.0);
                }
            }
            Err(e) => error!("Could not expand folder delete for {normalized}: {e}"),
        }
    }

    fn debounce_upsert(&self, runtime: &tokio::runtime::Handle, path: &Path) {
        if self.is_in_ignored_dir(path) {
            return;
        }
        let normalized = normalize_path(path);
        let service = self.arc();
        let key = normalized.clone();

        let mut timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
        // Only the last event within the window survives
        if let Some(previous) = timers.remove(&normalized) {
            previous.abort();
        }
        timers.insert(
            normalized,
            runtime.spawn(async move {
                tokio::time::sleep(Duration::from_millis(DEBOUNCE_INTERVAL_MS)).await;
                service
                    .timers
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&key);
                let worker = service.clone();
                tokio::task::spawn_blocking(move || worker.on_upsert_fire(&key));
            }),
        );
    }

    /// Runs once per debounced path after the coalescing window closes.
    pub(crate) fn on_upsert_fire(&self, path_str: &str) {
        let path = Path::new(path_str);
        if !path.exists() {
            return;
        }

        // A freshly created directory gets a mini-scan with the same
        // filters as the startup walk
        if path.is_dir() {
            for file in self.walk_root(path) {
                let normalized = normalize_path(&file);
                match file_mtime(&file) {
                    Ok(mtime) => {
                        self.known_mtimes
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .insert(normalized.clone(), mtime);
                        self.submit_shotgun(&normalized, mtime, PRIORITY_NORMAL);
                    }
                    Err(e) => warn!("Could not stat {normalized}: {e}"),
                }
            }
            return;
        }

        if !self.is_valid_file(path) {
            return;
        }

        let current = match file_mtime(path) {
            Ok(mtime) => mtime,
            Err(_) => return,
        };

        {
            let mut known = self.known_mtimes.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(last) = known.get(path_str) {
                // Unchanged timestamp means a read event, not an edit
                if (current - last).abs() < MTIME_NOISE_THRESHOLD {
                    return;
                }
            }
            known.insert(path_str.to_string(), current);
        }

        info!("[Sync] Event stable: {path_str}");
        self.submit_shotgun(path_str, current, PRIORITY_NORMAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::mock_registry;
    use crate::parser::ParserFacade;
    use crate::store::TaskStatus;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Arc<Store>,
        watcher: Arc<FileWatcherService>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.sync_directories = vec![dir.path().to_string_lossy().to_string()];
        config.ignored_folders = vec!["drafts".to_string()];
        let config = Arc::new(config);

        let store = Arc::new(Store::open(&dir.path().join("state").join("app.db")).unwrap());
        let parser = Arc::new(ParserFacade::new(config.clone()).unwrap());
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(mock_registry()),
            parser,
            config.clone(),
        );
        let watcher = FileWatcherService::new(orchestrator, store.clone(), config);
        Fixture { dir, store, watcher }
    }

    fn tasks_for(store: &Store, path: &str) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = store
            .list_pending()
            .unwrap()
            .into_iter()
            .filter(|(p, _)| p == path)
            .map(|(_, t)| t)
            .collect();
        types.sort();
        types
    }

    #[test]
    fn test_is_valid_file_filters() {
        let fx = fixture();
        let dir = fx.dir.path();

        std::fs::write(dir.join("notes.md"), "x").unwrap();
        std::fs::write(dir.join(".hidden.md"), "x").unwrap();
        std::fs::write(dir.join("~$lock.docx"), "x").unwrap();
        std::fs::write(dir.join("data.zip"), "x").unwrap();

        assert!(fx.watcher.is_valid_file(&dir.join("notes.md")));
        assert!(!fx.watcher.is_valid_file(&dir.join(".hidden.md")));
        assert!(!fx.watcher.is_valid_file(&dir.join("~$lock.docx")));
        assert!(!fx.watcher.is_valid_file(&dir.join("data.zip")));
        assert!(!fx.watcher.is_valid_file(dir));
    }

    #[test]
    fn test_initial_scan_submits_shotgun_for_new_files() {
        let fx = fixture();
        let dir = fx.dir.path();
        std::fs::write(dir.join("doc.md"), "hello").unwrap();
        std::fs::write(dir.join("photo.png"), [0u8; 4]).unwrap();

        fx.watcher.initial_scan(&[dir.to_path_buf()]);

        let doc = normalize_path(&dir.join("doc.md"));
        let photo = normalize_path(&dir.join("photo.png"));
        // Text file: EMBED + LLM; image: EMBED + LLM + OCR
        assert_eq!(tasks_for(&fx.store, &doc), vec![TaskType::Embed, TaskType::Llm]);
        assert_eq!(
            tasks_for(&fx.store, &photo),
            vec![TaskType::Ocr, TaskType::Embed, TaskType::Llm]
        );
    }

    #[test]
    fn test_initial_scan_skips_ignored_and_hidden_folders() {
        let fx = fixture();
        let dir = fx.dir.path();
        std::fs::create_dir(dir.join("drafts")).unwrap();
        std::fs::write(dir.join("drafts").join("wip.md"), "x").unwrap();
        std::fs::create_dir(dir.join(".obsidian")).unwrap();
        std::fs::write(dir.join(".obsidian").join("cache.md"), "x").unwrap();

        fx.watcher.initial_scan(&[dir.to_path_buf()]);

        assert!(fx.store.list_pending().unwrap().is_empty());
    }

    #[test]
    fn test_initial_scan_small_mtime_drift_does_not_reprocess() {
        let fx = fixture();
        let dir = fx.dir.path();
        let path = dir.join("stable.md");
        std::fs::write(&path, "unchanged").unwrap();
        let normalized = normalize_path(&path);
        let mtime = file_mtime(&path).unwrap();

        // The store already knows this file at (almost) the same mtime
        fx.store
            .upsert_task(&normalized, TaskType::Embed, TaskStatus::Done, mtime + 0.5)
            .unwrap();

        fx.watcher.initial_scan(&[dir.to_path_buf()]);

        // Still DONE: no shotgun happened
        let stats = fx.store.stats().unwrap();
        assert_eq!(stats.per_type[&TaskType::Embed].done, 1);
        assert_eq!(stats.per_type[&TaskType::Embed].pending, 0);
        assert_eq!(stats.per_type[&TaskType::Llm].pending, 0);
    }

    #[test]
    fn test_initial_scan_modified_file_is_reprocessed() {
        let fx = fixture();
        let dir = fx.dir.path();
        let path = dir.join("edited.md");
        std::fs::write(&path, "new content").unwrap();
        let normalized = normalize_path(&path);
        let mtime = file_mtime(&path).unwrap();

        fx.store
            .upsert_task(&normalized, TaskType::Embed, TaskStatus::Done, mtime - 30.0)
            .unwrap();

        fx.watcher.initial_scan(&[dir.to_path_buf()]);

        assert_eq!(tasks_for(&fx.store, &normalized), vec![TaskType::Embed, TaskType::Llm]);
    }

    #[test]
    fn test_initial_scan_ghost_cleanup() {
        let fx = fixture();
        let dir = fx.dir.path();
        fx.store
            .upsert_task("/vanished/old.md", TaskType::Embed, TaskStatus::Done, 10.0)
            .unwrap();

        fx.watcher.initial_scan(&[dir.to_path_buf()]);

        assert_eq!(
            tasks_for(&fx.store, "/vanished/old.md"),
            vec![TaskType::Delete]
        );
    }

    #[test]
    fn test_folder_delete_expands_to_stored_children() {
        let fx = fixture();
        fx.store
            .upsert_task("/root/folder/a.md", TaskType::Embed, TaskStatus::Done, 1.0)
            .unwrap();
        fx.store
            .upsert_task("/root/folder/sub/b.png", TaskType::Ocr, TaskStatus::Done, 1.0)
            .unwrap();
        fx.store
            .upsert_task("/root/other.md", TaskType::Embed, TaskStatus::Done, 1.0)
            .unwrap();

        fx.watcher.handle_delete(Path::new("/root/folder"));

        assert_eq!(tasks_for(&fx.store, "/root/folder"), vec![TaskType::Delete]);
        assert_eq!(tasks_for(&fx.store, "/root/folder/a.md"), vec![TaskType::Delete]);
        assert_eq!(
            tasks_for(&fx.store, "/root/folder/sub/b.png"),
            vec![TaskType::Delete]
        );
        // Sibling untouched
        assert_eq!(tasks_for(&fx.store, "/root/other.md"), Vec::<TaskType>::new());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_debounce_collapses_rapid_events() {
        let fx = fixture();
        let dir = fx.dir.path();
        let path = dir.join("burst.md");
        std::fs::write(&path, "first draft of the burst test document").unwrap();

        let runtime = tokio::runtime::Handle::current();
        for _ in 0..5 {
            fx.watcher.debounce_upsert(&runtime, &path);
        }
        assert_eq!(fx.watcher.timers.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(DEBOUNCE_INTERVAL_MS + 400)).await;

        let normalized = normalize_path(&path);
        // Exactly one shotgun: one EMBED row and one LLM row, both PENDING
        assert_eq!(
            tasks_for(&fx.store, &normalized),
            vec![TaskType::Embed, TaskType::Llm]
        );
        assert!(fx.watcher.timers.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spurious_mtime_readback_is_ignored() {
        let fx = fixture();
        let dir = fx.dir.path();
        let path = dir.join("viewed.png");
        std::fs::write(&path, [0u8; 4]).unwrap();
        let normalized = normalize_path(&path);
        let mtime = file_mtime(&path).unwrap();

        // The watcher already knows this exact mtime
        fx.watcher
            .known_mtimes
            .lock()
            .unwrap()
            .insert(normalized.clone(), mtime);

        fx.watcher.on_upsert_fire(&normalized);

        assert!(fx.store.list_pending().unwrap().is_empty());
    }
}
