//! Task orchestration.
//!
//! Owns the priority job queue, a bounded worker pool, per-modality
//! batching buffers, and a watchdog for stuck work. Tasks are persisted
//! PENDING before anything else happens; the in-memory queue only ever
//! holds work whose backend was loaded at submit time, and
//! `resume_pending` re-enqueues the rest when a backend comes online.
//!
//! Slot accounting: every dispatched unit (single job or batch) holds one
//! semaphore slot wrapped in a `Slot` that can be released exactly once.
//! The watchdog releases the slot of a stuck job explicitly; if the
//! orphaned worker later completes it finds the release already done and
//! does nothing, so a slot can never be returned twice.

mod queue;

pub use queue::{Job, JobQueue, PRIORITY_HIGH, PRIORITY_NORMAL, PRIORITY_URGENT};

use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, FileKind};
use crate::constants::{QUEUE_POP_TIMEOUT_MS, WATCHDOG_INTERVAL_SECS};
use crate::error::Result;
use crate::models::{
    budget_text, indexing_prompt_for_image, indexing_prompt_for_text, ModelRegistry,
};
use crate::parser::ParserFacade;
use crate::store::{EmbeddingRow, Store, TaskStatus, TaskType};
use crate::utils::{file_mtime, l2_normalize, vector_to_blob};

type JobKey = (String, TaskType);

/// A worker slot that can be released exactly once, from any completion
/// path (normal return, panic cleanup, or watchdog timeout).
struct Slot {
    semaphore: Arc<Semaphore>,
    released: AtomicBool,
}

impl Slot {
    /// Acquire one slot. Returns `None` only when the semaphore is closed
    /// (shutdown).
    async fn acquire(semaphore: Arc<Semaphore>) -> Option<Arc<Slot>> {
        let permit = semaphore.clone().acquire_owned().await.ok()?;
        // Manual accounting from here on: the Slot decides when the permit
        // goes back
        permit.forget();
        Some(Arc::new(Slot {
            semaphore,
            released: AtomicBool::new(false),
        }))
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.semaphore.add_permits(1);
        }
    }
}

struct ActiveJob {
    started: Instant,
    slot: Arc<Slot>,
}

/// Which batching buffer a flush came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchKind {
    TextEmbed,
    ImageEmbed,
    Delete,
}

impl BatchKind {
    fn task_type(&self) -> TaskType {
        match self {
            BatchKind::TextEmbed | BatchKind::ImageEmbed => TaskType::Embed,
            BatchKind::Delete => TaskType::Delete,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            BatchKind::TextEmbed => "TEXT",
            BatchKind::ImageEmbed => "IMAGE",
            BatchKind::Delete => "DELETE",
        }
    }
}

/// Dispatcher-owned batching buffer. Only the dispatcher task mutates it,
/// so no lock is needed; flushing snapshots the contents before handing
/// them to a worker.
struct BatchBuffer {
    jobs: Vec<Job>,
    oldest: Option<Instant>,
}

impl BatchBuffer {
    fn new() -> Self {
        Self {
            jobs: Vec::new(),
            oldest: None,
        }
    }

    fn push(&mut self, job: Job) {
        if self.jobs.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.jobs.push(job);
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }

    fn is_stale(&self, flush_timeout: Duration) -> bool {
        matches!(self.oldest, Some(oldest) if oldest.elapsed() > flush_timeout)
    }

    fn take(&mut self) -> Vec<Job> {
        self.oldest = None;
        std::mem::take(&mut self.jobs)
    }
}

/// Coordinates the four processing pipelines against pluggable backends.
pub struct Orchestrator {
    store: Arc<Store>,
    models: Arc<ModelRegistry>,
    parser: Arc<ParserFacade>,
    config: Arc<Config>,
    queue: Arc<JobQueue>,
    slots: Arc<Semaphore>,
    active_jobs: DashMap<JobKey, ActiveJob>,
    cancel: CancellationToken,
    /// Back-reference for handing clones to spawned workers
    weak: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        models: Arc<ModelRegistry>,
        parser: Arc<ParserFacade>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let workers = config.max_workers.max(1);
        Arc::new_cyclic(|weak| Self {
            store,
            models,
            parser,
            config,
            queue: Arc::new(JobQueue::new()),
            slots: Arc::new(Semaphore::new(workers)),
            active_jobs: DashMap::new(),
            cancel: CancellationToken::new(),
            weak: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("orchestrator is alive")
    }

    /// Restore PENDING work from the store and start the dispatcher.
    pub fn start(&self) {
        info!(
            "Orchestrator started with {} workers",
            self.config.max_workers.max(1)
        );

        match self.store.list_pending() {
            Ok(pending) => {
                let mut resumed = 0usize;
                for (path, task_type) in pending {
                    if self.backend_available(task_type, &path) {
                        self.queue.push(Job {
                            priority: PRIORITY_HIGH,
                            task_type,
                            path,
                        });
                        resumed += 1;
                    }
                }
                if resumed > 0 {
                    info!("Resumed {resumed} pending task(s) from the store");
                }
            }
            Err(e) => error!("Could not list pending tasks at startup: {e}"),
        }

        tokio::spawn(self.arc().dispatch_loop());
    }

    /// Stop accepting work. In-flight work may complete or be abandoned;
    /// its rows stay PENDING for the next start.
    pub fn stop(&self) {
        self.cancel.cancel();
        info!("Orchestrator stopped");
    }

    /// Persist a task as PENDING, then enqueue it in memory when its
    /// backend is currently loaded. Otherwise the row sleeps in the store
    /// until `resume_pending` wakes it.
    pub fn submit_task(&self, task_type: TaskType, path: &str, priority: u8, mtime: f64) {
        if let Err(e) = self
            .store
            .upsert_task(path, task_type, TaskStatus::Pending, mtime)
        {
            error!("Could not persist {task_type} task for {path}: {e}");
            return;
        }

        if self.backend_available(task_type, path) {
            self.queue.push(Job {
                priority,
                task_type,
                path: path.to_string(),
            });
            debug!("Queued: {task_type} for {path}");
        } else {
            debug!("Saved (backend offline): {task_type} for {path}");
        }
    }

    /// Re-enqueue sleeping PENDING tasks of one type. Called when a backend
    /// transitions from unloaded to loaded.
    pub fn resume_pending(&self, task_type: TaskType) {
        let pending = match self.store.list_pending() {
            Ok(pending) => pending,
            Err(e) => {
                error!("Could not list pending tasks: {e}");
                return;
            }
        };

        let mut count = 0usize;
        for (path, t) in pending {
            if t == task_type {
                self.queue.push(Job {
                    priority: PRIORITY_NORMAL,
                    task_type: t,
                    path,
                });
                count += 1;
            }
        }
        if count > 0 {
            info!("Resumed {count} sleeping {task_type} task(s)");
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn active_job_count(&self) -> usize {
        self.active_jobs.len()
    }

    fn backend_available(&self, task_type: TaskType, path: &str) -> bool {
        match task_type {
            TaskType::Ocr => self.models.ocr().loaded(),
            TaskType::Embed => match self.config.file_kind(Path::new(path)) {
                Some(FileKind::Text) => self.models.text().loaded(),
                Some(FileKind::Image) => self.models.image().loaded(),
                // Unroutable files pass through so the dispatcher can mark
                // them FAILED instead of leaving them PENDING forever
                None => true,
            },
            TaskType::EmbedLlm => self.models.text().loaded(),
            TaskType::Llm => self.models.llm().loaded(),
            TaskType::Delete => true,
        }
    }

    // --- dispatcher ---

    async fn dispatch_loop(self: Arc<Self>) {
        let flush_timeout = Duration::from_secs_f64(self.config.flush_timeout.max(0.0));
        let pop_timeout = Duration::from_millis(QUEUE_POP_TIMEOUT_MS);
        let watchdog_interval = Duration::from_secs(WATCHDOG_INTERVAL_SECS);
        let batch_size = self.config.batch_size.max(1);

        let mut text_buffer = BatchBuffer::new();
        let mut image_buffer = BatchBuffer::new();
        let mut delete_buffer = BatchBuffer::new();
        let mut last_watchdog = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(slot) = Slot::acquire(self.slots.clone()).await else {
                break;
            };

            if text_buffer.is_stale(flush_timeout) {
                self.spawn_batch(BatchKind::TextEmbed, text_buffer.take());
            }
            if image_buffer.is_stale(flush_timeout) {
                self.spawn_batch(BatchKind::ImageEmbed, image_buffer.take());
            }
            if delete_buffer.is_stale(flush_timeout) {
                self.spawn_batch(BatchKind::Delete, delete_buffer.take());
            }

            if last_watchdog.elapsed() >= watchdog_interval {
                self.check_timeouts();
                last_watchdog = Instant::now();
            }

            let job = tokio::select! {
                job = self.queue.pop_timeout(pop_timeout) => job,
                _ = self.cancel.cancelled() => {
                    slot.release();
                    break;
                }
            };
            let Some(job) = job else {
                slot.release();
                continue;
            };

            match job.task_type {
                TaskType::Embed => {
                    // The buffer worker reacquires a slot when dispatched
                    slot.release();
                    match self.config.file_kind(Path::new(&job.path)) {
                        Some(FileKind::Text) => {
                            text_buffer.push(job);
                            if text_buffer.len() >= batch_size {
                                self.spawn_batch(BatchKind::TextEmbed, text_buffer.take());
                            }
                        }
                        Some(FileKind::Image) => {
                            image_buffer.push(job);
                            if image_buffer.len() >= batch_size {
                                self.spawn_batch(BatchKind::ImageEmbed, image_buffer.take());
                            }
                        }
                        None => self.fail_task(&job.path, TaskType::Embed),
                    }
                }
                TaskType::Delete => {
                    slot.release();
                    delete_buffer.push(job);
                    if delete_buffer.len() >= batch_size {
                        self.spawn_batch(BatchKind::Delete, delete_buffer.take());
                    }
                }
                _ => self.spawn_single(job, slot),
            }
        }

        debug!("Dispatcher loop exited");
    }

    fn spawn_single(&self, job: Job, slot: Arc<Slot>) {
        let key: JobKey = (job.path.clone(), job.task_type);
        self.active_jobs.insert(
            key.clone(),
            ActiveJob {
                started: Instant::now(),
                slot: slot.clone(),
            },
        );

        let this = self.arc();
        tokio::spawn(async move {
            let worker = this.clone();
            let work = job.clone();
            let outcome = tokio::task::spawn_blocking(move || worker.execute_single(&work)).await;
            if outcome.is_err() {
                // The worker panicked; the task itself is the casualty
                error!("Worker panicked on {} {}", job.task_type, job.path);
                this.fail_task(&job.path, job.task_type);
            }
            this.active_jobs.remove(&key);
            slot.release();
        });
    }

    fn spawn_batch(&self, kind: BatchKind, jobs: Vec<Job>) {
        if jobs.is_empty() {
            return;
        }
        info!("Dispatching {} batch: {} file(s)", kind.label(), jobs.len());

        let this = self.arc();
        tokio::spawn(async move {
            let Some(slot) = Slot::acquire(this.slots.clone()).await else {
                return;
            };
            let task_type = kind.task_type();
            let started = Instant::now();
            for job in &jobs {
                this.active_jobs.insert(
                    (job.path.clone(), task_type),
                    ActiveJob {
                        started,
                        slot: slot.clone(),
                    },
                );
            }

            let worker = this.clone();
            let batch = jobs.clone();
            let outcome =
                tokio::task::spawn_blocking(move || worker.execute_batch(kind, &batch)).await;
            if outcome.is_err() {
                error!("Batch worker panicked ({} batch)", kind.label());
                for job in &jobs {
                    this.fail_task(&job.path, task_type);
                }
            }

            for job in &jobs {
                this.active_jobs.remove(&(job.path.clone(), task_type));
            }
            slot.release();
        });
    }

    /// Mark jobs running longer than `task_timeout` as FAILED and release
    /// their slots explicitly, even if the worker thread never returns.
    pub(crate) fn check_timeouts(&self) {
        let timeout = Duration::from_secs(self.config.task_timeout);
        let expired: Vec<(JobKey, Arc<Slot>)> = self
            .active_jobs
            .iter()
            .filter(|entry| entry.value().started.elapsed() > timeout)
            .map(|entry| (entry.key().clone(), entry.value().slot.clone()))
            .collect();

        for ((path, task_type), slot) in expired {
            if self.active_jobs.remove(&(path.clone(), task_type)).is_some() {
                warn!(
                    "Watchdog: {task_type} for {path} exceeded {}s, marking FAILED",
                    self.config.task_timeout
                );
                self.fail_task(&path, task_type);
                slot.release();
            }
        }
    }

    fn fail_task(&self, path: &str, task_type: TaskType) {
        if let Err(e) = self
            .store
            .upsert_task(path, task_type, TaskStatus::Failed, 0.0)
        {
            error!("Could not mark {task_type} FAILED for {path}: {e}");
        }
    }

    fn complete_task(&self, path: &str, task_type: TaskType) {
        if let Err(e) = self.store.mark_completed(path, task_type) {
            error!("Could not mark {task_type} DONE for {path}: {e}");
        }
    }

    // --- execution semantics ---

    fn execute_single(&self, job: &Job) {
        match job.task_type {
            TaskType::Ocr => self.run_ocr(job),
            TaskType::Llm => self.run_llm(job),
            TaskType::EmbedLlm => self.run_embed_llm(job),
            // Embed and Delete are batch-only
            TaskType::Embed | TaskType::Delete => {}
        }
    }

    fn execute_batch(&self, kind: BatchKind, jobs: &[Job]) {
        match kind {
            BatchKind::TextEmbed => self.run_text_embed_batch(jobs),
            BatchKind::ImageEmbed => self.run_image_embed_batch(jobs),
            BatchKind::Delete => self.run_delete_batch(jobs),
        }
    }

    fn run_ocr(&self, job: &Job) {
        let ocr = self.models.ocr().clone();
        // Exit early, the task stays PENDING for next time
        if !ocr.loaded() {
            return;
        }

        match ocr.process_image(Path::new(&job.path)) {
            Ok(text) => {
                // Empty output still persists a single-space artifact so the
                // file is recorded as processed
                let text = if text.trim().is_empty() {
                    " ".to_string()
                } else {
                    text
                };
                match self.store.save_ocr(&job.path, &text, &ocr.model_name()) {
                    Ok(()) => self.complete_task(&job.path, TaskType::Ocr),
                    Err(e) => {
                        error!("Could not save OCR result for {}: {e}", job.path);
                        self.fail_task(&job.path, TaskType::Ocr);
                    }
                }
            }
            Err(e) if e.leaves_task_pending() => {}
            Err(e) => {
                warn!("OCR failed for {}: {e}", job.path);
                self.fail_task(&job.path, TaskType::Ocr);
            }
        }
    }

    fn run_llm(&self, job: &Job) {
        let llm = self.models.llm().clone();
        if !llm.loaded() {
            return;
        }

        let path = Path::new(&job.path);
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| job.path.clone());

        let (prompt, image_paths) = match self.config.file_kind(path) {
            Some(FileKind::Image) => {
                if !llm.capabilities().vision {
                    warn!("Skipping image (no vision support): {filename}");
                    self.fail_task(&job.path, TaskType::Llm);
                    return;
                }
                (indexing_prompt_for_image(&filename), vec![job.path.clone()])
            }
            Some(FileKind::Text) => match self.parser.extract_text(path) {
                Ok(text) => {
                    let text = budget_text(&text, self.config.llm_context_length);
                    (indexing_prompt_for_text(&filename, &text), Vec::new())
                }
                Err(e) if e.leaves_task_pending() => return,
                Err(e) => {
                    warn!("No usable text for LLM from {filename}: {e}");
                    self.fail_task(&job.path, TaskType::Llm);
                    return;
                }
            },
            None => {
                warn!("Skipping unsupported file: {filename}");
                self.fail_task(&job.path, TaskType::Llm);
                return;
            }
        };

        match llm.invoke(&prompt, &image_paths, None, self.config.llm_temperature) {
            Ok(response) => {
                let cleaned = response.trim();
                if cleaned.is_empty() {
                    self.fail_task(&job.path, TaskType::Llm);
                    return;
                }
                match self.store.save_llm(&job.path, cleaned, &llm.model_name()) {
                    Ok(()) => {
                        self.complete_task(&job.path, TaskType::Llm);
                        debug!("LLM response saved for {filename}");
                        // Queue the summary embedding with high priority; the
                        // artifact is valid even if the source file vanished
                        // in the meantime
                        match file_mtime(path) {
                            Ok(mtime) => self.submit_task(
                                TaskType::EmbedLlm,
                                &job.path,
                                PRIORITY_HIGH,
                                mtime,
                            ),
                            Err(_) => warn!(
                                "Analysis saved, but could not queue summary embedding for {filename} (file missing)"
                            ),
                        }
                    }
                    Err(e) => {
                        error!("Could not save LLM result for {filename}: {e}");
                        self.fail_task(&job.path, TaskType::Llm);
                    }
                }
            }
            Err(e) if e.leaves_task_pending() => {}
            Err(e) => {
                warn!("LLM invocation failed for {filename}: {e}");
                self.fail_task(&job.path, TaskType::Llm);
            }
        }
    }

    fn run_embed_llm(&self, job: &Job) {
        let text_model = self.models.text().clone();
        if !text_model.loaded() {
            return;
        }

        let summary = match self.store.get_llm(&job.path) {
            Ok(Some(summary)) => summary,
            Ok(None) => {
                warn!("No LLM response to embed for {}", job.path);
                self.fail_task(&job.path, TaskType::EmbedLlm);
                return;
            }
            Err(e) => {
                error!("Could not read LLM result for {}: {e}", job.path);
                return;
            }
        };

        match text_model.encode(std::slice::from_ref(&summary), self.config.batch_size) {
            Ok(vectors) if !vectors.is_empty() => {
                let mut vector = vectors.into_iter().next().unwrap_or_default();
                l2_normalize(&mut vector);
                let row = EmbeddingRow {
                    path: job.path.clone(),
                    chunk_index: -1,
                    text_content: summary,
                    embedding: vector_to_blob(&vector),
                    model_name: text_model.model_name(),
                };
                match self.store.save_embeddings(&[row]) {
                    Ok(()) => self.complete_task(&job.path, TaskType::EmbedLlm),
                    Err(e) => {
                        error!("Could not save summary embedding for {}: {e}", job.path);
                        self.fail_task(&job.path, TaskType::EmbedLlm);
                    }
                }
            }
            Ok(_) => {
                warn!("Embedder returned nothing for summary of {}", job.path);
                self.fail_task(&job.path, TaskType::EmbedLlm);
            }
            Err(e) if e.leaves_task_pending() => {}
            Err(e) => {
                warn!("Summary embedding failed for {}: {e}", job.path);
                self.fail_task(&job.path, TaskType::EmbedLlm);
            }
        }
    }

    fn run_text_embed_batch(&self, jobs: &[Job]) {
        let text_model = self.models.text().clone();
        // Leaves every job PENDING for the next model toggle
        if !text_model.loaded() {
            return;
        }

        // Parse and chunk in parallel; the embedder call itself is one batch
        let parsed: Vec<(Job, Result<Vec<(i64, String)>>)> = jobs
            .par_iter()
            .map(|job| {
                let chunks = self.parser.chunk_file(Path::new(&job.path));
                (job.clone(), chunks)
            })
            .collect();

        let mut inputs: Vec<String> = Vec::new();
        let mut row_meta: Vec<(String, i64, String)> = Vec::new();
        let mut candidates: BTreeSet<String> = BTreeSet::new();

        for (job, result) in parsed {
            match result {
                Ok(chunks) if !chunks.is_empty() => {
                    candidates.insert(job.path.clone());
                    for (index, chunk) in chunks {
                        inputs.push(chunk.clone());
                        row_meta.push((job.path.clone(), index, chunk));
                    }
                }
                // Parsing produced no usable chunks
                Ok(_) => self.fail_task(&job.path, TaskType::Embed),
                Err(e) if e.leaves_task_pending() => {}
                Err(e) => {
                    warn!("Parse failed for {}: {e}", job.path);
                    self.fail_task(&job.path, TaskType::Embed);
                }
            }
        }

        if inputs.is_empty() {
            return;
        }

        info!("Embedding {} text chunk(s)", inputs.len());
        match text_model.encode(&inputs, self.config.batch_size) {
            Ok(vectors) => {
                let model_name = text_model.model_name();
                let rows: Vec<EmbeddingRow> = row_meta
                    .into_iter()
                    .zip(vectors)
                    .map(|((path, chunk_index, text_content), mut vector)| {
                        l2_normalize(&mut vector);
                        EmbeddingRow {
                            path,
                            chunk_index,
                            text_content,
                            embedding: vector_to_blob(&vector),
                            model_name: model_name.clone(),
                        }
                    })
                    .collect();

                match self.store.save_embeddings(&rows) {
                    Ok(()) => {
                        for path in &candidates {
                            self.complete_task(path, TaskType::Embed);
                        }
                    }
                    Err(e) => {
                        error!("Could not save text embeddings: {e}");
                        for path in &candidates {
                            self.fail_task(path, TaskType::Embed);
                        }
                    }
                }
            }
            Err(e) if e.leaves_task_pending() => {}
            Err(e) => {
                error!("Text embedding batch failed: {e}");
                for path in &candidates {
                    self.fail_task(path, TaskType::Embed);
                }
            }
        }
    }

    fn run_image_embed_batch(&self, jobs: &[Job]) {
        let image_model = self.models.image().clone();
        if !image_model.loaded() {
            return;
        }

        let mut paths: Vec<String> = Vec::new();
        for job in jobs {
            if Path::new(&job.path).exists() {
                paths.push(job.path.clone());
            } else {
                self.fail_task(&job.path, TaskType::Embed);
            }
        }
        if paths.is_empty() {
            return;
        }

        match image_model.encode_images(&paths, self.config.batch_size) {
            Ok(vectors) => {
                let model_name = image_model.model_name();
                let rows: Vec<EmbeddingRow> = paths
                    .iter()
                    .zip(vectors)
                    .map(|(path, mut vector)| {
                        l2_normalize(&mut vector);
                        EmbeddingRow {
                            path: path.clone(),
                            chunk_index: 0,
                            // Placeholder for the required text field; OCR
                            // text hydrates previews at search time
                            text_content: "[IMAGE]".to_string(),
                            embedding: vector_to_blob(&vector),
                            model_name: model_name.clone(),
                        }
                    })
                    .collect();

                match self.store.save_embeddings(&rows) {
                    Ok(()) => {
                        info!("Saved {} image embedding(s)", paths.len());
                        for path in &paths {
                            self.complete_task(path, TaskType::Embed);
                        }
                    }
                    Err(e) => {
                        error!("Could not save image embeddings: {e}");
                        for path in &paths {
                            self.fail_task(path, TaskType::Embed);
                        }
                    }
                }
            }
            Err(e) if e.leaves_task_pending() => {}
            Err(e) => {
                error!("Image embedding batch failed: {e}");
                for path in &paths {
                    self.fail_task(path, TaskType::Embed);
                }
            }
        }
    }

    fn run_delete_batch(&self, jobs: &[Job]) {
        let paths: Vec<String> = jobs.iter().map(|job| job.path.clone()).collect();
        match self.store.remove_paths_bulk(&paths) {
            Ok(()) => info!("Deleted {} path(s) from the store", paths.len()),
            // Rows stay behind; the DELETE tasks remain and will be retried
            Err(e) => error!("Bulk delete failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::*;
    use crate::models::{Backend, Capabilities, LlmBackend, TokenStream};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<Store>,
        config: Arc<Config>,
        registry: Arc<ModelRegistry>,
    }

    fn fixture(registry: ModelRegistry) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.batch_size = 2;
        config.flush_timeout = 0.05;
        config.max_workers = 2;
        config.task_timeout = 1;
        Fixture {
            store: Arc::new(Store::open(&dir.path().join("app.db")).unwrap()),
            _dir: dir,
            config: Arc::new(config),
            registry: Arc::new(registry),
        }
    }

    fn orchestrator(fixture: &Fixture) -> Arc<Orchestrator> {
        let parser = Arc::new(ParserFacade::new(fixture.config.clone()).unwrap());
        Orchestrator::new(
            fixture.store.clone(),
            fixture.registry.clone(),
            parser,
            fixture.config.clone(),
        )
    }

    fn write_note(fixture: &Fixture, name: &str) -> String {
        let path = fixture._dir.path().join(name);
        std::fs::write(
            &path,
            "These meeting notes describe the quarterly planning session and the \
             decisions made about the new search infrastructure rollout.",
        )
        .unwrap();
        crate::utils::normalize_path(&path)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached within 5s");
    }

    fn status_of(store: &Store, task_type: TaskType) -> (u64, u64, u64) {
        let counts = store.stats().unwrap().per_type[&task_type];
        (counts.pending, counts.done, counts.failed)
    }

    #[test]
    fn test_submit_persists_pending_and_gates_on_backend() {
        let registry = mock_registry();
        registry.text().unload();
        let fx = fixture(registry);
        let orch = orchestrator(&fx);

        orch.submit_task(TaskType::Embed, "/notes/a.md", PRIORITY_NORMAL, 7.0);
        // Persisted PENDING, but not queued: the text embedder is offline
        assert_eq!(status_of(&fx.store, TaskType::Embed), (1, 0, 0));
        assert_eq!(orch.queue_len(), 0);

        // LLM backend is up, so that one queues
        orch.submit_task(TaskType::Llm, "/notes/a.md", PRIORITY_NORMAL, 7.0);
        assert_eq!(orch.queue_len(), 1);
    }

    #[test]
    fn test_resume_pending_requeues_only_matching_type() {
        let registry = mock_registry();
        registry.text().unload();
        let fx = fixture(registry);
        let orch = orchestrator(&fx);

        orch.submit_task(TaskType::Embed, "/notes/a.md", PRIORITY_NORMAL, 1.0);
        orch.submit_task(TaskType::Embed, "/notes/b.md", PRIORITY_NORMAL, 1.0);
        assert_eq!(orch.queue_len(), 0);

        fx.registry.text().load();
        orch.resume_pending(TaskType::Embed);
        assert_eq!(orch.queue_len(), 2);

        orch.resume_pending(TaskType::Ocr);
        assert_eq!(orch.queue_len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_text_file_full_pipeline() {
        let fx = fixture(mock_registry());
        let orch = orchestrator(&fx);
        orch.start();

        let path = write_note(&fx, "notes.md");
        orch.submit_task(TaskType::Embed, &path, PRIORITY_NORMAL, 1.0);
        orch.submit_task(TaskType::Llm, &path, PRIORITY_NORMAL, 1.0);

        let store = fx.store.clone();
        wait_until(move || {
            let stats = store.stats().unwrap();
            stats.per_type[&TaskType::Embed].done == 1
                && stats.per_type[&TaskType::Llm].done == 1
                && stats.per_type[&TaskType::EmbedLlm].done == 1
        })
        .await;

        // Content chunk with index >= 0 plus the summary row at -1
        let vectors = fx.store.list_embeddings("mock-text").unwrap();
        let summaries = vectors
            .iter()
            .filter(|row| row.text_content == "summary of the file")
            .count();
        assert_eq!(summaries, 1);
        assert!(vectors.len() > summaries);
        assert_eq!(fx.store.get_llm(&path).unwrap().unwrap(), "summary of the file");

        orch.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unroutable_extension_fails_embed() {
        let fx = fixture(mock_registry());
        let orch = orchestrator(&fx);
        orch.start();

        orch.submit_task(TaskType::Embed, "/data/archive.zip", PRIORITY_NORMAL, 1.0);

        let store = fx.store.clone();
        wait_until(move || store.stats().unwrap().per_type[&TaskType::Embed].failed == 1).await;
        orch.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_llm_backend_failure_marks_failed() {
        let registry = ModelRegistry::new(
            Arc::new(MockOcr::reading("")),
            Arc::new(MockTextEmbedder::new("mock-text")),
            Arc::new(MockImageEmbedder::new("mock-image")),
            Arc::new(MockLlm::failing("model raised")),
            Arc::new(MockScreenshotter::default()),
        );
        let fx = fixture(registry);
        let orch = orchestrator(&fx);
        orch.start();

        let path = write_note(&fx, "doc.md");
        orch.submit_task(TaskType::Llm, &path, PRIORITY_NORMAL, 1.0);

        let store = fx.store.clone();
        wait_until(move || store.stats().unwrap().per_type[&TaskType::Llm].failed == 1).await;

        // Operator bulk-retry makes it PENDING again
        fx.store.retry_all_failed().unwrap();
        assert_eq!(status_of(&fx.store, TaskType::Llm), (1, 0, 0));
        orch.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delete_batch_removes_rows() {
        let fx = fixture(mock_registry());
        let orch = orchestrator(&fx);
        orch.start();

        fx.store
            .upsert_task("/old/gone.md", TaskType::Embed, TaskStatus::Done, 1.0)
            .unwrap();
        fx.store
            .save_embeddings(&[EmbeddingRow {
                path: "/old/gone.md".to_string(),
                chunk_index: 0,
                text_content: "stale".to_string(),
                embedding: vec![0u8; 4],
                model_name: "mock-text".to_string(),
            }])
            .unwrap();

        orch.submit_task(TaskType::Delete, "/old/gone.md", PRIORITY_URGENT, 0.0);

        let store = fx.store.clone();
        wait_until(move || store.list_file_states().unwrap().is_empty()).await;
        assert!(fx.store.list_embeddings("mock-text").unwrap().is_empty());
        orch.stop();
    }

    /// A chat backend that hangs until told to stop.
    struct HangingLlm {
        release: Arc<AtomicBool>,
    }

    impl Backend for HangingLlm {
        fn load(&self) -> bool {
            true
        }
        fn unload(&self) {}
        fn loaded(&self) -> bool {
            true
        }
        fn model_name(&self) -> String {
            "hanging-llm".to_string()
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                vision: true,
                ..Default::default()
            }
        }
    }

    impl LlmBackend for HangingLlm {
        fn invoke(
            &self,
            _prompt: &str,
            _image_paths: &[String],
            _attached_image: Option<&Path>,
            _temperature: f32,
        ) -> crate::error::Result<String> {
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok("late".to_string())
        }

        fn stream(
            &self,
            prompt: &str,
            image_paths: &[String],
            attached_image: Option<&Path>,
            temperature: f32,
        ) -> crate::error::Result<TokenStream> {
            self.invoke(prompt, image_paths, attached_image, temperature)
                .map(|text| TokenStream::from_chunks(vec![text]))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_watchdog_fails_stuck_job_and_frees_slot() {
        let release = Arc::new(AtomicBool::new(false));
        let registry = ModelRegistry::new(
            Arc::new(MockOcr::reading("")),
            Arc::new(MockTextEmbedder::new("mock-text")),
            Arc::new(MockImageEmbedder::new("mock-image")),
            Arc::new(HangingLlm {
                release: release.clone(),
            }),
            Arc::new(MockScreenshotter::default()),
        );
        let fx = fixture(registry);
        let orch = orchestrator(&fx);
        orch.start();

        let path = write_note(&fx, "stuck.md");
        orch.submit_task(TaskType::Llm, &path, PRIORITY_NORMAL, 1.0);

        let watcher = orch.clone();
        wait_until(move || watcher.active_job_count() == 1).await;

        // Past task_timeout (1s) the watchdog declares the job dead
        tokio::time::sleep(Duration::from_millis(1200)).await;
        orch.check_timeouts();

        assert_eq!(status_of(&fx.store, TaskType::Llm), (0, 0, 1));
        assert_eq!(orch.active_job_count(), 0);

        // Every worker slot must be free again, minus at most the one the
        // dispatcher holds while it waits on the queue
        let workers = fx.config.max_workers.max(1);
        assert!(orch.slots.available_permits() >= workers - 1);

        // The orphaned worker finishing later must not double-release
        release.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(orch.slots.available_permits() <= workers);

        orch.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_embed_llm_without_artifact_fails() {
        let fx = fixture(mock_registry());
        let orch = orchestrator(&fx);
        orch.start();

        orch.submit_task(TaskType::EmbedLlm, "/notes/never-analyzed.md", PRIORITY_HIGH, 1.0);

        let store = fx.store.clone();
        wait_until(move || store.stats().unwrap().per_type[&TaskType::EmbedLlm].failed == 1).await;
        orch.stop();
    }
}
