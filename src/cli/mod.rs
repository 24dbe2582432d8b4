use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::capture::ScreenCapturer;
use crate::config::Config;
use crate::constants::{FASTEMBED_CACHE_DIR, DB_FILE_NAME, STATS_POLL_INTERVAL_SECS, WRITER_LOCK_FILE};
use crate::models::{
    ocr_backend_from_config, FastembedImageBackend, FastembedTextBackend, ModelKey, ModelRegistry,
    OpenAiCompatibleLlm,
};
use crate::orchestrator::Orchestrator;
use crate::parser::ParserFacade;
use crate::search::{MatchType, QueryPart, SearchEngine, SearchRequest, SourceFilter};
use crate::store::{Store, TaskType};
use crate::watcher::FileWatcherService;

/// Local personal knowledge indexer
#[derive(Parser, Debug)]
#[command(name = "recall")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, global = true, default_value = "info")]
    pub loglevel: String,

    /// Suppress console output (log only to file)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Override the data directory (config, store, screenshots, logs)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the indexing daemon: watch folders, process files, capture screens
    Run {
        /// Do not start the screen capturer
        #[arg(long)]
        no_capture: bool,
    },

    /// Search the index
    Search {
        /// Free-text query
        query: Option<String>,

        /// Search by example image instead of (or in addition to) text
        #[arg(long)]
        image: Option<PathBuf>,

        /// Only return results under this folder
        #[arg(long)]
        folder: Option<String>,

        /// Maximum results per modality (defaults to num_results from config)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Disable OCR-sourced matches
        #[arg(long)]
        no_ocr: bool,

        /// Disable embedding-sourced matches
        #[arg(long)]
        no_embed: bool,

        /// Disable LLM-summary matches
        #[arg(long)]
        no_llm: bool,
    },

    /// Show task-ledger statistics
    Stats,

    /// Reset all FAILED tasks to PENDING
    RetryFailed,

    /// Destructive: wipe one service's artifacts and re-queue its tasks
    Reset {
        /// Service key: OCR, EMBED, or LLM
        service: String,
    },
}

pub async fn run(cancel_token: CancellationToken) -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(Config::default_data_dir);
    std::fs::create_dir_all(&data_dir)?;

    crate::logger::init_logger(&data_dir, &cli.loglevel, cli.quiet)?;
    let config = Arc::new(Config::load(&data_dir));

    match cli.command {
        Commands::Run { no_capture } => run_daemon(data_dir, config, no_capture, cancel_token).await,
        Commands::Search {
            query,
            image,
            folder,
            top_k,
            no_ocr,
            no_embed,
            no_llm,
        } => {
            let mut parts = Vec::new();
            if let Some(query) = query {
                parts.push(QueryPart::text(query));
            }
            if let Some(image) = image {
                parts.push(QueryPart::image(image.to_string_lossy().to_string()));
            }
            if parts.is_empty() {
                return Err(anyhow!("provide a text query, --image, or both"));
            }
            let request = SearchRequest {
                parts,
                folder,
                sources: SourceFilter {
                    ocr: !no_ocr,
                    embed: !no_embed,
                    llm: !no_llm,
                },
                top_k: top_k.unwrap_or(config.num_results),
            };
            run_search(&data_dir, config, request).await
        }
        Commands::Stats => {
            let store = Store::open(&data_dir.join(DB_FILE_NAME))?;
            print_stats(&store)
        }
        Commands::RetryFailed => {
            let store = Store::open(&data_dir.join(DB_FILE_NAME))?;
            store.retry_all_failed()?;
            println!("All non-DONE tasks reset to PENDING; they will run on the next daemon start.");
            Ok(())
        }
        Commands::Reset { service } => {
            let store = Store::open(&data_dir.join(DB_FILE_NAME))?;
            store.reset_service(&service.to_uppercase())?;
            println!("Service {} reset; its tasks will re-run on the next daemon start.", service);
            Ok(())
        }
    }
}

/// Wire up every backend behind the uniform registry surface.
fn build_registry(config: &Arc<Config>, data_dir: &std::path::Path) -> Arc<ModelRegistry> {
    let cache_dir = data_dir.join(FASTEMBED_CACHE_DIR);
    Arc::new(ModelRegistry::new(
        ocr_backend_from_config(config),
        Arc::new(FastembedTextBackend::new(&config.text_model_name, &cache_dir)),
        Arc::new(FastembedImageBackend::new(&config.image_model_name, &cache_dir)),
        Arc::new(OpenAiCompatibleLlm::from_config(config)),
        ScreenCapturer::new(config.clone(), data_dir),
    ))
}

async fn run_daemon(
    data_dir: PathBuf,
    config: Arc<Config>,
    no_capture: bool,
    cancel_token: CancellationToken,
) -> Result<()> {
    // One writer process at a time: hold an advisory lock for our lifetime
    let _writer_lock = acquire_writer_lock(&data_dir)
        .ok_or_else(|| anyhow!("another recall instance is already running against {data_dir:?}"))?;

    let store = Arc::new(Store::open(&data_dir.join(DB_FILE_NAME))?);
    crate::store::spawn_integrity_sweep(store.clone());

    let registry = build_registry(&config, &data_dir);

    // Model loading is heavyweight (ONNX sessions, possible downloads);
    // keep it off the runtime threads. Backends that fail to load simply
    // stay unavailable and their tasks sleep in the store.
    {
        let registry = registry.clone();
        let load_capture = !no_capture;
        tokio::task::spawn_blocking(move || {
            for key in [ModelKey::Text, ModelKey::Image, ModelKey::Ocr, ModelKey::Llm] {
                registry.backend(key).load();
            }
            if load_capture {
                registry.screenshotter().load();
            }
        })
        .await?;
    }

    let parser = Arc::new(ParserFacade::new(config.clone())?);
    let orchestrator = Orchestrator::new(store.clone(), registry.clone(), parser, config.clone());
    orchestrator.start();

    let watcher = FileWatcherService::new(orchestrator.clone(), store.clone(), config.clone());
    {
        // The initial reconciliation scan blocks until the walk completes
        let watcher = watcher.clone();
        tokio::task::spawn_blocking(move || watcher.start()).await??;
    }

    let log_dir = crate::logger::get_log_dir(&data_dir);
    let cleanup_task = crate::logger::start_cleanup_task(log_dir, cancel_token.clone());
    let stats_task = spawn_stats_poller(store.clone(), cancel_token.clone());

    tracing::info!("recall daemon up; press Ctrl-C to stop");
    cancel_token.cancelled().await;

    watcher.stop();
    orchestrator.stop();
    registry.screenshotter().unload();
    stats_task.abort();
    cleanup_task.abort();
    Ok(())
}

/// Periodically log a snapshot of the task ledger so operators can see
/// whether the backlog is stuck on backends (PENDING) or content (FAILED).
fn spawn_stats_poller(
    store: Arc<Store>,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(STATS_POLL_INTERVAL_SECS);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match store.stats() {
                        Ok(stats) => {
                            for (task_type, counts) in &stats.per_type {
                                if counts.pending + counts.done + counts.failed > 0 {
                                    tracing::info!(
                                        "[stats] {task_type}: {} pending, {} done, {} failed",
                                        counts.pending, counts.done, counts.failed
                                    );
                                }
                            }
                            tracing::info!("[stats] tracking {} file(s)", stats.total_files);
                        }
                        Err(e) => tracing::warn!("Stats snapshot failed: {e}"),
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
    })
}

async fn run_search(
    data_dir: &std::path::Path,
    config: Arc<Config>,
    request: SearchRequest,
) -> Result<()> {
    let store = Arc::new(Store::open(&data_dir.join(DB_FILE_NAME))?);
    let registry = build_registry(&config, data_dir);

    // Load just the embedders; lexical-only search still works when they
    // are missing
    {
        let registry = registry.clone();
        tokio::task::spawn_blocking(move || {
            registry.text().load();
            registry.image().load();
        })
        .await?;
    }

    let engine = SearchEngine::new(store, registry, config);
    let results = tokio::task::spawn_blocking(move || engine.search(&request)).await?;

    print_hits("Documents", &results.text);
    print_hits("Images", &results.images);
    if results.text.is_empty() && results.images.is_empty() {
        println!("No results.");
    }
    Ok(())
}

fn print_hits(heading: &str, hits: &[crate::search::SearchHit]) {
    if hits.is_empty() {
        return;
    }
    println!("{}", heading.bold());
    for hit in hits {
        let tag = match hit.match_type {
            MatchType::Lexical => "lexical".yellow(),
            MatchType::Semantic => "semantic".blue(),
            MatchType::Hybrid => "hybrid".green(),
        };
        let mut preview: String = hit.content.chars().take(120).collect();
        if preview.len() < hit.content.len() {
            preview.push('…');
        }
        println!(
            "  {:.4}  [{}|{}] {} ({} hit{})",
            hit.score,
            tag,
            hit.source,
            hit.path.bold(),
            hit.num_hits,
            if hit.num_hits == 1 { "" } else { "s" },
        );
        if !preview.trim().is_empty() {
            println!("          {}", preview.dimmed());
        }
    }
    println!();
}

fn print_stats(store: &Store) -> Result<()> {
    let stats = store.stats()?;
    println!("{:<12} {:>8} {:>8} {:>8}", "task".bold(), "pending", "done", "failed");
    for task_type in TaskType::STAT_FAMILIES {
        let counts = stats.per_type.get(&task_type).copied().unwrap_or_default();
        println!(
            "{:<12} {:>8} {:>8} {:>8}",
            task_type.as_str(),
            counts.pending,
            counts.done,
            counts.failed
        );
    }
    println!("\n{} distinct file(s) tracked", stats.total_files);
    Ok(())
}

/// Take the single-writer advisory lock, or return None when another
/// process holds it. The lock is released when the returned file drops.
fn acquire_writer_lock(data_dir: &std::path::Path) -> Option<std::fs::File> {
    use fs2::FileExt;

    let lock_path = data_dir.join(WRITER_LOCK_FILE);
    let file = std::fs::File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .ok()?;

    match file.try_lock_exclusive() {
        Ok(()) => Some(file),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let first = acquire_writer_lock(dir.path());
        assert!(first.is_some());

        let second = acquire_writer_lock(dir.path());
        assert!(second.is_none());

        drop(first);
        assert!(acquire_writer_lock(dir.path()).is_some());
    }
}
