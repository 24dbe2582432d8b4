//! Extension → text-extractor facade.
//!
//! Per-format parsers and the cloud-document fetcher are external
//! collaborators: the facade owns the routing table and the contracts
//! (`Extractor`, `CloudFetcher`) and ships plain-text extraction itself.
//! Everything downstream (chunking, gibberish screening, whitespace
//! normalization) lives here so the orchestrator's embed and LLM paths see
//! one call each.

mod chunker;
mod gibberish;

pub use chunker::Chunker;
pub use gibberish::is_gibberish;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{RecallError, Result};
use crate::utils::dot_extension;

/// Extracts plain text from one file format. `limit` caps the number of
/// characters returned.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path, limit: usize) -> Result<String>;
}

/// Resolves a cloud-document pointer file (`.gdoc`) into its text content.
///
/// Implementations authenticate out-of-band (`token.json` /
/// `credentials.json` in the data directory); the facade only routes.
pub trait CloudFetcher: Send + Sync {
    fn fetch_document(&self, path: &Path) -> Result<String>;
}

/// Default fetcher: cloud documents are not configured.
pub struct UnconfiguredFetcher;

impl CloudFetcher for UnconfiguredFetcher {
    fn fetch_document(&self, _path: &Path) -> Result<String> {
        Err(RecallError::unavailable("drive"))
    }
}

/// Reads a file as UTF-8 text (lossy on invalid sequences).
pub struct PlainTextExtractor;

impl Extractor for PlainTextExtractor {
    fn extract(&self, path: &Path, limit: usize) -> Result<String> {
        let bytes = std::fs::read(path)
            .map_err(|e| RecallError::io(path, format!("read failed: {e}")))?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(truncate_chars(&text, limit))
    }
}

/// Extension-routed document parsing, chunking, and filtering.
pub struct ParserFacade {
    config: Arc<Config>,
    chunker: Chunker,
    extractors: HashMap<String, Box<dyn Extractor>>,
    cloud: Box<dyn CloudFetcher>,
}

impl ParserFacade {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let chunker = Chunker::new(config.chunk_size, config.chunk_overlap)?;

        let mut extractors: HashMap<String, Box<dyn Extractor>> = HashMap::new();
        for ext in [".txt", ".md"] {
            extractors.insert(ext.to_string(), Box::new(PlainTextExtractor));
        }

        Ok(Self {
            config,
            chunker,
            extractors,
            cloud: Box::new(UnconfiguredFetcher),
        })
    }

    /// Install a cloud-document fetcher (replaces the unconfigured default).
    pub fn with_cloud_fetcher(mut self, fetcher: Box<dyn CloudFetcher>) -> Self {
        self.cloud = fetcher;
        self
    }

    /// Register an extractor for an extension (lowercase, with leading dot).
    /// Rich formats (`.pdf`, `.docx`) are expected to arrive through here.
    pub fn register_extractor(&mut self, extension: &str, extractor: Box<dyn Extractor>) {
        self.extractors.insert(extension.to_string(), extractor);
    }

    /// Parse content once, whitespace-normalized, for the LLM or the chunker.
    ///
    /// Errors map onto task outcomes: `Unavailable` leaves the task PENDING
    /// (drive disabled mid-flight), everything else fails it.
    pub fn extract_text(&self, path: &Path) -> Result<String> {
        let ext = dot_extension(path);

        let raw = if ext == ".gdoc" {
            if !self.config.use_drive {
                return Err(RecallError::data_invalid(
                    "cloud documents disabled (use_drive=false)",
                ));
            }
            self.cloud.fetch_document(path)?
        } else {
            match self.extractors.get(&ext) {
                Some(extractor) => extractor.extract(path, self.config.max_text_chars)?,
                None => {
                    return Err(RecallError::data_invalid(format!(
                        "no extractor registered for {ext:?}"
                    )))
                }
            }
        };

        let content = squash_whitespace(&raw);
        if content.is_empty() {
            warn!("Did not extract any text from {:?}", path.file_name());
            return Err(RecallError::data_invalid("extraction produced no text"));
        }
        Ok(content)
    }

    /// Parse, chunk, and screen a document for embedding.
    ///
    /// Returns `(chunk_index, chunk_text)` pairs; indices are the chunk's
    /// position before screening, so neighbors of a dropped chunk keep their
    /// numbering. An empty result means the file had nothing worth indexing.
    pub fn chunk_file(&self, path: &Path) -> Result<Vec<(i64, String)>> {
        let content = self.extract_text(path)?;
        let chunks = self.chunker.chunks(&content);

        let mut kept = Vec::with_capacity(chunks.len());
        let mut gibberish_count = 0usize;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let chunk = chunk.trim_start_matches(['.', ' ']).to_string();
            if is_gibberish(&chunk) {
                gibberish_count += 1;
            } else {
                kept.push((i as i64, chunk));
            }
        }

        if gibberish_count > 0 {
            debug!(
                "Dropped {} gibberish chunk(s) from {:?}",
                gibberish_count,
                path.file_name()
            );
        }
        Ok(kept)
    }
}

/// Collapse all whitespace runs to single spaces and trim.
fn squash_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate on a char boundary to at most `limit` characters.
fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
