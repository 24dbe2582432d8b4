//! Embedding backends over fastembed (ONNX runtime).
//!
//! Two backends: a text embedder for document chunks and queries, and a
//! joint-space image embedder (CLIP) whose vision tower encodes images and
//! whose text tower encodes queries against them. Models are materialized
//! on `load()` — first use downloads weights into the fastembed cache under
//! the data directory — and dropped on `unload()`.

use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    TextEmbedding,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use super::{Backend, Capabilities};
use crate::error::{RecallError, Result};

/// Retrieval instruction BGE models expect in front of search queries.
const BGE_QUERY_PREFIX: &str = "Represent this sentence for searching relevant passages: ";

/// Text embedder surface. Vectors may come back unnormalized; callers
/// normalize where scoring requires it.
pub trait TextEmbedder: Backend {
    fn encode(&self, inputs: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>>;

    /// Model-required instruction prefix for retrieval queries, if any.
    fn query_prefix(&self) -> Option<&str> {
        None
    }
}

/// Joint-space image embedder surface.
pub trait ImageEmbedder: Backend {
    /// Encode image files (by path) into the joint space.
    fn encode_images(&self, paths: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>>;

    /// Encode query text into the same space, when `text_encode` is
    /// advertised.
    fn encode_query_text(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

fn map_text_model(name: &str) -> EmbeddingModel {
    match name {
        "BAAI/bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "BAAI/bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        "sentence-transformers/all-MiniLM-L6-v2" => EmbeddingModel::AllMiniLML6V2,
        "nomic-ai/nomic-embed-text-v1.5" => EmbeddingModel::NomicEmbedTextV15,
        other => {
            warn!("Unknown text model {other:?}, falling back to BAAI/bge-small-en-v1.5");
            EmbeddingModel::BGESmallENV15
        }
    }
}

/// Text embedding backend.
pub struct FastembedTextBackend {
    model_name: String,
    cache_dir: PathBuf,
    state: Mutex<Option<TextEmbedding>>,
}

impl FastembedTextBackend {
    pub fn new(model_name: &str, cache_dir: &Path) -> Self {
        Self {
            model_name: model_name.to_string(),
            cache_dir: cache_dir.to_path_buf(),
            state: Mutex::new(None),
        }
    }
}

impl Backend for FastembedTextBackend {
    fn load(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.is_some() {
            return true;
        }
        info!("Loading text embedder {}", self.model_name);
        let options = InitOptions::new(map_text_model(&self.model_name))
            .with_cache_dir(self.cache_dir.clone())
            .with_show_download_progress(false);
        match TextEmbedding::try_new(options) {
            Ok(model) => {
                *state = Some(model);
                true
            }
            Err(e) => {
                error!("Failed to load text embedder {}: {e}", self.model_name);
                false
            }
        }
    }

    fn unload(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.take().is_some() {
            info!("Unloaded text embedder {}", self.model_name);
        }
    }

    fn loaded(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    fn model_name(&self) -> String {
        self.model_name.clone()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            text_encode: true,
            ..Default::default()
        }
    }
}

impl TextEmbedder for FastembedTextBackend {
    fn encode(&self, inputs: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let model = state
            .as_mut()
            .ok_or_else(|| RecallError::unavailable("text"))?;
        model
            .embed(inputs.to_vec(), Some(batch_size))
            .map_err(|e| RecallError::backend(format!("text embedding failed: {e}")))
    }

    fn query_prefix(&self) -> Option<&str> {
        if self.model_name.starts_with("BAAI/bge-") {
            Some(BGE_QUERY_PREFIX)
        } else {
            None
        }
    }
}

/// The CLIP pair backing the joint space: vision tower for files, text
/// tower for queries.
struct ImageTowers {
    vision: ImageEmbedding,
    text: TextEmbedding,
}

/// Joint-space image embedding backend.
pub struct FastembedImageBackend {
    model_name: String,
    cache_dir: PathBuf,
    state: Mutex<Option<ImageTowers>>,
}

impl FastembedImageBackend {
    pub fn new(model_name: &str, cache_dir: &Path) -> Self {
        if model_name != "clip-ViT-B-32" {
            warn!("Unknown image model {model_name:?}, loading clip-ViT-B-32 weights");
        }
        Self {
            model_name: model_name.to_string(),
            cache_dir: cache_dir.to_path_buf(),
            state: Mutex::new(None),
        }
    }
}

impl Backend for FastembedImageBackend {
    fn load(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.is_some() {
            return true;
        }
        info!("Loading image embedder {}", self.model_name);

        let vision_options = ImageInitOptions::new(ImageEmbeddingModel::ClipVitB32)
            .with_cache_dir(self.cache_dir.clone())
            .with_show_download_progress(false);
        let text_options = InitOptions::new(EmbeddingModel::ClipVitB32)
            .with_cache_dir(self.cache_dir.clone())
            .with_show_download_progress(false);

        let vision = match ImageEmbedding::try_new(vision_options) {
            Ok(model) => model,
            Err(e) => {
                error!("Failed to load image embedder vision tower: {e}");
                return false;
            }
        };
        let text = match TextEmbedding::try_new(text_options) {
            Ok(model) => model,
            Err(e) => {
                error!("Failed to load image embedder text tower: {e}");
                return false;
            }
        };

        *state = Some(ImageTowers { vision, text });
        true
    }

    fn unload(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.take().is_some() {
            info!("Unloaded image embedder {}", self.model_name);
        }
    }

    fn loaded(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    fn model_name(&self) -> String {
        self.model_name.clone()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            text_encode: true,
            image_encode: true,
            ..Default::default()
        }
    }
}

impl ImageEmbedder for FastembedImageBackend {
    fn encode_images(&self, paths: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let towers = state
            .as_mut()
            .ok_or_else(|| RecallError::unavailable("image"))?;
        towers
            .vision
            .embed(paths.to_vec(), Some(batch_size))
            .map_err(|e| RecallError::backend(format!("image embedding failed: {e}")))
    }

    fn encode_query_text(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let towers = state
            .as_mut()
            .ok_or_else(|| RecallError::unavailable("image"))?;
        towers
            .text
            .embed(texts.to_vec(), None)
            .map_err(|e| RecallError::backend(format!("query embedding failed: {e}")))
    }
}
