//! Uniform load/unload/availability surface over heterogeneous backends.
//!
//! The registry maps well-known keys (`ocr`, `text`, `image`, `llm`,
//! `screenshotter`) to backend handles. Callers branch on advertised
//! capabilities, never on concrete backend identities, and must treat any
//! backend as transiently unavailable between a `loaded()` check and the
//! call — backends toggle at runtime.

mod embedder;
mod llm;
mod ocr;

pub use embedder::{FastembedImageBackend, FastembedTextBackend, ImageEmbedder, TextEmbedder};
pub use llm::{
    budget_text, indexing_prompt_for_image, indexing_prompt_for_text, LlmBackend,
    OpenAiCompatibleLlm, TokenStream,
};
pub use ocr::{ocr_backend_from_config, DisabledOcr, OcrBackend, TesseractOcr};

use std::fmt;
use std::sync::Arc;

/// Well-known registry keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKey {
    Ocr,
    Text,
    Image,
    Llm,
    Screenshotter,
}

impl ModelKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKey::Ocr => "ocr",
            ModelKey::Text => "text",
            ModelKey::Image => "image",
            ModelKey::Llm => "llm",
            ModelKey::Screenshotter => "screenshotter",
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a backend can do. Consumers branch on these flags, not on which
/// implementation happens to be plugged in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Chat backend accepts image inputs
    pub vision: bool,
    /// Backend can encode text into its vector space (joint-space image
    /// embedders advertise this so text queries can match images)
    pub text_encode: bool,
    /// Backend can encode images into its vector space
    pub image_encode: bool,
}

/// Load/unload/availability surface every backend shares.
///
/// `load`/`unload` are idempotent and thread-safe. `model_name` is the
/// stable identifier stored alongside artifacts; at search time vectors are
/// filtered by it so embeddings from different models are never compared.
/// Capabilities must survive unload/reload cycles.
pub trait Backend: Send + Sync {
    fn load(&self) -> bool;
    fn unload(&self);
    fn loaded(&self) -> bool;
    fn model_name(&self) -> String;
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

/// Map of well-known keys to backend handles.
pub struct ModelRegistry {
    ocr: Arc<dyn OcrBackend>,
    text: Arc<dyn TextEmbedder>,
    image: Arc<dyn ImageEmbedder>,
    llm: Arc<dyn LlmBackend>,
    screenshotter: Arc<dyn Backend>,
}

impl ModelRegistry {
    pub fn new(
        ocr: Arc<dyn OcrBackend>,
        text: Arc<dyn TextEmbedder>,
        image: Arc<dyn ImageEmbedder>,
        llm: Arc<dyn LlmBackend>,
        screenshotter: Arc<dyn Backend>,
    ) -> Self {
        Self {
            ocr,
            text,
            image,
            llm,
            screenshotter,
        }
    }

    pub fn ocr(&self) -> &Arc<dyn OcrBackend> {
        &self.ocr
    }

    pub fn text(&self) -> &Arc<dyn TextEmbedder> {
        &self.text
    }

    pub fn image(&self) -> &Arc<dyn ImageEmbedder> {
        &self.image
    }

    pub fn llm(&self) -> &Arc<dyn LlmBackend> {
        &self.llm
    }

    pub fn screenshotter(&self) -> &Arc<dyn Backend> {
        &self.screenshotter
    }

    /// Generic view for key-driven operations (toggling, status listings).
    pub fn backend(&self, key: ModelKey) -> Arc<dyn Backend> {
        match key {
            ModelKey::Ocr => self.ocr.clone().as_backend(),
            ModelKey::Text => self.text.clone().as_backend(),
            ModelKey::Image => self.image.clone().as_backend(),
            ModelKey::Llm => self.llm.clone().as_backend(),
            ModelKey::Screenshotter => self.screenshotter.clone(),
        }
    }
}

/// Upcast helper: trait objects cannot coerce between traits, so each
/// backend trait carries its own conversion to the base surface.
pub trait AsBackend {
    fn as_backend(self: Arc<Self>) -> Arc<dyn Backend>;
}

/// Thin wrapper forwarding the base surface of a specialized trait object.
/// Trait objects do not implement their supertraits, so each specialized
/// trait gets an explicit forwarding impl.
struct BackendHandle<T: ?Sized>(Arc<T>);

macro_rules! forward_backend {
    ($trait:ident) => {
        impl AsBackend for dyn $trait {
            fn as_backend(self: Arc<Self>) -> Arc<dyn Backend> {
                Arc::new(BackendHandle(self))
            }
        }

        impl Backend for BackendHandle<dyn $trait> {
            fn load(&self) -> bool {
                self.0.load()
            }
            fn unload(&self) {
                self.0.unload()
            }
            fn loaded(&self) -> bool {
                self.0.loaded()
            }
            fn model_name(&self) -> String {
                self.0.model_name()
            }
            fn capabilities(&self) -> Capabilities {
                self.0.capabilities()
            }
        }
    };
}

forward_backend!(OcrBackend);
forward_backend!(TextEmbedder);
forward_backend!(ImageEmbedder);
forward_backend!(LlmBackend);
