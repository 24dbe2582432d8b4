//! OCR backends.
//!
//! The concrete engine is an external collaborator; what lives here is the
//! contract (`OcrBackend`) plus a `tesseract` CLI adapter and a disabled
//! placeholder. Oversized or exotic inputs are pre-scaled to a temporary
//! PNG before the engine sees them, which keeps the engine from choking on
//! 100-megapixel scans.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

use super::{Backend, Capabilities};
use crate::config::Config;
use crate::error::{RecallError, Result};

/// Longest edge the engine is handed; bigger inputs are thumbnailed first.
const MAX_OCR_DIMENSION: u32 = 2500;

/// OCR surface. An empty string is a valid result ("we looked, there was no
/// text"); errors mean the engine itself misbehaved.
pub trait OcrBackend: Backend {
    fn process_image(&self, path: &Path) -> Result<String>;
}

/// Adapter over the `tesseract` command-line binary.
pub struct TesseractOcr {
    enabled: AtomicBool,
    temp_counter: AtomicU64,
}

impl TesseractOcr {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            temp_counter: AtomicU64::new(0),
        }
    }

    /// Decode, downscale, and re-encode the input as a temporary PNG when
    /// needed. Returns `None` when the original can be used as-is.
    fn optimized_temp_file(&self, path: &Path) -> Result<Option<PathBuf>> {
        let img = image::open(path)
            .map_err(|e| RecallError::parse(path, format!("image decode failed: {e}")))?;

        let needs_scaling = img.width() > MAX_OCR_DIMENSION || img.height() > MAX_OCR_DIMENSION;
        let needs_reencode = !matches!(
            crate::utils::dot_extension(path).as_str(),
            ".png" | ".jpg" | ".jpeg" | ".tif" | ".tiff" | ".bmp"
        );
        if !needs_scaling && !needs_reencode {
            return Ok(None);
        }

        let img = if needs_scaling {
            img.thumbnail(MAX_OCR_DIMENSION, MAX_OCR_DIMENSION)
        } else {
            img
        };

        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp_path =
            std::env::temp_dir().join(format!("recall-ocr-{}-{n}.png", std::process::id()));
        img.to_rgb8()
            .save_with_format(&temp_path, image::ImageFormat::Png)
            .map_err(|e| RecallError::io(&temp_path, format!("temp write failed: {e}")))?;
        Ok(Some(temp_path))
    }
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for TesseractOcr {
    /// Checks the binary is present and flips the availability flag.
    fn load(&self) -> bool {
        match Command::new("tesseract").arg("--version").output() {
            Ok(output) if output.status.success() => {
                info!("tesseract OCR loaded");
                self.enabled.store(true, Ordering::SeqCst);
                true
            }
            Ok(_) | Err(_) => {
                error!("tesseract binary not found; OCR unavailable");
                false
            }
        }
    }

    fn unload(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        info!("tesseract OCR unloaded");
    }

    fn loaded(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn model_name(&self) -> String {
        "tesseract".to_string()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

impl OcrBackend for TesseractOcr {
    fn process_image(&self, path: &Path) -> Result<String> {
        if !self.loaded() {
            return Err(RecallError::unavailable("ocr"));
        }
        if !path.exists() {
            return Err(RecallError::io(path, "file vanished before OCR"));
        }

        let temp_path = self.optimized_temp_file(path)?;
        let input = temp_path.as_deref().unwrap_or(path);

        let result = Command::new("tesseract")
            .arg(input)
            .arg("stdout")
            .output()
            .map_err(|e| RecallError::backend(format!("tesseract spawn failed: {e}")));

        if let Some(temp) = &temp_path {
            if let Err(e) = std::fs::remove_file(temp) {
                debug!("Could not remove OCR temp file {:?}: {e}", temp);
            }
        }

        let output = result?;
        if !output.status.success() {
            return Err(RecallError::backend(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Placeholder used when no OCR engine is configured; never loads.
pub struct DisabledOcr;

impl Backend for DisabledOcr {
    fn load(&self) -> bool {
        warn!("OCR backend disabled by configuration");
        false
    }

    fn unload(&self) {}

    fn loaded(&self) -> bool {
        false
    }

    fn model_name(&self) -> String {
        "disabled".to_string()
    }
}

impl OcrBackend for DisabledOcr {
    fn process_image(&self, _path: &Path) -> Result<String> {
        Err(RecallError::unavailable("ocr"))
    }
}

/// Pick the OCR backend from the config selector string.
pub fn ocr_backend_from_config(config: &Config) -> std::sync::Arc<dyn OcrBackend> {
    match config.ocr_backend.to_lowercase().as_str() {
        "tesseract" => std::sync::Arc::new(TesseractOcr::new()),
        "disabled" | "none" => std::sync::Arc::new(DisabledOcr),
        other => {
            warn!("Unknown ocr_backend {other:?}, OCR disabled");
            std::sync::Arc::new(DisabledOcr)
        }
    }
}
