//! Runtime configuration loaded from `config.json` in the per-user data directory.
//!
//! Missing keys fall back to the documented defaults below; unknown keys are
//! ignored. A missing file is created with defaults, a corrupted file is
//! replaced in memory by defaults with a warning — the daemon never refuses
//! to start over configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::constants::{APP_DIR_NAME, CONFIG_FILE_NAME, SCREENSHOT_DIR_NAME};
use crate::utils::dot_extension;

/// Which processing family a file belongs to, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Absolute paths to index. `~` is expanded.
    #[serde(default)]
    pub sync_directories: Vec<String>,

    /// Max items per embedding/delete batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Token-counted chunker parameters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Max seconds a non-full batch waits before flushing
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout: f64,

    /// Worker pool size
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Watchdog threshold in seconds
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,

    /// Backend selector strings
    #[serde(default = "default_ocr_backend")]
    pub ocr_backend: String,
    #[serde(default = "default_embed_backend")]
    pub embed_backend: String,
    #[serde(default = "default_llm_backend")]
    pub llm_backend: String,

    /// Concrete model identifiers
    #[serde(default = "default_text_model_name")]
    pub text_model_name: String,
    #[serde(default = "default_image_model_name")]
    pub image_model_name: String,
    #[serde(default = "default_lms_model_name")]
    pub lms_model_name: String,
    #[serde(default = "default_openai_model_name")]
    pub openai_model_name: String,

    /// Base URL of the local OpenAI-compatible server (LM Studio)
    #[serde(default = "default_lms_base_url")]
    pub lms_base_url: String,

    /// Enable cloud-document fetch for `.gdoc` files
    #[serde(default)]
    pub use_drive: bool,

    /// Default `top_k` for search
    #[serde(default = "default_num_results")]
    pub num_results: usize,

    /// Extension classifiers (lowercase, with leading dot)
    #[serde(default = "default_text_extensions")]
    pub text_extensions: Vec<String>,
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Walk filters
    #[serde(default)]
    pub ignored_folders: Vec<String>,
    #[serde(default = "default_true")]
    pub skip_hidden_folders: bool,

    /// Capture loop controls
    #[serde(default = "default_screenshot_interval")]
    pub screenshot_interval: u64,
    #[serde(default = "default_screenshot_folder")]
    pub screenshot_folder: String,
    #[serde(default = "default_delete_screenshots_after")]
    pub delete_screenshots_after: u64,

    /// Chat-model budgeting
    #[serde(default = "default_llm_context_length")]
    pub llm_context_length: usize,
    #[serde(default = "default_llm_image_token_cost")]
    pub llm_image_token_cost: usize,
    #[serde(default = "default_llm_temperature")]
    pub llm_temperature: f32,
    #[serde(default)]
    pub llm_system_prompt: String,

    /// Cap on characters extracted from a single document
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

fn default_batch_size() -> usize {
    16
}
fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    64
}
fn default_flush_timeout() -> f64 {
    5.0
}
fn default_max_workers() -> usize {
    num_cpus::get().clamp(1, 6)
}
fn default_task_timeout() -> u64 {
    300
}
fn default_ocr_backend() -> String {
    "tesseract".to_string()
}
fn default_embed_backend() -> String {
    "fastembed".to_string()
}
fn default_llm_backend() -> String {
    "lmstudio".to_string()
}
fn default_text_model_name() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}
fn default_image_model_name() -> String {
    "clip-ViT-B-32".to_string()
}
fn default_lms_model_name() -> String {
    "gemma-3-4b-it".to_string()
}
fn default_openai_model_name() -> String {
    "gpt-4.1".to_string()
}
fn default_lms_base_url() -> String {
    "http://127.0.0.1:1234/v1".to_string()
}
fn default_num_results() -> usize {
    30
}
fn default_text_extensions() -> Vec<String> {
    [".txt", ".md", ".pdf", ".docx", ".gdoc"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_image_extensions() -> Vec<String> {
    [
        ".png", ".jpg", ".jpeg", ".gif", ".webp", ".heic", ".heif", ".tif", ".tiff", ".bmp",
        ".ico",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_true() -> bool {
    true
}
fn default_screenshot_interval() -> u64 {
    15
}
fn default_screenshot_folder() -> String {
    SCREENSHOT_DIR_NAME.to_string()
}
fn default_delete_screenshots_after() -> u64 {
    9
}
fn default_llm_context_length() -> usize {
    4096
}
fn default_llm_image_token_cost() -> usize {
    1024
}
fn default_llm_temperature() -> f32 {
    0.3
}
fn default_max_text_chars() -> usize {
    500_000
}

impl Default for Config {
    fn default() -> Self {
        // Round-trip through an empty object so every field picks up its
        // serde default and the two default paths can never diverge.
        serde_json::from_str("{}").expect("empty config must deserialize")
    }
}

impl Config {
    /// Per-user data directory: `<platform local data dir>/recall`.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME)
    }

    /// Load configuration from `<data_dir>/config.json`.
    ///
    /// Creates the file with defaults when missing. A corrupted file logs a
    /// warning and yields defaults in memory without touching the file on
    /// disk, so the operator can repair it by hand.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            info!("Config file not found, creating default at {:?}", config_path);
            let mut defaults = Self::default();
            defaults.sync_directories =
                vec![data_dir.join(SCREENSHOT_DIR_NAME).to_string_lossy().to_string()];
            if let Err(e) = defaults.save(data_dir) {
                warn!("Could not write default config: {e}");
            }
            return defaults;
        }

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("{:?} is corrupted ({e}), falling back to defaults", config_path);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Could not read {:?} ({e}), falling back to defaults", config_path);
                Self::default()
            }
        }
    }

    /// Write the current settings back to `<data_dir>/config.json`.
    pub fn save(&self, data_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let content = serde_json::to_string_pretty(self).expect("config serializes");
        std::fs::write(data_dir.join(CONFIG_FILE_NAME), content)
    }

    /// Watched roots with `~` expanded. Non-existent roots are the watcher's
    /// problem to skip, not ours to hide.
    pub fn sync_roots(&self) -> Vec<PathBuf> {
        self.sync_directories
            .iter()
            .map(|d| PathBuf::from(shellexpand::tilde(d).to_string()))
            .collect()
    }

    /// Screenshot output directory, resolved against the data dir when the
    /// configured value is relative.
    pub fn screenshot_dir(&self, data_dir: &Path) -> PathBuf {
        let configured = PathBuf::from(shellexpand::tilde(&self.screenshot_folder).to_string());
        if configured.is_absolute() {
            configured
        } else {
            data_dir.join(configured)
        }
    }

    pub fn is_text_extension(&self, ext: &str) -> bool {
        self.text_extensions.iter().any(|e| e == ext)
    }

    pub fn is_image_extension(&self, ext: &str) -> bool {
        self.image_extensions.iter().any(|e| e == ext)
    }

    /// Classify a path by its extension, or `None` when it is neither a
    /// configured text nor image type.
    pub fn file_kind(&self, path: &Path) -> Option<FileKind> {
        let ext = dot_extension(path);
        if self.is_text_extension(&ext) {
            Some(FileKind::Text)
        } else if self.is_image_extension(&ext) {
            Some(FileKind::Image)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.task_timeout, 300);
        assert_eq!(config.num_results, 30);
        assert!(config.skip_hidden_folders);
        assert!(!config.use_drive);
        assert!(config.is_text_extension(".md"));
        assert!(config.is_image_extension(".png"));
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path());
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
        // The default sync root is the screenshots folder under the data dir
        assert_eq!(config.sync_directories.len(), 1);
        assert!(config.sync_directories[0].contains(SCREENSHOT_DIR_NAME));
    }

    #[test]
    fn test_load_corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{not json").unwrap();
        let config = Config::load(dir.path());
        assert_eq!(config.batch_size, 16);
        // The broken file is left on disk for the operator to repair
        let on_disk = std::fs::read_to_string(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(on_disk, "{not json");
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"batch_size": 4, "some_future_option": true}"#,
        )
        .unwrap();
        let config = Config::load(dir.path());
        assert_eq!(config.batch_size, 4);
    }

    #[test]
    fn test_file_kind_classification() {
        let config = Config::default();
        assert_eq!(config.file_kind(Path::new("/a/notes.MD")), Some(FileKind::Text));
        assert_eq!(config.file_kind(Path::new("/a/photo.png")), Some(FileKind::Image));
        assert_eq!(config.file_kind(Path::new("/a/archive.zip")), None);
    }

    #[test]
    fn test_screenshot_dir_resolution() {
        let config = Config::default();
        let data_dir = Path::new("/data/recall");
        assert_eq!(
            config.screenshot_dir(data_dir),
            data_dir.join(SCREENSHOT_DIR_NAME)
        );

        let mut abs = Config::default();
        abs.screenshot_folder = "/captures".to_string();
        assert_eq!(abs.screenshot_dir(data_dir), PathBuf::from("/captures"));
    }
}
