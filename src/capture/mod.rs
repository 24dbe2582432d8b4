//! Screen capturer.
//!
//! A background loop captures the monitor under the cursor at a configured
//! interval. Frames are deduplicated by comparing 50×50 grayscale
//! thumbnails: only frames whose mean per-pixel difference from the last
//! persisted frame exceeds a small threshold are written. The capturer
//! exposes the same `load`/`unload`/`loaded` surface as a model backend,
//! so the orchestrator's availability story stays uniform — and because
//! the output folder is usually a watched root, fresh captures flow into
//! the index like any other file.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbaImage};
use mouse_position::mouse_position::Mouse;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use xcap::Monitor;

use crate::config::Config;
use crate::constants::{CAPTURE_CLEANUP_INTERVAL_SECS, CAPTURE_DIFF_THRESHOLD};
use crate::error::{RecallError, Result};
use crate::models::{Backend, Capabilities};

/// Thumbnail edge used for frame similarity.
const THUMB_SIZE: u32 = 50;

/// JPEG quality for persisted frames.
const JPEG_QUALITY: u8 = 60;

/// Periodic active-monitor captures with similarity dedup and retention
/// cleanup.
pub struct ScreenCapturer {
    config: Arc<Config>,
    output_dir: PathBuf,
    running: AtomicBool,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    last_thumb: Mutex<Option<GrayImage>>,
    last_cleanup: Mutex<Option<Instant>>,
    weak: Weak<ScreenCapturer>,
}

impl ScreenCapturer {
    pub fn new(config: Arc<Config>, data_dir: &Path) -> Arc<Self> {
        let output_dir = config.screenshot_dir(data_dir);
        Arc::new_cyclic(|weak| Self {
            config,
            output_dir,
            running: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            last_thumb: Mutex::new(None),
            last_cleanup: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    fn capture_loop(&self) {
        info!("Screen capturer running, saving to {:?}", self.output_dir);
        while !self.stop.load(Ordering::SeqCst) {
            if let Err(e) = self.take_screenshot() {
                error!("Screenshot failed: {e}");
                // Back off so a broken display stack does not spin the loop
                self.interruptible_sleep(Duration::from_secs(5));
                continue;
            }
            self.cleanup_old_screenshots();
            self.interruptible_sleep(Duration::from_secs(self.config.screenshot_interval.max(1)));
        }
        debug!("Capture loop exited");
    }

    /// Sleep in 1 s slices so unload never waits a full interval.
    fn interruptible_sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline && !self.stop.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1).min(deadline - Instant::now()));
        }
    }

    /// Capture the active display and persist it when it differs enough
    /// from the previously persisted frame.
    fn take_screenshot(&self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| RecallError::io(&self.output_dir, format!("create failed: {e}")))?;

        let monitor = active_monitor()?;
        let frame = monitor
            .capture_image()
            .map_err(|e| RecallError::backend(format!("capture failed: {e}")))?;

        if !self.should_save(&frame) {
            return Ok(());
        }

        let filename = format!("{}.jpg", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
        let path = self.output_dir.join(filename);
        let file = std::fs::File::create(&path)
            .map_err(|e| RecallError::io(&path, format!("create failed: {e}")))?;
        let writer = std::io::BufWriter::new(file);
        let encoder = JpegEncoder::new_with_quality(writer, JPEG_QUALITY);
        DynamicImage::ImageRgba8(frame)
            .to_rgb8()
            .write_with_encoder(encoder)
            .map_err(|e| RecallError::io(&path, format!("encode failed: {e}")))?;

        info!("Saved screenshot {:?}", path);
        Ok(())
    }

    /// Compare against the last persisted frame; the reference thumbnail is
    /// only advanced when the frame is actually kept.
    fn should_save(&self, frame: &RgbaImage) -> bool {
        let thumb = thumbnail_of(frame);
        let mut last = self.last_thumb.lock().unwrap_or_else(|p| p.into_inner());

        let keep = match last.as_ref() {
            None => true,
            Some(previous) => mean_diff(previous, &thumb) > CAPTURE_DIFF_THRESHOLD,
        };
        if keep {
            *last = Some(thumb);
        }
        keep
    }

    /// Delete captures older than the configured retention, at most once
    /// per hour.
    fn cleanup_old_screenshots(&self) {
        let days = self.config.delete_screenshots_after;
        if days == 0 {
            return;
        }

        {
            let mut last = self.last_cleanup.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(at) = *last {
                if at.elapsed() < Duration::from_secs(CAPTURE_CLEANUP_INTERVAL_SECS) {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        if let Err(e) = prune_older_than(&self.output_dir, Duration::from_secs(days * 86_400)) {
            error!("Screenshot cleanup failed: {e}");
        }
    }
}

impl Backend for ScreenCapturer {
    fn load(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return true;
        }
        info!("Starting screen capturer...");
        self.stop.store(false, Ordering::SeqCst);

        let capturer = self.weak.upgrade().expect("capturer is alive");
        let handle = std::thread::Builder::new()
            .name("screen-capture".to_string())
            .spawn(move || capturer.capture_loop());
        match handle {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
                true
            }
            Err(e) => {
                error!("Could not spawn capture thread: {e}");
                self.running.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    fn unload(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping screen capturer...");
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take() {
            if handle.join().is_err() {
                warn!("Capture thread panicked during shutdown");
            }
        }
    }

    fn loaded(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn model_name(&self) -> String {
        "screenshotter".to_string()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}

/// The monitor containing the cursor, falling back to the first monitor
/// when the cursor position is unavailable (headless or locked sessions).
fn active_monitor() -> Result<Monitor> {
    if let Mouse::Position { x, y } = Mouse::get_mouse_position() {
        if let Ok(monitor) = Monitor::from_point(x, y) {
            return Ok(monitor);
        }
    }
    Monitor::all()
        .map_err(|e| RecallError::backend(format!("monitor enumeration failed: {e}")))?
        .into_iter()
        .next()
        .ok_or_else(|| RecallError::backend("no monitors available"))
}

/// Downsample to a 50×50 grayscale fingerprint.
fn thumbnail_of(frame: &RgbaImage) -> GrayImage {
    image::imageops::grayscale(&image::imageops::resize(
        frame,
        THUMB_SIZE,
        THUMB_SIZE,
        FilterType::Nearest,
    ))
}

/// Mean absolute per-pixel difference between two equally sized grayscale
/// images, in 0-255 units.
fn mean_diff(a: &GrayImage, b: &GrayImage) -> f64 {
    let total: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| (pa.0[0] as i16 - pb.0[0] as i16).unsigned_abs() as u64)
        .sum();
    total as f64 / (a.width() * a.height()) as f64
}

/// Remove plain files in `dir` whose mtime is older than `retention` ago.
fn prune_older_than(dir: &Path, retention: Duration) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let cutoff = std::time::SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(std::time::UNIX_EPOCH);

    for entry in std::fs::read_dir(dir).map_err(|e| RecallError::io(dir, e.to_string()))? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else { continue };
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else { continue };
        if modified < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => info!("Deleted old screenshot {:?}", path),
                Err(e) => warn!("Could not delete {:?}: {e}", path),
            }
        }
    }
    Ok(())
}
