//! Low-quality chunk filter.
//!
//! Embedding garbage wastes model time and pollutes search results, so
//! chunks are screened before they reach the embedder: too short, too
//! space-starved (URLs, hashes, minified dumps), too many non-printable
//! characters, or a compression ratio that marks the text as either
//! degenerate repetition or high-entropy noise.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

/// Minimum chunk length worth keeping
const MIN_LEN: usize = 25;

/// Real prose is at least this fraction spaces
const MIN_SPACE_RATIO: f64 = 0.05;

/// Tolerated fraction of characters outside printable ASCII
const NON_STANDARD_THRESHOLD: f64 = 0.05;

/// Below this compression ratio the text is degenerate repetition
const LOW_COMPRESSION_THRESHOLD: f64 = 0.1;

/// Above this ratio (for inputs > 100 bytes) the text is random noise
const HIGH_COMPRESSION_THRESHOLD: f64 = 0.9;

/// Returns true when the text is low quality and should not be indexed.
pub fn is_gibberish(text: &str) -> bool {
    if text.len() < MIN_LEN {
        return true;
    }

    // Whitespace check: if spaces make up less than 5% of the text, it's
    // likely a URL, hash, or minified dump
    let spaces = text.chars().filter(|c| *c == ' ').count();
    if (spaces as f64) / (text.chars().count() as f64) < MIN_SPACE_RATIO {
        return true;
    }

    // Non-standard character check
    let total = text.chars().count();
    let non_standard = text
        .chars()
        .filter(|c| !(c.is_ascii_graphic() || c.is_ascii_whitespace()))
        .count();
    if (non_standard as f64) / (total as f64) > NON_STANDARD_THRESHOLD {
        return true;
    }

    // Compression check
    let bytes = text.as_bytes();
    if let Some(compressed_len) = zlib_compressed_len(bytes) {
        let ratio = compressed_len as f64 / bytes.len() as f64;
        // Too repetitive (e.g. "..............")
        if ratio < LOW_COMPRESSION_THRESHOLD {
            return true;
        }
        // Too random (e.g. encrypted strings or high-entropy garbage)
        if bytes.len() > 100 && ratio > HIGH_COMPRESSION_THRESHOLD {
            return true;
        }
    }

    false
}

fn zlib_compressed_len(bytes: &[u8]) -> Option<usize> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(bytes).ok()?;
    encoder.finish().ok().map(|v| v.len())
}
