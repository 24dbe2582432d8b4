//! Utility functions and helpers shared across the codebase.

use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::{RecallError, Result};

/// Normalize a file path for consistent store keys.
///
/// On Windows, `Path::canonicalize()` and some APIs add a UNC extended-length
/// prefix (`\\?\C:\...`) while notify events use standard paths (`C:\...`).
/// This strips the UNC prefix and converts backslashes to forward slashes so
/// that paths from the walker, the watcher, and the store all compare equal.
pub fn normalize_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    s.trim_start_matches(r"\\?\").replace('\\', "/")
}

/// Normalize a path string (same logic as `normalize_path` but for `&str` input).
pub fn normalize_path_str(path: &str) -> String {
    path.trim_start_matches(r"\\?\").replace('\\', "/")
}

/// File modification time as floating-point seconds since the epoch.
///
/// Sub-second precision matters: the watcher suppresses read-back events by
/// comparing mtimes with a 0.1s threshold.
pub fn file_mtime(path: &Path) -> Result<f64> {
    let meta = std::fs::metadata(path)
        .map_err(|e| RecallError::io(path, format!("stat failed: {e}")))?;
    let modified = meta
        .modified()
        .map_err(|e| RecallError::io(path, format!("mtime unavailable: {e}")))?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0))
}

/// Lowercased extension with leading dot (`".md"`), or empty string.
pub fn dot_extension(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// Encode a vector as little-endian 32-bit floats.
///
/// This is the on-disk blob format of the `embeddings` table; length is
/// always 4 × the embedding dimension of the row's model.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Decode a little-endian f32 blob back into a vector.
///
/// Trailing bytes that do not form a whole float are ignored; a malformed
/// blob therefore yields a shorter vector rather than an error, and the
/// similarity computation will skip it on dimension mismatch.
pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// L2-normalize in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Dot product. Returns 0.0 on dimension mismatch so vectors written by a
/// different model can never poison a ranking.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Quote raw user input into an FTS5 match expression.
///
/// Each whitespace token is double-quoted (neutralizing `*`, `-`, `:` and
/// other FTS metacharacters); bare `NOT` is passed through so exclusion
/// still works. Tokens are implicitly ANDed by FTS5.
pub fn fts_match_expression(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| {
            if token == "NOT" {
                token.to_string()
            } else {
                format!("\"{}\"", token.replace('"', "\"\""))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
