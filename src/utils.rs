//! Shared filter and formatting helpers.

use std::path::Path;
use std::time::Duration;

use crate::config::{KIB, MIB};

const GIB: i64 = 1 << 30;
const TIB: i64 = 1 << 40;

/// Creates `path` and any missing parents.
pub fn create_path(path: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Extension filter. An empty list matches everything; otherwise the file
/// extension (with or without the leading dot) must equal a listed token.
pub fn has_valid_extension(name: &str, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let ext = match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some(e) => e,
        None => return false,
    };
    extensions
        .iter()
        .any(|t| t.strip_prefix('.').unwrap_or(t).eq_ignore_ascii_case(ext))
}

/// Case-insensitive substring match on the name.
pub fn has_valid_name(name: &str, name_mask: &str) -> bool {
    if name_mask.is_empty() {
        return true;
    }
    name.to_lowercase().contains(&name_mask.to_lowercase())
}

/// Inclusive size bounds; a zero bound is unbounded on that side.
pub fn has_valid_size(size: i64, min_size: i64, max_size: i64) -> bool {
    (min_size == 0 || size >= min_size) && (max_size == 0 || size <= max_size)
}

/// Canonical comparison name for a remote key: lowercase, separators
/// flattened to `_`. Local fingerprints use the same canonicalization so a
/// nested mirror and a flattened one both diff correctly.
pub fn canonical_name(key: &str) -> String {
    key.to_lowercase().replace(['/', '\\'], "_")
}

/// Human-readable byte count, e.g. `1.5 GB`.
pub fn format_bytes(bytes: i64) -> String {
    let b = bytes as f64;
    match bytes {
        n if n >= TIB => format!("{:.2} TB", b / TIB as f64),
        n if n >= GIB => format!("{:.1} GB", b / GIB as f64),
        n if n >= MIB => format!("{:.0} MB", b / MIB as f64),
        n if n >= KIB => format!("{:.0} KB", b / KIB as f64),
        _ => format!("{:.0} B", b),
    }
}

/// `mm:ss`-style rendering for ETA output, hours only when needed.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
