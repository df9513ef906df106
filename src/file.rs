//! The file value type flowing through every pipeline stage.

use std::path::{Path, PathBuf};

/// Subdirectory that receives expanded archives.
pub const DECOMPRESSED_DIR: &str = "decompressed";

const FLATTEN_DELIMITER: char = '_';

/// Archive extensions the decompressor can expand in memory.
const SUPPORTED_ARCHIVES: [&str; 2] = [".gz", ".gzip"];

/// Destination layout policy, fixed for the whole run.
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
    /// Replace path separators with `_` in destination basenames.
    pub flatten: bool,
    /// Route archives through the decompressor.
    pub decompress: bool,
    /// Place each expansion under a directory named after its archive.
    pub with_dir_name: bool,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Layout {
            root: root.into(),
            flatten: false,
            decompress: false,
            with_dir_name: false,
        }
    }
}

/// A single unit of work: one remote object and, while it is in flight, its
/// in-memory body.
///
/// Entries come from the [`crate::pool::EntryPool`] and must be released to
/// it by whichever sink consumes them, on error paths included.
#[derive(Debug, Default)]
pub struct FileEntry {
    /// Remote key, never empty once assigned.
    pub key: String,
    /// Destination basename after layout policy.
    pub name: String,
    /// Destination directory under the mirror root.
    pub dir: PathBuf,
    /// Lowercased extension including the dot, empty when none.
    pub extension: String,
    /// ETag as reported by the store, quotes stripped.
    pub etag: String,
    pub size: i64,
    /// Small files take the in-memory download path.
    pub is_small: bool,
    /// Present only while the body is held in memory.
    pub body: Option<Vec<u8>>,
}

impl FileEntry {
    /// Fills the entry for a remote object and derives its destination.
    pub fn assign(&mut self, key: &str, size: i64, etag: &str, layout: &Layout) {
        self.key = key.to_string();
        self.extension = extension_of(key);
        self.etag = etag.trim_matches('"').to_string();
        self.size = size;
        let (dir, name) = save_path(key, self.is_archive(), layout);
        self.dir = dir;
        self.name = name;
    }

    /// Full destination path for the terminal write.
    pub fn dest_path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    /// Destination the object would get without decompression redirection.
    /// Used to persist the compressed original when archives are kept.
    pub fn plain_dest_path(&self, layout: &Layout) -> PathBuf {
        let plain = Layout {
            decompress: false,
            ..layout.clone()
        };
        let (dir, name) = save_path(&self.key, false, &plain);
        dir.join(name)
    }

    /// True when the decompressor can expand this entry.
    pub fn is_archive(&self) -> bool {
        SUPPORTED_ARCHIVES.contains(&self.extension.as_str())
    }

    /// Clears every field and hands back any held buffer.
    pub(crate) fn reset(&mut self) -> Option<Vec<u8>> {
        self.key.clear();
        self.name.clear();
        self.dir = PathBuf::new();
        self.extension.clear();
        self.etag.clear();
        self.size = 0;
        self.is_small = false;
        self.body.take()
    }
}

fn extension_of(key: &str) -> String {
    Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default()
}

/// Derives `(directory, basename)` for a key under the layout policy.
///
/// Flattening joins every key segment with `_`. Archives bound for the
/// decompressor land under `decompressed/` (plus a directory named after the
/// archive when configured) and lose their extension.
fn save_path(key: &str, is_archive: bool, layout: &Layout) -> (PathBuf, String) {
    let mut segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
    let mut name = segments.pop().unwrap_or_default().to_string();

    let mut dir = layout.root.clone();
    if layout.flatten {
        if !segments.is_empty() {
            let mut flat = segments.join(&FLATTEN_DELIMITER.to_string());
            flat.push(FLATTEN_DELIMITER);
            flat.push_str(&name);
            name = flat;
        }
    } else {
        for segment in &segments {
            dir.push(segment);
        }
    }

    if is_archive && layout.decompress {
        dir.push(DECOMPRESSED_DIR);
        if layout.with_dir_name {
            dir.push(&name);
        }
        if let Some(stem) = name.rfind('.') {
            name.truncate(stem);
        }
    }

    (dir, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_for(key: &str, layout: &Layout) -> FileEntry {
        let mut entry = FileEntry::default();
        entry.assign(key, 10, "\"abc123\"", layout);
        entry
    }

    #[test]
    fn assign_trims_etag_quotes_and_lowercases_extension() {
        let layout = Layout::new("/tmp/m");
        let entry = entry_for("logs/FILE.GZ", &layout);
        assert_eq!(entry.etag, "abc123");
        assert_eq!(entry.extension, ".gz");
    }

    #[test]
    fn nested_key_keeps_its_directories() {
        let layout = Layout::new("/tmp/m");
        let entry = entry_for("logs/2024/file.csv", &layout);
        assert_eq!(entry.dir, PathBuf::from("/tmp/m/logs/2024"));
        assert_eq!(entry.name, "file.csv");
        assert_eq!(entry.dest_path(), PathBuf::from("/tmp/m/logs/2024/file.csv"));
    }

    #[test]
    fn flatten_joins_segments_with_underscores() {
        let layout = Layout {
            flatten: true,
            ..Layout::new("/tmp/m")
        };
        let entry = entry_for("logs/2024/file.csv", &layout);
        assert_eq!(entry.dir, PathBuf::from("/tmp/m"));
        assert_eq!(entry.name, "logs_2024_file.csv");
    }

    #[test]
    fn archive_bound_for_decompression_moves_and_loses_extension() {
        let layout = Layout {
            decompress: true,
            ..Layout::new("/tmp/m")
        };
        let entry = entry_for("logs/dump.gz", &layout);
        assert_eq!(entry.dir, PathBuf::from("/tmp/m/logs/decompressed"));
        assert_eq!(entry.name, "dump");
    }

    #[test]
    fn with_dir_name_adds_the_archive_directory() {
        let layout = Layout {
            decompress: true,
            with_dir_name: true,
            flatten: true,
            ..Layout::new("/tmp/m")
        };
        let entry = entry_for("a/b/dump.gz", &layout);
        assert_eq!(
            entry.dir,
            PathBuf::from("/tmp/m/decompressed/a_b_dump.gz")
        );
        assert_eq!(entry.name, "a_b_dump");
    }

    #[test]
    fn plain_dest_ignores_decompression_redirect() {
        let layout = Layout {
            decompress: true,
            ..Layout::new("/tmp/m")
        };
        let entry = entry_for("logs/dump.gz", &layout);
        assert_eq!(
            entry.plain_dest_path(&layout),
            PathBuf::from("/tmp/m/logs/dump.gz")
        );
    }

    #[test]
    fn only_gzip_extensions_classify_as_archives() {
        let layout = Layout::new("/tmp/m");
        assert!(entry_for("a.gz", &layout).is_archive());
        assert!(entry_for("a.gzip", &layout).is_archive());
        assert!(entry_for("a.GZ", &layout).is_archive());
        assert!(!entry_for("a.zip", &layout).is_archive());
        assert!(!entry_for("a.tar", &layout).is_archive());
        assert!(!entry_for("a.csv", &layout).is_archive());
        assert!(!entry_for("plain", &layout).is_archive());
    }

    #[test]
    fn archives_without_decompression_stay_in_place() {
        let layout = Layout::new("/tmp/m");
        let entry = entry_for("logs/dump.gz", &layout);
        assert_eq!(entry.dest_path(), PathBuf::from("/tmp/m/logs/dump.gz"));
    }

    #[test]
    fn reset_clears_fields_and_returns_the_buffer() {
        let layout = Layout::new("/tmp/m");
        let mut entry = entry_for("a/b.gz", &layout);
        entry.body = Some(vec![1, 2, 3]);
        let buffer = entry.reset();
        assert_eq!(buffer, Some(vec![1, 2, 3]));
        assert!(entry.key.is_empty() && entry.name.is_empty());
        assert_eq!(entry.size, 0);
        assert!(entry.body.is_none());
    }
}
