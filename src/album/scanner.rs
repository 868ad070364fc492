//! Filesystem scanning of the worlds directory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};
use walkdir::WalkDir;

/// A source image found during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub abs_path: PathBuf,
    pub file_name: String,
}

/// `{world id -> {relative path -> source image}}`
pub type WorldFiles = BTreeMap<String, BTreeMap<String, SourceImage>>;

/// Output of a single scan.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub files: WorldFiles,
    pub ctimes: HashMap<String, f64>,
}

impl ScanResult {
    pub fn world_ids(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }
}

/// Walks the worlds directory and collects image files per world.
#[derive(Debug, Clone)]
pub struct FilesystemScanner {
    worlds_dir: PathBuf,
    static_root: PathBuf,
    extensions: HashSet<String>,
}

impl FilesystemScanner {
    pub fn new(
        worlds_dir: impl Into<PathBuf>,
        static_root: impl Into<PathBuf>,
        extensions: &[String],
    ) -> Self {
        Self {
            worlds_dir: worlds_dir.into(),
            static_root: static_root.into(),
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn static_root(&self) -> &Path {
        &self.static_root
    }

    pub fn is_image_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// Scan once. A missing worlds directory yields an empty result.
    pub fn scan(&self) -> ScanResult {
        let mut result = ScanResult::default();

        let entries = match fs::read_dir(&self.worlds_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.worlds_dir.display(), error = %e, "Worlds directory unavailable");
                return result;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable worlds directory entry");
                    continue;
                }
            };
            // Follows symlinks, unlike `DirEntry::file_type`.
            if !fs::metadata(entry.path()).map(|meta| meta.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(world_id) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %entry.path().display(), "Skipping world directory with non UTF-8 name");
                continue;
            };

            let world_path = entry.path();
            result.ctimes.insert(world_id.clone(), creation_time(&world_path));
            result.files.insert(world_id, self.scan_world(&world_path));
        }

        debug!(worlds = result.files.len(), "Scan complete");
        result
    }

    fn scan_world(&self, world_path: &Path) -> BTreeMap<String, SourceImage> {
        let mut images = BTreeMap::new();

        for entry in WalkDir::new(world_path).follow_links(true).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(world = %world_path.display(), error = %e, "Error accessing path during scan");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.is_image_file(entry.path()) {
                continue;
            }

            let abs_path = entry.path().to_path_buf();
            let file_name = entry.file_name().to_string_lossy().to_string();
            let rel = relative_to(&abs_path, &self.static_root);
            images.insert(rel, SourceImage { abs_path, file_name });
        }

        images
    }
}

/// Directory creation time in seconds since the epoch, 0.0 when unreadable.
pub fn creation_time(path: &Path) -> f64 {
    fs::metadata(path)
        .and_then(|meta| meta.created().or_else(|_| meta.modified()))
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// `path` relative to `root`, joined with `/`. Paths outside `root` keep
/// their own components.
pub fn relative_to(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
