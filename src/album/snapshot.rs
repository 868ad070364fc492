//! Snapshot diffing between consecutive scans.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::album::json_store::{load_json, save_json};
use crate::album::scanner::{SourceImage, WorldFiles};

/// `{world id -> relative image paths}` as persisted between runs.
pub type Snapshot = BTreeMap<String, BTreeSet<String>>;

/// Changes between the previous snapshot and the current scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added_worlds: BTreeSet<String>,
    pub removed_worlds: BTreeSet<String>,
    pub added_images: BTreeMap<String, BTreeMap<String, SourceImage>>,
    pub removed_images: BTreeMap<String, BTreeSet<String>>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added_worlds.is_empty()
            && self.removed_worlds.is_empty()
            && self.added_images.is_empty()
            && self.removed_images.is_empty()
    }

    pub fn added_image_count(&self) -> usize {
        self.added_images.values().map(BTreeMap::len).sum()
    }

    pub fn removed_image_count(&self) -> usize {
        self.removed_images.values().map(BTreeSet::len).sum()
    }
}

/// Holds the last completed scan and diffs new scans against it.
pub struct SnapshotDiffer {
    path: PathBuf,
    previous: Mutex<Snapshot>,
}

impl SnapshotDiffer {
    /// Load the persisted snapshot; a corrupt file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let previous: Snapshot = load_json(&path);
        debug!(worlds = previous.len(), "Loaded scan snapshot");
        Self {
            path,
            previous: Mutex::new(previous),
        }
    }

    pub fn previous(&self) -> Snapshot {
        self.previous.lock().clone()
    }

    /// Diff `current` against the previous snapshot and make it the new baseline.
    pub fn diff(&self, current: &WorldFiles) -> SnapshotDiff {
        let current_sets: Snapshot = current
            .iter()
            .map(|(world_id, files)| (world_id.clone(), files.keys().cloned().collect()))
            .collect();

        let mut previous = self.previous.lock();
        let diff = compute_diff(&previous, &current_sets, current);
        *previous = current_sets;

        if let Err(e) = save_json(&self.path, &*previous) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist scan snapshot");
        }

        diff
    }
}

fn compute_diff(previous: &Snapshot, current_sets: &Snapshot, current: &WorldFiles) -> SnapshotDiff {
    let mut diff = SnapshotDiff::default();

    for (world_id, paths) in current_sets {
        match previous.get(world_id) {
            None => {
                diff.added_worlds.insert(world_id.clone());
                if !paths.is_empty() {
                    diff.added_images.insert(world_id.clone(), current[world_id].clone());
                }
            }
            Some(prev_paths) => {
                let added: BTreeMap<_, _> = paths
                    .difference(prev_paths)
                    .map(|rel| (rel.clone(), current[world_id][rel].clone()))
                    .collect();
                let removed: BTreeSet<_> = prev_paths.difference(paths).cloned().collect();
                if !added.is_empty() {
                    diff.added_images.insert(world_id.clone(), added);
                }
                if !removed.is_empty() {
                    diff.removed_images.insert(world_id.clone(), removed);
                }
            }
        }
    }

    for (world_id, prev_paths) in previous {
        if current_sets.contains_key(world_id) {
            continue;
        }
        diff.removed_worlds.insert(world_id.clone());
        if !prev_paths.is_empty() {
            diff.removed_images.insert(world_id.clone(), prev_paths.clone());
        }
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn world(paths: &[&str]) -> BTreeMap<String, SourceImage> {
        paths
            .iter()
            .map(|rel| {
                let name = rel.rsplit('/').next().unwrap_or(rel).to_string();
                (
                    rel.to_string(),
                    SourceImage {
                        abs_path: PathBuf::from("/static").join(rel),
                        file_name: name,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn first_scan_reports_everything_added() {
        let dir = tempdir().unwrap();
        let differ = SnapshotDiffer::load(dir.path().join("snapshot.json"));

        let mut current = WorldFiles::new();
        current.insert("a".into(), world(&["worlds/a/1.png", "worlds/a/2.png"]));
        current.insert("empty".into(), world(&[]));

        let diff = differ.diff(&current);
        assert_eq!(diff.added_worlds.len(), 2);
        assert_eq!(diff.added_image_count(), 2);
        assert!(!diff.added_images.contains_key("empty"));
        assert!(diff.removed_worlds.is_empty());
    }

    #[test]
    fn reports_image_and_world_changes() {
        let dir = tempdir().unwrap();
        let differ = SnapshotDiffer::load(dir.path().join("snapshot.json"));

        let mut first = WorldFiles::new();
        first.insert("a".into(), world(&["worlds/a/1.png", "worlds/a/2.png"]));
        first.insert("b".into(), world(&["worlds/b/1.png"]));
        differ.diff(&first);

        let mut second = WorldFiles::new();
        second.insert("a".into(), world(&["worlds/a/2.png", "worlds/a/3.png"]));
        second.insert("c".into(), world(&["worlds/c/1.png"]));
        let diff = differ.diff(&second);

        assert_eq!(diff.added_worlds, BTreeSet::from(["c".to_string()]));
        assert_eq!(diff.removed_worlds, BTreeSet::from(["b".to_string()]));
        assert_eq!(
            diff.added_images["a"].keys().cloned().collect::<Vec<_>>(),
            vec!["worlds/a/3.png"]
        );
        assert!(diff.added_images.contains_key("c"));
        assert_eq!(diff.removed_images["a"], BTreeSet::from(["worlds/a/1.png".to_string()]));
        assert_eq!(diff.removed_images["b"], BTreeSet::from(["worlds/b/1.png".to_string()]));
    }

    #[test]
    fn unchanged_scan_is_empty_diff() {
        let dir = tempdir().unwrap();
        let differ = SnapshotDiffer::load(dir.path().join("snapshot.json"));
        let mut current = WorldFiles::new();
        current.insert("a".into(), world(&["worlds/a/1.png"]));

        differ.diff(&current);
        assert!(differ.diff(&current).is_empty());
    }

    #[test]
    fn snapshot_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let mut current = WorldFiles::new();
        current.insert("a".into(), world(&["worlds/a/1.png"]));

        SnapshotDiffer::load(&path).diff(&current);
        let restarted = SnapshotDiffer::load(&path);
        assert!(restarted.diff(&current).is_empty());
    }

    #[test]
    fn corrupt_snapshot_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        fs::write(&path, "{\"a\": [").unwrap();

        let differ = SnapshotDiffer::load(&path);
        assert!(differ.previous().is_empty());
    }
}
