//! Image derivative cache.
//!
//! Records are keyed by world and serialized per world: each world has its own
//! lock, taken for the snapshot and merge steps but never while encoding. The
//! map itself sits behind a short-held global lock. Merges only fill fields
//! that are still missing, so a concurrent writer's work is never overwritten.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::album::image_builder::DerivativeBuilder;
use crate::album::json_store::{load_json, save_json};
use crate::album::scanner::{ScanResult, SourceImage, relative_to};
use crate::album::snapshot::SnapshotDiff;
use crate::album::sorted_index::SortedIndex;

/// Derivative metadata for one source image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
}

impl ImageRecord {
    /// Copy over every field of `other` that is unset here.
    fn fill_missing(&mut self, other: &ImageRecord) -> bool {
        let mut changed = false;
        if self.width.is_none() && self.height.is_none() && other.width.is_some() {
            self.width = other.width;
            self.height = other.height;
            changed = true;
        }
        if self.thumb.is_none() && other.thumb.is_some() {
            self.thumb = other.thumb.clone();
            changed = true;
        }
        if self.view.is_none() && other.view.is_some() {
            self.view = other.view.clone();
            changed = true;
        }
        changed
    }
}

/// Persisted and listed form of one world's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldImages {
    pub world_id: String,
    pub images: Vec<ImageRecord>,
}

/// Which derivative a build concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derivative {
    Thumbnail,
    Full,
}

impl fmt::Display for Derivative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Derivative::Thumbnail => write!(f, "thumbnail"),
            Derivative::Full => write!(f, "full"),
        }
    }
}

/// A single derivative that could not be built this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFailure {
    pub world_id: String,
    pub path: String,
    pub derivative: Derivative,
    pub error: String,
}

/// What one application of changes did to the cache.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub changed: bool,
    pub thumbnails_built: usize,
    pub full_built: usize,
    pub records_added: usize,
    pub records_removed: usize,
    pub worlds_removed: usize,
    pub failures: Vec<BuildFailure>,
}

impl ApplyReport {
    fn absorb(&mut self, other: ApplyReport) {
        self.changed |= other.changed;
        self.thumbnails_built += other.thumbnails_built;
        self.full_built += other.full_built;
        self.records_added += other.records_added;
        self.records_removed += other.records_removed;
        self.worlds_removed += other.worlds_removed;
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub worlds: usize,
    pub images: usize,
}

/// Where derivatives for a source image live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivativeTargets {
    pub thumb_abs: PathBuf,
    pub thumb_rel: String,
    pub view_abs: PathBuf,
    pub view_rel: String,
}

/// Maps source images to derivative paths under the static root.
#[derive(Debug, Clone)]
pub struct DerivativeLayout {
    static_root: PathBuf,
    worlds_rel: String,
    thumb_dir: PathBuf,
    view_dir: PathBuf,
}

impl DerivativeLayout {
    pub fn new(
        static_root: impl Into<PathBuf>,
        worlds_dir: &Path,
        thumb_dir: impl Into<PathBuf>,
        view_dir: impl Into<PathBuf>,
    ) -> Self {
        let static_root = static_root.into();
        Self {
            worlds_rel: relative_to(worlds_dir, &static_root),
            static_root,
            thumb_dir: thumb_dir.into(),
            view_dir: view_dir.into(),
        }
    }

    pub fn thumb_world_dir(&self, world_id: &str) -> PathBuf {
        self.thumb_dir.join(world_id)
    }

    pub fn view_world_dir(&self, world_id: &str) -> PathBuf {
        self.view_dir.join(world_id)
    }

    pub fn absolute(&self, rel: &str) -> PathBuf {
        rel.split('/').fold(self.static_root.clone(), |acc, part| acc.join(part))
    }

    /// Derivatives mirror the source's location inside its world directory.
    pub fn targets(&self, world_id: &str, rel_src: &str) -> DerivativeTargets {
        let world_prefix = if self.worlds_rel.is_empty() {
            format!("{}/", world_id)
        } else {
            format!("{}/{}/", self.worlds_rel, world_id)
        };
        let inner = rel_src
            .strip_prefix(&world_prefix)
            .unwrap_or_else(|| rel_src.rsplit('/').next().unwrap_or(rel_src));

        let mut inner_path: PathBuf = inner.split('/').collect();
        inner_path.set_extension("jpg");

        let thumb_abs = self.thumb_world_dir(world_id).join(&inner_path);
        let view_abs = self.view_world_dir(world_id).join(&inner_path);
        DerivativeTargets {
            thumb_rel: relative_to(&thumb_abs, &self.static_root),
            view_rel: relative_to(&view_abs, &self.static_root),
            thumb_abs,
            view_abs,
        }
    }
}

struct WorkItem {
    rel: String,
    src: PathBuf,
    existing: Option<ImageRecord>,
    targets: DerivativeTargets,
}

#[derive(Default)]
struct BuildOutcome {
    record: Option<ImageRecord>,
    is_new: bool,
    thumbnails_built: usize,
    full_built: usize,
    failures: Vec<BuildFailure>,
}

fn needs_work(record: &ImageRecord, targets: &DerivativeTargets) -> bool {
    record.width.is_none()
        || record.thumb.is_none()
        || record.view.is_none()
        || !targets.thumb_abs.exists()
        || !targets.view_abs.exists()
}

/// Cache of derivative records for every scanned world.
pub struct ImageCache {
    layout: DerivativeLayout,
    builder: DerivativeBuilder,
    index: Arc<SortedIndex>,
    cache_file: PathBuf,
    /// Per-world lock guarding that world's removal generation.
    world_locks: DashMap<String, Arc<Mutex<u64>>>,
    records: RwLock<BTreeMap<String, Vec<ImageRecord>>>,
    persist_lock: Mutex<()>,
}

impl ImageCache {
    /// Create a cache backed by `cache_file`, loading whatever it holds.
    pub fn load(
        layout: DerivativeLayout,
        builder: DerivativeBuilder,
        index: Arc<SortedIndex>,
        cache_file: impl Into<PathBuf>,
    ) -> Self {
        let cache = Self {
            layout,
            builder,
            index,
            cache_file: cache_file.into(),
            world_locks: DashMap::new(),
            records: RwLock::new(BTreeMap::new()),
            persist_lock: Mutex::new(()),
        };
        cache.reload();
        cache
    }

    /// Replace in-memory state with the contents of the cache file.
    pub fn reload(&self) {
        let persisted: Vec<WorldImages> = load_json(&self.cache_file);
        let mapping: BTreeMap<String, Vec<ImageRecord>> = persisted
            .into_iter()
            .map(|world| (world.world_id, world.images))
            .collect();
        info!(worlds = mapping.len(), "Loaded image cache");
        *self.records.write() = mapping;
    }

    pub fn layout(&self) -> &DerivativeLayout {
        &self.layout
    }

    fn world_lock(&self, world_id: &str) -> Arc<Mutex<u64>> {
        Arc::clone(&*self.world_locks.entry(world_id.to_string()).or_default())
    }

    /// Apply one scan's changes, backfill anything missing, then rebuild the index.
    pub fn apply_diff(&self, scan: &ScanResult, diff: &SnapshotDiff) -> ApplyReport {
        let mut report = ApplyReport::default();

        for world_id in &diff.removed_worlds {
            report.absorb(self.remove_world(world_id));
        }

        for (world_id, added) in &diff.added_images {
            report.absorb(self.add_images(world_id, added));
        }
        // Images that just failed wait for the next tick instead of a second attempt now.
        let failed: HashSet<(String, String)> = report
            .failures
            .iter()
            .map(|failure| (failure.world_id.clone(), failure.path.clone()))
            .collect();

        for (world_id, removed) in &diff.removed_images {
            if diff.removed_worlds.contains(world_id) {
                continue;
            }
            report.absorb(self.remove_images(world_id, removed));
        }

        report.absorb(self.backfill_except(scan, &failed));

        self.index.update(scan.world_ids(), &scan.ctimes);

        if report.changed {
            if let Err(e) = self.persist() {
                warn!(error = %e, "Failed to persist image cache");
            }
        }

        report
    }

    /// Repair every image in `scan` and drop records the scan no longer has.
    pub fn backfill(&self, scan: &ScanResult) -> ApplyReport {
        self.backfill_except(scan, &HashSet::new())
    }

    fn backfill_except(&self, scan: &ScanResult, skip: &HashSet<(String, String)>) -> ApplyReport {
        let mut report = ApplyReport::default();

        for (world_id, files) in &scan.files {
            let pending: BTreeMap<String, SourceImage> = files
                .iter()
                .filter(|(rel, _)| !skip.contains(&(world_id.clone(), (*rel).clone())))
                .map(|(rel, source)| (rel.clone(), source.clone()))
                .collect();
            report.absorb(self.add_images(world_id, &pending));
        }

        let cached = self.records.read().clone();
        for (world_id, records) in cached {
            match scan.files.get(&world_id) {
                None => report.absorb(self.remove_world(&world_id)),
                Some(files) => {
                    let stale: BTreeSet<String> = records
                        .into_iter()
                        .map(|record| record.path)
                        .filter(|path| !files.contains_key(path))
                        .collect();
                    if !stale.is_empty() {
                        report.absorb(self.remove_images(&world_id, &stale));
                    }
                }
            }
        }

        report
    }

    /// Build or repair derivatives for `images`, then merge into the latest records.
    pub fn add_images(&self, world_id: &str, images: &BTreeMap<String, SourceImage>) -> ApplyReport {
        let lock = self.world_lock(world_id);
        let (work, generation) = self.plan(world_id, images, &lock);
        if work.is_empty() {
            return ApplyReport::default();
        }

        debug!(world_id, images = work.len(), "Building derivatives");
        let outcomes: Vec<BuildOutcome> = work
            .par_iter()
            .map(|item| self.build(world_id, item))
            .collect();

        self.merge(world_id, outcomes, generation, &lock)
    }

    fn plan(
        &self,
        world_id: &str,
        images: &BTreeMap<String, SourceImage>,
        lock: &Mutex<u64>,
    ) -> (Vec<WorkItem>, u64) {
        let (snapshot, generation): (HashMap<String, ImageRecord>, u64) = {
            let generation = lock.lock();
            let snapshot = self
                .records
                .read()
                .get(world_id)
                .map(|records| records.iter().map(|r| (r.path.clone(), r.clone())).collect())
                .unwrap_or_default();
            (snapshot, *generation)
        };

        let work = images
            .iter()
            .filter_map(|(rel, source)| {
                let targets = self.layout.targets(world_id, rel);
                let existing = snapshot.get(rel).cloned();
                if let Some(record) = &existing {
                    if !needs_work(record, &targets) {
                        return None;
                    }
                }
                Some(WorkItem {
                    rel: rel.clone(),
                    src: source.abs_path.clone(),
                    existing,
                    targets,
                })
            })
            .collect();
        (work, generation)
    }

    fn build(&self, world_id: &str, item: &WorkItem) -> BuildOutcome {
        let mut outcome = BuildOutcome::default();
        let failure = |derivative: Derivative, error: String| BuildFailure {
            world_id: world_id.to_string(),
            path: item.rel.clone(),
            derivative,
            error,
        };

        let mut record = item.existing.clone().unwrap_or_else(|| ImageRecord {
            path: item.rel.clone(),
            ..ImageRecord::default()
        });
        outcome.is_new = item.existing.is_none();

        let thumb_missing = !item.targets.thumb_abs.exists();
        if thumb_missing || record.width.is_none() {
            match self.builder.build_thumbnail(&item.src, &item.targets.thumb_abs) {
                Ok((width, height)) => {
                    outcome.thumbnails_built += 1;
                    if record.width.is_none() {
                        record.width = Some(width);
                        record.height = Some(height);
                    }
                    record.thumb.get_or_insert_with(|| item.targets.thumb_rel.clone());
                }
                Err(e) => {
                    debug!(world_id, path = %item.rel, error = %e, "Thumbnail build failed");
                    outcome.failures.push(failure(Derivative::Thumbnail, e.to_string()));
                    if outcome.is_new {
                        return outcome;
                    }
                }
            }
        } else {
            record.thumb.get_or_insert_with(|| item.targets.thumb_rel.clone());
        }

        if !item.targets.view_abs.exists() {
            match self.builder.build_full(&item.src, &item.targets.view_abs) {
                Ok((width, height)) => {
                    outcome.full_built += 1;
                    if record.width.is_none() {
                        record.width = Some(width);
                        record.height = Some(height);
                    }
                    record.view.get_or_insert_with(|| item.targets.view_rel.clone());
                }
                Err(e) => {
                    debug!(world_id, path = %item.rel, error = %e, "Full derivative build failed");
                    outcome.failures.push(failure(Derivative::Full, e.to_string()));
                }
            }
        } else {
            record.view.get_or_insert_with(|| item.targets.view_rel.clone());
        }

        outcome.record = Some(record);
        outcome
    }

    fn merge(
        &self,
        world_id: &str,
        outcomes: Vec<BuildOutcome>,
        generation: u64,
        lock: &Mutex<u64>,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        let current = lock.lock();
        let mut records = self.records.write();

        // Removed while building and not re-added since: discard what was built.
        if *current != generation && !records.contains_key(world_id) {
            drop(records);
            let discarded = outcomes.into_iter().filter_map(|outcome| outcome.record);
            for record in discarded {
                for rel in [record.thumb.as_deref(), record.view.as_deref()].into_iter().flatten() {
                    remove_file_quietly(&self.layout.absolute(rel));
                }
            }
            for root in [self.layout.thumb_world_dir(world_id), self.layout.view_world_dir(world_id)] {
                prune_empty_dirs(&root);
            }
            debug!(world_id, "Discarded derivatives for world removed during build");
            return report;
        }

        let mut latest = records.remove(world_id).unwrap_or_default();

        for outcome in outcomes {
            report.thumbnails_built += outcome.thumbnails_built;
            report.full_built += outcome.full_built;
            report.failures.extend(outcome.failures);

            let Some(built) = outcome.record else {
                continue;
            };
            match latest.iter_mut().find(|record| record.path == built.path) {
                Some(current) => report.changed |= current.fill_missing(&built),
                // Repairs of records removed meanwhile are dropped.
                None if outcome.is_new => {
                    latest.push(built);
                    report.records_added += 1;
                    report.changed = true;
                }
                None => {}
            }
        }

        latest.sort_by(|a, b| a.path.cmp(&b.path));
        if !latest.is_empty() {
            records.insert(world_id.to_string(), latest);
        }
        report
    }

    /// Drop records for `paths` and delete their derivative files.
    pub fn remove_images(&self, world_id: &str, paths: &BTreeSet<String>) -> ApplyReport {
        let mut report = ApplyReport::default();
        let lock = self.world_lock(world_id);

        let removed: Vec<ImageRecord> = {
            let _guard = lock.lock();
            let mut records = self.records.write();
            let Some(list) = records.get_mut(world_id) else {
                return report;
            };
            let (removed, kept): (Vec<_>, Vec<_>) =
                list.drain(..).partition(|record| paths.contains(&record.path));
            *list = kept;
            if list.is_empty() {
                records.remove(world_id);
            }
            removed
        };

        if removed.is_empty() {
            return report;
        }
        report.changed = true;
        report.records_removed = removed.len();

        for record in &removed {
            let targets = self.layout.targets(world_id, &record.path);
            let thumb = record.thumb.as_deref().map(|rel| self.layout.absolute(rel));
            let view = record.view.as_deref().map(|rel| self.layout.absolute(rel));
            for file in [thumb, view, Some(targets.thumb_abs), Some(targets.view_abs)]
                .into_iter()
                .flatten()
            {
                remove_file_quietly(&file);
            }
        }
        for root in [self.layout.thumb_world_dir(world_id), self.layout.view_world_dir(world_id)] {
            prune_empty_dirs(&root);
        }

        debug!(world_id, removed = report.records_removed, "Removed image records");
        report
    }

    /// Forget a world and delete its derivative directories.
    pub fn remove_world(&self, world_id: &str) -> ApplyReport {
        let mut report = ApplyReport::default();
        let lock = self.world_lock(world_id);

        let existed = {
            let mut generation = lock.lock();
            *generation += 1;
            self.records.write().remove(world_id)
        };
        if let Some(records) = existed {
            report.changed = true;
            report.worlds_removed = 1;
            report.records_removed = records.len();
            info!(world_id, images = records.len(), "Removed world from image cache");
        }

        for dir in [self.layout.thumb_world_dir(world_id), self.layout.view_world_dir(world_id)] {
            remove_tree_quietly(&dir);
        }

        report
    }

    /// All records, sorted by world id.
    pub fn list_all(&self) -> Vec<WorldImages> {
        self.records
            .read()
            .iter()
            .map(|(world_id, images)| WorldImages {
                world_id: world_id.clone(),
                images: images.clone(),
            })
            .collect()
    }

    /// Records for each requested world; unknown worlds map to an empty list.
    pub fn list_for(&self, world_ids: &[String]) -> HashMap<String, Vec<ImageRecord>> {
        let records = self.records.read();
        world_ids
            .iter()
            .map(|world_id| (world_id.clone(), records.get(world_id).cloned().unwrap_or_default()))
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let records = self.records.read();
        CacheStats {
            worlds: records.len(),
            images: records.values().map(Vec::len).sum(),
        }
    }

    /// Write the whole mapping to the cache file.
    pub fn persist(&self) -> crate::album::json_store::StoreResult<()> {
        let _persist = self.persist_lock.lock();
        let payload = self.list_all();
        save_json(&self.cache_file, &payload)
    }
}

fn remove_file_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete derivative"),
    }
}

/// Delete every file under `root`, then the emptied directories. Errors are
/// logged per entry and never stop the walk.
fn remove_tree_quietly(root: &Path) {
    if !root.is_dir() {
        return;
    }
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %root.display(), error = %e, "Error walking derivative directory");
                continue;
            }
        };
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        if let Err(e) = result {
            warn!(path = %entry.path().display(), error = %e, "Failed to delete derivative path");
        }
    }
}

/// Remove empty directories under and including `root`.
fn prune_empty_dirs(root: &Path) {
    if !root.is_dir() {
        return;
    }
    for entry in WalkDir::new(root).contents_first(true).into_iter().flatten() {
        if entry.file_type().is_dir() {
            // Fails on non-empty directories, which is the point.
            let _ = fs::remove_dir(entry.path());
        }
    }
}
