//! Orchestration layer for the album service
//!
//! This module provides:
//! 1. A single scan tick: scan, diff, index rebuild, metadata scheduling, image apply
//! 2. Coalesced background ticks (at most one running at a time)
//! 3. A periodic scheduler that requests a tick on a fixed interval
//!
//! Each tick runs inside a `tick` span carrying a unique trace id.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::album::image_cache::{ApplyReport, ImageCache};
use crate::album::metadata_cache::MetadataCache;
use crate::album::scanner::FilesystemScanner;
use crate::album::snapshot::SnapshotDiffer;
use crate::album::sorted_index::SortedIndex;

/// Error types for the orchestration layer
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Result type for orchestration operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Outcome of one tick.
#[derive(Debug, Clone)]
pub struct TickSummary {
    pub trace_id: Uuid,
    pub worlds: usize,
    pub added_worlds: usize,
    pub removed_worlds: usize,
    pub added_images: usize,
    pub removed_images: usize,
    pub fetches_scheduled: usize,
    pub images: ApplyReport,
}

/// Drives scan ticks against the shared caches.
pub struct ScanOrchestrator {
    scanner: Arc<FilesystemScanner>,
    differ: Arc<SnapshotDiffer>,
    index: Arc<SortedIndex>,
    metadata: Arc<MetadataCache>,
    images: Arc<ImageCache>,
    running: AtomicBool,
}

/// Clears the running flag even if the tick task panics.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ScanOrchestrator {
    pub fn new(
        scanner: Arc<FilesystemScanner>,
        differ: Arc<SnapshotDiffer>,
        index: Arc<SortedIndex>,
        metadata: Arc<MetadataCache>,
        images: Arc<ImageCache>,
    ) -> Self {
        Self {
            scanner,
            differ,
            index,
            metadata,
            images,
            running: AtomicBool::new(false),
        }
    }

    /// Run one tick to completion. Per-world and per-image failures are
    /// reported in the summary, never returned as errors.
    pub async fn tick(&self) -> OrchestratorResult<TickSummary> {
        let trace_id = Uuid::new_v4();
        let span = info_span!("tick", trace_id = %trace_id);
        self.run_tick(trace_id).instrument(span).await
    }

    async fn run_tick(&self, trace_id: Uuid) -> OrchestratorResult<TickSummary> {
        let scanner = Arc::clone(&self.scanner);
        let differ = Arc::clone(&self.differ);
        let (scan, diff) = tokio::task::spawn_blocking(move || {
            let scan = scanner.scan();
            let diff = differ.diff(&scan.files);
            (scan, diff)
        })
        .await?;

        self.index.update(scan.world_ids(), &scan.ctimes);

        let mut fetches_scheduled = self
            .metadata
            .process_changes(&diff.added_worlds, &diff.removed_worlds);
        fetches_scheduled += self.metadata.backfill_unfetched(scan.world_ids());

        let mut summary = TickSummary {
            trace_id,
            worlds: scan.files.len(),
            added_worlds: diff.added_worlds.len(),
            removed_worlds: diff.removed_worlds.len(),
            added_images: diff.added_image_count(),
            removed_images: diff.removed_image_count(),
            fetches_scheduled,
            images: ApplyReport::default(),
        };

        let images = Arc::clone(&self.images);
        summary.images = tokio::task::spawn_blocking(move || images.apply_diff(&scan, &diff)).await?;

        for failure in &summary.images.failures {
            debug!(
                world_id = %failure.world_id,
                path = %failure.path,
                derivative = %failure.derivative,
                error = %failure.error,
                "Derivative build failed"
            );
        }
        info!(
            worlds = summary.worlds,
            added_worlds = summary.added_worlds,
            removed_worlds = summary.removed_worlds,
            added_images = summary.added_images,
            removed_images = summary.removed_images,
            fetches_scheduled = summary.fetches_scheduled,
            thumbnails_built = summary.images.thumbnails_built,
            full_built = summary.images.full_built,
            build_failures = summary.images.failures.len(),
            "Scan tick complete"
        );

        Ok(summary)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start a background tick unless one is already running. Returns whether
    /// a tick was started.
    pub fn start_async(self: &Arc<Self>) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Scan tick already running");
            return false;
        }

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let _running = RunningGuard(&orchestrator.running);
            if let Err(e) = orchestrator.tick().await {
                error!(error = %e, "Scan tick aborted");
            }
        });
        true
    }

    /// Request a tick every `period`. Overlapping requests are no-ops.
    pub fn start_periodic(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "Periodic scanning started");
            loop {
                ticker.tick().await;
                orchestrator.start_async();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::album::image_builder::DerivativeBuilder;
    use crate::album::image_cache::DerivativeLayout;
    use crate::album::metadata_cache::tests::{FakeSource, ManualClock, fast_retry};
    use chrono::Utc;
    use image::{Rgb, RgbImage};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        index: Arc<SortedIndex>,
        metadata: Arc<MetadataCache>,
        images: Arc<ImageCache>,
        orchestrator: Arc<ScanOrchestrator>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let root = dir.path().join("static");
            let worlds = root.join("worlds");
            fs::create_dir_all(&worlds).unwrap();

            let extensions = vec!["png".to_string()];
            let scanner = Arc::new(FilesystemScanner::new(&worlds, &root, &extensions));
            let differ = Arc::new(SnapshotDiffer::load(dir.path().join("snapshot.json")));
            let index = Arc::new(SortedIndex::new());
            let metadata = Arc::new(MetadataCache::load(
                dir.path().join("worlds_metadata.json"),
                Arc::new(FakeSource::default()),
                Arc::new(ManualClock::at(Utc::now())),
                chrono::Duration::hours(24),
                fast_retry(),
                2,
            ));
            let images = Arc::new(ImageCache::load(
                DerivativeLayout::new(&root, &worlds, root.join("thumb"), root.join("view")),
                DerivativeBuilder::default(),
                Arc::clone(&index),
                dir.path().join("image_metadata.json"),
            ));
            let orchestrator = Arc::new(ScanOrchestrator::new(
                scanner,
                differ,
                Arc::clone(&index),
                Arc::clone(&metadata),
                Arc::clone(&images),
            ));
            Self { dir, index, metadata, images, orchestrator }
        }

        fn world_dir(&self, world: &str) -> PathBuf {
            self.dir.path().join("static").join("worlds").join(world)
        }

        fn add_image(&self, world: &str, name: &str) {
            let path = self.world_dir(world).join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            RgbImage::from_pixel(8, 8, Rgb([200, 20, 90])).save(&path).unwrap();
        }

        async fn settle(&self) {
            for _ in 0..400 {
                if self.metadata.pending_fetches() == 0 && !self.orchestrator.is_running() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("background work did not settle");
        }
    }

    #[tokio::test]
    async fn tick_populates_every_cache() {
        let fx = Fixture::new();
        fx.add_image("wrld_a", "1.png");
        fx.add_image("wrld_b", "1.png");

        let summary = fx.orchestrator.tick().await.unwrap();
        assert_eq!(summary.added_worlds, 2);
        assert_eq!(summary.added_images, 2);
        assert_eq!(summary.fetches_scheduled, 2);
        assert_eq!(summary.images.records_added, 2);

        fx.settle().await;
        assert_eq!(fx.index.len(), 2);
        assert!(fx.metadata.contains("wrld_a"));
        assert!(fx.metadata.contains("wrld_b"));
        assert_eq!(fx.images.stats().images, 2);
    }

    #[tokio::test]
    async fn second_tick_without_changes_does_nothing() {
        let fx = Fixture::new();
        fx.add_image("wrld_a", "1.png");
        fx.orchestrator.tick().await.unwrap();
        fx.settle().await;

        let summary = fx.orchestrator.tick().await.unwrap();
        assert_eq!(summary.added_worlds + summary.removed_worlds, 0);
        assert_eq!(summary.added_images + summary.removed_images, 0);
        assert_eq!(summary.fetches_scheduled, 0);
        assert!(!summary.images.changed);
        assert_eq!(summary.images.thumbnails_built + summary.images.full_built, 0);
    }

    #[tokio::test]
    async fn removed_world_leaves_every_cache() {
        let fx = Fixture::new();
        fx.add_image("wrld_a", "1.png");
        fx.add_image("wrld_gone", "nested/1.png");
        fx.orchestrator.tick().await.unwrap();
        fx.settle().await;
        assert!(fx.metadata.contains("wrld_gone"));

        fs::remove_dir_all(fx.world_dir("wrld_gone")).unwrap();
        let summary = fx.orchestrator.tick().await.unwrap();
        assert_eq!(summary.removed_worlds, 1);

        assert_eq!(fx.index.all(), vec!["wrld_a".to_string()]);
        assert!(!fx.metadata.contains("wrld_gone"));
        assert!(fx.images.list_for(&["wrld_gone".to_string()])["wrld_gone"].is_empty());
        assert!(!fx.images.layout().thumb_world_dir("wrld_gone").exists());
        assert!(!fx.images.layout().view_world_dir("wrld_gone").exists());
    }

    #[tokio::test]
    async fn start_async_coalesces_overlapping_requests() {
        let fx = Fixture::new();
        for i in 0..6 {
            fx.add_image("wrld_a", &format!("{}.png", i));
        }

        assert!(fx.orchestrator.start_async());
        assert!(!fx.orchestrator.start_async());
        fx.settle().await;

        assert!(fx.orchestrator.start_async());
        fx.settle().await;
        assert_eq!(fx.images.stats().images, 6);
    }

    #[tokio::test]
    async fn periodic_scheduler_runs_ticks() {
        let fx = Fixture::new();
        fx.add_image("wrld_a", "1.png");

        let handle = fx.orchestrator.start_periodic(Duration::from_millis(20));
        for _ in 0..400 {
            if fx.images.stats().images == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();
        assert_eq!(fx.images.stats().images, 1);
    }
}
