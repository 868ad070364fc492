//! Read-side facade combining the sorted index, metadata cache and image cache.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::album::config_loader::AppConfig;
use crate::album::image_builder::DerivativeBuilder;
use crate::album::image_cache::{CacheStats, DerivativeLayout, ImageCache, ImageRecord, WorldImages};
use crate::album::metadata_cache::{
    ApiClient, Clock, MetadataCache, MetadataResult, MetadataSource, SystemClock, WorldMetadata,
};
use crate::album::orchestration::ScanOrchestrator;
use crate::album::scanner::FilesystemScanner;
use crate::album::snapshot::SnapshotDiffer;
use crate::album::sorted_index::SortedIndex;

/// One world on a page.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldPageEntry {
    pub id: String,
    pub metadata: Option<WorldMetadata>,
    pub images: Vec<ImageRecord>,
}

impl WorldPageEntry {
    /// Metadata fields flattened next to `id` and `images`. Worlds without a
    /// payload serialize as just `id` and `images`.
    pub fn to_json(&self) -> Value {
        let mut object = match self.metadata.as_ref().map(serde_json::to_value) {
            Some(Ok(Value::Object(fields))) => fields,
            _ => Map::new(),
        };
        object.insert("id".to_string(), Value::String(self.id.clone()));
        object.insert(
            "images".to_string(),
            serde_json::to_value(&self.images).unwrap_or_else(|_| Value::Array(Vec::new())),
        );
        Value::Object(object)
    }
}

/// The album: every cache plus the orchestrator that keeps them fresh.
pub struct Album {
    index: Arc<SortedIndex>,
    metadata: Arc<MetadataCache>,
    images: Arc<ImageCache>,
    orchestrator: Arc<ScanOrchestrator>,
}

impl Album {
    /// Build from configuration, fetching metadata from the configured API.
    pub fn from_config(config: &AppConfig, config_dir: &Path) -> MetadataResult<Self> {
        let source = ApiClient::new(
            &config.metadata.api_base,
            Duration::from_secs(config.metadata.request_timeout_secs),
            &config.metadata.user_agent,
        )?;
        Ok(Self::with_source(config, config_dir, Arc::new(source), Arc::new(SystemClock)))
    }

    pub fn with_source(
        config: &AppConfig,
        config_dir: &Path,
        source: Arc<dyn MetadataSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let paths = config.resolve_paths(config_dir);

        let scanner = Arc::new(FilesystemScanner::new(
            &paths.worlds_directory,
            &paths.static_root,
            &config.scan.image_extensions,
        ));
        let differ = Arc::new(SnapshotDiffer::load(&paths.snapshot_file));
        let index = Arc::new(SortedIndex::new());
        let metadata = Arc::new(MetadataCache::load(
            &paths.metadata_cache_file,
            source,
            clock,
            config.metadata.ttl(),
            config.metadata.retry_policy(),
            config.metadata.fetch_workers,
        ));
        let images = Arc::new(ImageCache::load(
            DerivativeLayout::new(
                &paths.static_root,
                &paths.worlds_directory,
                &paths.thumb_directory,
                &paths.view_directory,
            ),
            DerivativeBuilder::new(config.images.thumbnail_quality, config.images.full_quality),
            Arc::clone(&index),
            &paths.image_cache_file,
        ));
        let orchestrator = Arc::new(ScanOrchestrator::new(
            scanner,
            differ,
            Arc::clone(&index),
            Arc::clone(&metadata),
            Arc::clone(&images),
        ));

        Self {
            index,
            metadata,
            images,
            orchestrator,
        }
    }

    /// Every world's image records, sorted by world id.
    pub fn list_all_image_metadata(&self) -> Vec<WorldImages> {
        self.images.list_all()
    }

    /// One page of worlds, newest first.
    pub fn page(&self, page_index: i64, page_size: usize) -> Vec<WorldPageEntry> {
        let ids = self.index.page(page_index, page_size);
        let payloads = self.metadata.payloads(&ids);
        let mut images = self.images.list_for(&ids);

        ids.into_iter()
            .zip(payloads)
            .map(|(id, metadata)| {
                let images = images.remove(&id).unwrap_or_default();
                WorldPageEntry { id, metadata, images }
            })
            .collect()
    }

    /// Metadata for one world, fetched if missing or stale.
    pub async fn world_metadata(&self, world_id: &str) -> MetadataResult<WorldMetadata> {
        self.metadata.get(world_id).await
    }

    /// Request an out-of-band refresh. Returns false if a tick is already running.
    pub fn start_scan_async(&self) -> bool {
        self.orchestrator.start_async()
    }

    pub fn start_periodic(&self, period: Duration) -> JoinHandle<()> {
        self.orchestrator.start_periodic(period)
    }

    pub fn is_scanning(&self) -> bool {
        self.orchestrator.is_running()
    }

    pub fn pending_fetches(&self) -> usize {
        self.metadata.pending_fetches()
    }

    pub fn stats(&self) -> CacheStats {
        self.images.stats()
    }

    pub fn orchestrator(&self) -> &Arc<ScanOrchestrator> {
        &self.orchestrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::album::metadata_cache::tests::{FakeSource, ManualClock, sample};
    use chrono::Utc;
    use image::{Rgb, RgbImage};
    use std::fs;
    use std::thread::sleep;
    use tempfile::tempdir;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.metadata.retry_initial_ms = 5;
        config.metadata.retry_max_ms = 20;
        config
    }

    fn add_world(root: &Path, world: &str, images: usize) {
        let dir = root.join("static").join("worlds").join(world);
        fs::create_dir_all(&dir).unwrap();
        for i in 0..images {
            RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]))
                .save(dir.join(format!("{}.png", i)))
                .unwrap();
        }
    }

    async fn settle(album: &Album) {
        for _ in 0..400 {
            if album.pending_fetches() == 0 && !album.is_scanning() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("album did not settle");
    }

    #[tokio::test]
    async fn page_merges_metadata_and_images_newest_first() {
        let dir = tempdir().unwrap();
        add_world(dir.path(), "wrld_old", 1);
        sleep(Duration::from_millis(20));
        add_world(dir.path(), "wrld_new", 2);

        let album = Album::with_source(
            &config(),
            dir.path(),
            Arc::new(FakeSource::default()),
            Arc::new(ManualClock::at(Utc::now())),
        );
        album.orchestrator().tick().await.unwrap();
        settle(&album).await;

        let page = album.page(0, 10);
        let ids: Vec<_> = page.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids, vec!["wrld_new", "wrld_old"]);
        assert_eq!(page[0].metadata, Some(sample("wrld_new")));
        assert_eq!(page[0].images.len(), 2);

        let json = page[0].to_json();
        assert_eq!(json["id"], "wrld_new");
        assert_eq!(json["authorName"], "author");
        assert_eq!(json["images"].as_array().unwrap().len(), 2);

        assert!(album.page(1, 10).is_empty());
        assert_eq!(album.stats(), CacheStats { worlds: 2, images: 3 });
        assert_eq!(album.list_all_image_metadata()[0].world_id, "wrld_new");
    }

    #[tokio::test]
    async fn unfetched_worlds_degrade_to_id_only() {
        let dir = tempdir().unwrap();
        add_world(dir.path(), "wrld_a", 1);

        let album = Album::with_source(
            &config(),
            dir.path(),
            Arc::new(FakeSource::unreachable()),
            Arc::new(ManualClock::at(Utc::now())),
        );
        album.orchestrator().tick().await.unwrap();

        let page = album.page(0, 10);
        assert_eq!(page.len(), 1);
        assert!(page[0].metadata.is_none());

        let json = page[0].to_json();
        let keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 2);
        assert!(album.world_metadata("wrld_a").await.is_err());
        assert_eq!(album.pending_fetches(), 1);
    }

    #[tokio::test]
    async fn start_scan_async_reports_coalescing() {
        let dir = tempdir().unwrap();
        add_world(dir.path(), "wrld_a", 3);
        let album = Album::with_source(
            &config(),
            dir.path(),
            Arc::new(FakeSource::default()),
            Arc::new(ManualClock::at(Utc::now())),
        );

        assert!(album.start_scan_async());
        assert!(!album.start_scan_async());
        settle(&album).await;
        assert_eq!(album.stats().images, 3);
    }
}
