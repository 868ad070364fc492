//! World screenshot album
//! Scans world directories, keeps image derivatives and remote metadata fresh,
//! and serves creation-time ordered pages.

pub mod config_loader;
pub mod image_builder;
pub mod image_cache;
pub mod json_store;
pub mod logger;
pub mod metadata_cache;
pub mod orchestration;
pub mod scanner;
pub mod service;
pub mod snapshot;
pub mod sorted_index;

// Re-export commonly used types for convenience
pub use config_loader::{
    AppConfig, ConfigError, ConfigManager, ConfigResult, ResolvedPaths, init_config,
};

pub use image_builder::{BuildError, BuildResult, DerivativeBuilder};

pub use image_cache::{
    ApplyReport, BuildFailure, CacheStats, Derivative, DerivativeLayout, ImageCache, ImageRecord,
    WorldImages,
};

pub use json_store::{StoreError, StoreResult, load_json, save_json};

pub use logger::{LoggerError, LoggerResult, init_logging};

pub use metadata_cache::{
    ApiClient, Clock, MetadataCache, MetadataError, MetadataResult, MetadataSource, RetryPolicy,
    SystemClock, WorldMetadata,
};

pub use orchestration::{OrchestratorError, OrchestratorResult, ScanOrchestrator, TickSummary};

pub use scanner::{FilesystemScanner, ScanResult, SourceImage};
pub use service::{Album, WorldPageEntry};
pub use snapshot::{SnapshotDiff, SnapshotDiffer};
pub use sorted_index::SortedIndex;
