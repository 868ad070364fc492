//! Remote world metadata with a freshness TTL and retrying background fetches.
//!
//! This module provides:
//! 1. `MetadataSource`, the seam to the remote worlds API (`ApiClient` in production)
//! 2. A TTL cache persisted as `{world_id: {payload, fetched_at}}`
//! 3. Background fetches on a bounded worker pool that retry with jittered
//!    exponential backoff until they succeed or the world is removed

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::album::json_store::{StoreError, load_json, save_json};

/// Error types for metadata fetching
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Upstream returned {status} for world {world_id}")]
    Status { world_id: String, status: u16 },

    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Result type for metadata operations
pub type MetadataResult<T> = Result<T, MetadataError>;

/// World record as served by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldMetadata {
    pub id: String,
    pub name: String,
    pub author_id: String,
    pub author_name: String,
    pub image_url: String,
    pub capacity: i64,
    pub visits: i64,
    pub favorites: i64,
    pub heat: i64,
    pub popularity: i64,
    pub tags: Vec<String>,
}

/// Source of world metadata.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self, world_id: &str) -> MetadataResult<WorldMetadata>;
}

/// HTTP client for `GET {api_base}/worlds/{id}`.
pub struct ApiClient {
    client: Client,
    api_base: String,
}

impl ApiClient {
    pub fn new(api_base: &str, timeout: Duration, user_agent: &str) -> MetadataResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MetadataSource for ApiClient {
    async fn fetch(&self, world_id: &str) -> MetadataResult<WorldMetadata> {
        let url = format!("{}/worlds/{}", self.api_base, world_id);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status {
                world_id: world_id.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Source of "now" for TTL checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Backoff between background fetch attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Fraction of the delay added or removed at random, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after the given failed attempt (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial.saturating_mul(1u32 << exponent).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = rand::rng().random_range(1.0 - jitter..=1.0 + jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

/// One cached world.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    #[serde(default)]
    pub payload: Option<WorldMetadata>,
    #[serde(default, with = "timestamp")]
    pub fetched_at: Option<DateTime<Utc>>,
}

/// RFC 3339 timestamps; naive values are read as UTC, unreadable ones as absent.
mod timestamp {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_some(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(parse))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<String, MetadataEntry>,
    /// World id -> ticket of the background fetch that owns it.
    pending: HashMap<String, u64>,
    next_ticket: u64,
}

impl State {
    fn owns(&self, world_id: &str, ticket: u64) -> bool {
        self.pending.get(world_id) == Some(&ticket)
    }
}

fn write_entries(persist_lock: &Mutex<()>, state: &Mutex<State>, path: &Path) -> MetadataResult<()> {
    let _persist = persist_lock.lock();
    let entries = state.lock().entries.clone();
    save_json(path, &entries)?;
    Ok(())
}

/// TTL cache of remote world metadata.
pub struct MetadataCache {
    state: Arc<Mutex<State>>,
    cache_file: PathBuf,
    persist_lock: Arc<Mutex<()>>,
    source: Arc<dyn MetadataSource>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    retry: RetryPolicy,
    workers: Arc<Semaphore>,
    retry_tasks: AtomicUsize,
}

/// A running background fetch. Dropping it releases the world's pending
/// marker, but only while the marker still carries this task's ticket.
struct RetryTask {
    cache: Arc<MetadataCache>,
    world_id: String,
    ticket: u64,
}

impl RetryTask {
    fn is_current(&self) -> bool {
        self.cache.state.lock().owns(&self.world_id, self.ticket)
    }
}

impl Drop for RetryTask {
    fn drop(&mut self) {
        {
            let mut state = self.cache.state.lock();
            if state.owns(&self.world_id, self.ticket) {
                state.pending.remove(&self.world_id);
            }
        }
        self.cache.retry_tasks.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MetadataCache {
    /// Create a cache backed by `cache_file`, loading whatever it holds.
    pub fn load(
        cache_file: impl Into<PathBuf>,
        source: Arc<dyn MetadataSource>,
        clock: Arc<dyn Clock>,
        ttl: chrono::Duration,
        retry: RetryPolicy,
        workers: usize,
    ) -> Self {
        let cache_file = cache_file.into();
        let entries: HashMap<String, MetadataEntry> = load_json(&cache_file);
        info!(worlds = entries.len(), "Loaded metadata cache");

        Self {
            state: Arc::new(Mutex::new(State {
                entries,
                ..State::default()
            })),
            cache_file,
            persist_lock: Arc::new(Mutex::new(())),
            source,
            clock,
            ttl,
            retry,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            retry_tasks: AtomicUsize::new(0),
        }
    }

    fn fresh_payload(&self, world_id: &str) -> Option<WorldMetadata> {
        let state = self.state.lock();
        let entry = state.entries.get(world_id)?;
        let payload = entry.payload.as_ref()?;
        let fetched_at = entry.fetched_at?;
        (self.clock.now() - fetched_at <= self.ttl).then(|| payload.clone())
    }

    /// Cached payload if fresh, otherwise fetch, store and persist.
    #[instrument(skip(self))]
    pub async fn get(&self, world_id: &str) -> MetadataResult<WorldMetadata> {
        self.load_or_fetch(world_id, None).await
    }

    /// With a `ticket`, the result is stored only if that ticket still owns the world.
    async fn load_or_fetch(&self, world_id: &str, ticket: Option<u64>) -> MetadataResult<WorldMetadata> {
        if let Some(payload) = self.fresh_payload(world_id) {
            return Ok(payload);
        }

        let payload = self.source.fetch(world_id).await?;
        let fetched_at = self.clock.now();

        {
            let mut state = self.state.lock();
            if let Some(ticket) = ticket {
                if !state.owns(world_id, ticket) {
                    debug!(world_id, "Discarding fetch for world removed meanwhile");
                    return Ok(payload);
                }
            }
            state.entries.insert(
                world_id.to_string(),
                MetadataEntry {
                    payload: Some(payload.clone()),
                    fetched_at: Some(fetched_at),
                },
            );
        }

        self.persist_blocking().await?;
        debug!(world_id, "Fetched world metadata");
        Ok(payload)
    }

    /// Queue a retrying fetch for every id not already pending. Returns the
    /// number of fetches queued. Must be called within a tokio runtime.
    pub fn schedule_fetch<I, S>(self: &Arc<Self>, world_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut scheduled = Vec::new();
        {
            let mut state = self.state.lock();
            for world_id in world_ids {
                let world_id = world_id.as_ref();
                if state.pending.contains_key(world_id) {
                    continue;
                }
                state.next_ticket += 1;
                let ticket = state.next_ticket;
                state.pending.insert(world_id.to_string(), ticket);
                scheduled.push((world_id.to_string(), ticket));
            }
        }

        let count = scheduled.len();
        for (world_id, ticket) in scheduled {
            self.retry_tasks.fetch_add(1, Ordering::SeqCst);
            let task = RetryTask {
                cache: Arc::clone(self),
                world_id,
                ticket,
            };
            tokio::spawn(Self::retry_fetch(task));
        }
        count
    }

    async fn retry_fetch(task: RetryTask) {
        let cache = Arc::clone(&task.cache);
        let mut attempt: u32 = 0;
        loop {
            if !task.is_current() {
                debug!(world_id = %task.world_id, "Background fetch cancelled");
                return;
            }

            let result = match Arc::clone(&cache.workers).acquire_owned().await {
                Ok(_permit) => cache.load_or_fetch(&task.world_id, Some(task.ticket)).await,
                Err(_) => return,
            };

            match result {
                Ok(_) => return,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = cache.retry.delay(attempt);
                    warn!(
                        world_id = %task.world_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Metadata fetch failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Delete a world's entry and cancel its pending fetch. Returns whether it was cached.
    pub fn remove(&self, world_id: &str) -> bool {
        let existed = {
            let mut state = self.state.lock();
            state.pending.remove(world_id);
            state.entries.remove(world_id).is_some()
        };

        if existed {
            self.persist_detached();
        }
        existed
    }

    /// Schedule fetches for worlds that have no payload yet.
    pub fn backfill_unfetched<'a, I>(self: &Arc<Self>, world_ids: I) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        let missing: Vec<String> = {
            let state = self.state.lock();
            world_ids
                .into_iter()
                .filter(|id| {
                    state
                        .entries
                        .get(*id)
                        .and_then(|entry| entry.payload.as_ref())
                        .is_none()
                })
                .cloned()
                .collect()
        };
        self.schedule_fetch(missing)
    }

    /// Queue fetches for `added` and drop `removed`. Returns fetches queued.
    pub fn process_changes<'a, A, R>(self: &Arc<Self>, added: A, removed: R) -> usize
    where
        A: IntoIterator<Item = &'a String>,
        R: IntoIterator<Item = &'a String>,
    {
        let scheduled = self.schedule_fetch(added);
        for world_id in removed {
            self.remove(world_id);
        }
        scheduled
    }

    /// Payloads in the order of `world_ids`, `None` for worlds never fetched.
    pub fn payloads(&self, world_ids: &[String]) -> Vec<Option<WorldMetadata>> {
        let state = self.state.lock();
        world_ids
            .iter()
            .map(|id| state.entries.get(id).and_then(|entry| entry.payload.clone()))
            .collect()
    }

    pub fn entry(&self, world_id: &str) -> Option<MetadataEntry> {
        self.state.lock().entries.get(world_id).cloned()
    }

    pub fn contains(&self, world_id: &str) -> bool {
        self.state.lock().entries.contains_key(world_id)
    }

    /// Worlds with a background fetch queued or retrying.
    pub fn pending_fetches(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Background fetch tasks still alive, including cancelled ones that
    /// have not woken up yet.
    pub fn retry_tasks(&self) -> usize {
        self.retry_tasks.load(Ordering::SeqCst)
    }

    /// Write the whole mapping on the calling thread.
    pub fn persist(&self) -> MetadataResult<()> {
        write_entries(&self.persist_lock, &self.state, &self.cache_file)
    }

    async fn persist_blocking(&self) -> MetadataResult<()> {
        let state = Arc::clone(&self.state);
        let persist_lock = Arc::clone(&self.persist_lock);
        let path = self.cache_file.clone();
        tokio::task::spawn_blocking(move || write_entries(&persist_lock, &state, &path)).await?
    }

    /// Persist without blocking a runtime worker; inline outside a runtime.
    fn persist_detached(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let state = Arc::clone(&self.state);
                let persist_lock = Arc::clone(&self.persist_lock);
                let path = self.cache_file.clone();
                handle.spawn_blocking(move || {
                    if let Err(e) = write_entries(&persist_lock, &state, &path) {
                        warn!(path = %path.display(), error = %e, "Failed to persist metadata cache");
                    }
                });
            }
            Err(_) => {
                if let Err(e) = self.persist() {
                    warn!(path = %self.cache_file.display(), error = %e, "Failed to persist metadata cache");
                }
            }
        }
    }
}
