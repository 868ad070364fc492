//! Atomic JSON persistence shared by every cache.
//!
//! Files written here are advisory: a missing or corrupt file loads as the
//! default value and the next scan tick rebuilds it.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

/// Error types for the JSON store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to persist {path}: {source}")]
    Persist { path: String, source: io::Error },
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Load `path` as JSON, falling back to `T::default()` when the file is
/// missing, unreadable or malformed.
pub fn load_json<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Cache file not found, starting empty");
            return T::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read cache file, starting empty");
            return T::default();
        }
    };

    match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cache file is corrupt, starting empty");
            T::default()
        }
    }
}

/// Serialize `value` to a temp file next to `path`, then rename it into place.
pub fn save_json<T>(path: &Path, value: &T) -> StoreResult<()>
where
    T: Serialize + ?Sized,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let data = serde_json::to_vec_pretty(value)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Persist {
        path: path.display().to_string(),
        source: e.error,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut state = BTreeMap::new();
        state.insert("wrld_a".to_string(), vec!["worlds/wrld_a/1.png".to_string()]);
        save_json(&path, &state).unwrap();

        let loaded: BTreeMap<String, Vec<String>> = load_json(&path);
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempdir().unwrap();
        let loaded: Vec<String> = load_json(&dir.path().join("absent.json"));
        assert!(loaded.is_empty());
    }

    #[test]
    fn truncated_file_loads_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{\"wrld_a\": [\"worlds/wr").unwrap();

        let loaded: BTreeMap<String, Vec<String>> = load_json(&path);
        assert!(loaded.is_empty());
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        save_json(&path, &vec![1, 2, 3]).unwrap();
        save_json(&path, &vec![4]).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let loaded: Vec<i32> = load_json(&path);
        assert_eq!(loaded, vec![4]);
    }
}
