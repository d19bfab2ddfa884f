use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::key::CacheKey;

const TEMP_PREFIX: &str = "tmp_";
const ENTRY_EXTENSION: &str = "json";

/// Byte-level key/value backend holding encoded cache entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>>;

    /// Replaces any existing value for `key`.
    async fn put(&self, key: &CacheKey, bytes: Vec<u8>) -> Result<()>;
}

/// One `<key>.json` file per entry inside a single directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    /// Creates `dir` if needed and removes temp files left by interrupted writes.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        async_fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create cache directory {}", dir.display()))?;
        let store = Self { dir };
        let removed = store.remove_temp_files().await?;
        if removed > 0 {
            debug!(removed, dir = %store.dir.display(), "removed stale cache temp files");
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{ENTRY_EXTENSION}", key.as_str()))
    }

    async fn remove_temp_files(&self) -> Result<usize> {
        let mut entries = async_fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to list cache directory {}", self.dir.display()))?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if is_temp && entry.file_type().await?.is_file() {
                async_fs::remove_file(entry.path()).await.ok();
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheStore for FsStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        match async_fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read cache entry {}", path.display()))
            }
        }
    }

    async fn put(&self, key: &CacheKey, bytes: Vec<u8>) -> Result<()> {
        let temp_path = self.dir.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        let final_path = self.entry_path(key);

        let mut options = async_fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let written: Result<()> = async {
            let mut file = options
                .open(&temp_path)
                .await
                .with_context(|| format!("failed to create {}", temp_path.display()))?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            async_fs::rename(&temp_path, &final_path)
                .await
                .with_context(|| format!("failed to install cache entry {}", final_path.display()))
        }
        .await;

        if written.is_err() {
            async_fs::remove_file(&temp_path).await.ok();
        }
        written
    }
}

/// In-process store, used where persistence is not wanted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key.as_str()).cloned())
    }

    async fn put(&self, key: &CacheKey, bytes: Vec<u8>) -> Result<()> {
        self.entries.lock().insert(key.as_str().to_string(), bytes);
        Ok(())
    }
}
