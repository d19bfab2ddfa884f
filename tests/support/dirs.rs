use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

/// Scratch directory owning the proxy's cache store for one test.
pub struct TestDirs {
    root: TempDir,
    cache_dir: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let root = TempDir::new()?;
        let cache_dir = root.path().join("cache");
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self { root, cache_dir })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Files currently in the cache directory, sorted by name.
    pub fn cache_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.cache_dir)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}
