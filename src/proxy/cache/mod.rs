use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::task;
use tracing::{debug, trace, warn};

mod encoding;
mod entry;
mod key;
mod policy;
mod replay;
mod store;

pub use encoding::{CaptureTooLarge, ContentCoding, accepts_gzip, gunzip, gzip};
pub use entry::{CacheEntry, DEFAULT_CONTENT_TYPE};
pub use key::CacheKey;
pub use policy::{Disposition, is_cacheable, is_capture_eligible};
pub use replay::CachedReply;
pub use store::{CacheStore, FsStore, MemoryStore};

/// Outcome of the capture step for one forwarded response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStoreResult {
    Stored,
    /// Eligible method, but the response could not be captured.
    Skipped,
    /// The store rejected the write; the client response is unaffected.
    Failed,
    /// Capture was never attempted.
    Bypassed,
}

impl CacheStoreResult {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStoreResult::Stored => "stored",
            CacheStoreResult::Skipped => "skipped",
            CacheStoreResult::Failed => "failed",
            CacheStoreResult::Bypassed => "none",
        }
    }
}

/// A complete upstream response body offered for capture.
#[derive(Debug)]
pub struct CapturedResponse<'a> {
    pub body: &'a [u8],
    pub coding: ContentCoding,
    pub content_type: Option<String>,
}

pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    max_entry_size: usize,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, max_entry_size: usize) -> Self {
        Self {
            store,
            max_entry_size,
        }
    }

    pub async fn open(dir: impl Into<PathBuf>, max_entry_size: usize) -> Result<Self> {
        let store = FsStore::open(dir).await?;
        Ok(Self::new(Arc::new(store), max_entry_size))
    }

    pub fn max_entry_size(&self) -> usize {
        self.max_entry_size
    }

    /// Read failures and undecodable entries both count as absent.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let bytes = match self.store.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                trace!(key = %key, "cache entry absent");
                return None;
            }
            Err(err) => {
                warn!(key = %key, error = ?err, "cache read failed; treating as miss");
                return None;
            }
        };
        match CacheEntry::decode(&bytes) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(key = %key, error = %err, "corrupt cache entry; treating as miss");
                None
            }
        }
    }

    /// Normalizes and persists a response body under `key`, overwriting any previous entry.
    pub async fn capture(&self, key: &CacheKey, response: CapturedResponse<'_>) -> CacheStoreResult {
        let CapturedResponse {
            body,
            coding,
            content_type,
        } = response;

        if body.len() > self.max_entry_size {
            debug!(key = %key, size = body.len(), "response body exceeds cache entry limit");
            return CacheStoreResult::Skipped;
        }

        let (payload, was_compressed) = match coding {
            ContentCoding::Identity => (body.to_vec(), false),
            ContentCoding::Gzip => {
                let compressed = body.to_vec();
                let limit = self.max_entry_size;
                match task::spawn_blocking(move || gunzip(&compressed, limit)).await {
                    Ok(Ok(payload)) => (payload, true),
                    Ok(Err(err)) => {
                        if err.downcast_ref::<CaptureTooLarge>().is_some() {
                            debug!(key = %key, error = %err, "skipping capture");
                        } else {
                            warn!(key = %key, error = %err, "failed to decompress response; not caching");
                        }
                        return CacheStoreResult::Skipped;
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "decompression task failed");
                        return CacheStoreResult::Skipped;
                    }
                }
            }
            ContentCoding::Other(coding) => {
                debug!(key = %key, coding = %coding, "unsupported content coding; not caching");
                return CacheStoreResult::Skipped;
            }
        };

        let entry = CacheEntry::new(payload, was_compressed, content_type);
        let encoded = match entry.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to encode cache entry");
                return CacheStoreResult::Failed;
            }
        };
        match self.store.put(key, encoded).await {
            Ok(()) => {
                debug!(key = %key, size = entry.payload.len(), was_compressed, "cached response");
                CacheStoreResult::Stored
            }
            Err(err) => {
                warn!(key = %key, error = ?err, "cache write failed");
                CacheStoreResult::Failed
            }
        }
    }
}
