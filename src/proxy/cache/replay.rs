use tracing::warn;

use super::encoding::{accepts_gzip, gzip};
use super::entry::CacheEntry;

/// Response body and representation headers for serving a cache hit to one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedReply {
    pub body: Vec<u8>,
    pub content_type: String,
    pub content_encoding: Option<&'static str>,
    pub vary_accept_encoding: bool,
}

impl CachedReply {
    /// Re-applies gzip only when the origin compressed the response and the client accepts it.
    pub fn negotiate(entry: &CacheEntry, accept_encoding: Option<&str>) -> Self {
        let content_type = entry.content_type().to_string();
        let vary_accept_encoding = entry.was_compressed;

        if entry.was_compressed && accepts_gzip(accept_encoding) {
            match gzip(&entry.payload) {
                Ok(body) => {
                    return Self {
                        body,
                        content_type,
                        content_encoding: Some("gzip"),
                        vary_accept_encoding,
                    };
                }
                Err(err) => {
                    warn!(error = %err, "failed to compress cached payload; serving identity");
                }
            }
        }

        Self {
            body: entry.payload.clone(),
            content_type,
            content_encoding: None,
            vary_accept_encoding,
        }
    }
}
