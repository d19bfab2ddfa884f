use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::proxy::cache::{CacheEntry, CacheKey, ResponseCache, is_cacheable};
use crate::proxy::request::ParsedRequest;

/// What happens to a request once the cache has been consulted.
///
/// The router owns the lookup and key derivation; implementations decide how to answer.
/// The key passed to `on_hit` and `on_miss` is the same one the capture step must write under.
#[async_trait]
pub trait RequestHandler {
    type Output;

    async fn on_hit(&mut self, key: CacheKey, entry: CacheEntry) -> Result<Self::Output>;

    async fn on_miss(&mut self, key: CacheKey) -> Result<Self::Output>;

    /// Method outside the cacheable set; the store is never touched.
    async fn on_skip(&mut self) -> Result<Self::Output>;
}

pub async fn route_request<H>(
    cache: &ResponseCache,
    parsed: &ParsedRequest,
    handler: &mut H,
) -> Result<H::Output>
where
    H: RequestHandler + Send,
{
    if !is_cacheable(&parsed.method) {
        return handler.on_skip().await;
    }

    let key = CacheKey::for_request(parsed);
    match cache.lookup(&key).await {
        Some(entry) => {
            debug!(key = %key, method = %parsed.method, path = %parsed.path, "cache hit");
            handler.on_hit(key, entry).await
        }
        None => {
            debug!(key = %key, method = %parsed.method, path = %parsed.path, "cache miss");
            handler.on_miss(key).await
        }
    }
}
