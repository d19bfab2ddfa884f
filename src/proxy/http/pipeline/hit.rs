use anyhow::Result;
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::io_util::write_all_with_timeout;
use crate::proxy::cache::{CacheEntry, CacheStoreResult, CachedReply, Disposition};
use crate::util::timeout_with_context;

use super::ClientDisposition;
use super::handler::Http1RequestHandler;
use super::respond::shutdown_stream;

use super::super::body::BodyPlan;
use super::super::codec::{ConnectionOverride, encode_hit_response};

/// Answers from a stored entry without contacting the origin.
///
/// A request body is never read on this path, so the connection closes when one was announced.
pub(super) async fn serve_hit<S>(
    handler: &mut Http1RequestHandler<'_, S>,
    entry: CacheEntry,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let timeout = handler.app.settings.client_timeout();
    let accept_encoding = handler.headers.combined_value("accept-encoding");
    let reply = CachedReply::negotiate(&entry, accept_encoding.as_deref());
    let close = handler.close_requested || !matches!(handler.body_plan, BodyPlan::Empty);

    let head_only = handler.parsed.method == Method::HEAD;
    let head = encode_hit_response(&reply, head_only, ConnectionOverride::when(close));
    let client = handler.reader.get_mut();
    write_all_with_timeout(client, &head, timeout, "writing cached response head").await?;
    let mut bytes_out = head.len() as u64;
    if !head_only {
        write_all_with_timeout(client, &reply.body, timeout, "writing cached response body")
            .await?;
        bytes_out += reply.body.len() as u64;
    }
    timeout_with_context(timeout, client.flush(), "flushing cached response").await?;
    if close {
        shutdown_stream(client, timeout).await?;
    }

    let builder = handler
        .access_log()
        .disposition(Disposition::Hit)
        .cache_store(CacheStoreResult::Bypassed)
        .status(StatusCode::OK);
    handler.log_tracker.finish(builder, bytes_out).log();

    Ok(ClientDisposition::when_close(close))
}
