use std::net::SocketAddr;

use anyhow::Result;
use http::Method;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::io_util::write_all_with_timeout;
use crate::proxy::cache::{
    CacheKey, CacheStoreResult, CapturedResponse, ContentCoding, Disposition, ResponseCache,
    is_capture_eligible,
};
use crate::proxy::forward_error::ResponseStarted;

use super::super::body::{
    BufferedBody, read_chunked_body, read_fixed_body, read_until_close_body, relay_chunked_body,
    relay_fixed_body, relay_until_close,
};
use super::super::codec::{ConnectionOverride, Http1ResponseHead};
use super::ForwardTimeouts;
use super::response::{ResponseBodyPlan, relay_body};

/// Whether the router asked for the response to be written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturePlan {
    Capture(CacheKey),
    Bypass,
}

/// How the response body travels to the client, decided once the final head is known.
pub(super) enum CaptureState {
    Relay(CacheStoreResult),
    Buffer {
        key: CacheKey,
        coding: ContentCoding,
        content_type: Option<String>,
    },
}

pub(super) struct ClientResponse<'a> {
    pub head: &'a Http1ResponseHead,
    pub body_plan: ResponseBodyPlan,
    pub connection: Option<ConnectionOverride>,
    pub disposition: Disposition,
}

fn started(err: anyhow::Error) -> anyhow::Error {
    err.context(ResponseStarted)
}

pub(super) fn prepare_capture(
    plan: CapturePlan,
    method: &Method,
    head: &Http1ResponseHead,
    body_plan: ResponseBodyPlan,
    max_entry_size: usize,
) -> CaptureState {
    let CapturePlan::Capture(key) = plan else {
        return CaptureState::Relay(CacheStoreResult::Bypassed);
    };
    if !is_capture_eligible(method, head.status) {
        debug!(key = %key, status = head.status.as_u16(), "response status not cacheable");
        return CaptureState::Relay(CacheStoreResult::Skipped);
    }
    let coding = ContentCoding::from_headers(&head.header_map());
    if let ContentCoding::Other(coding) = &coding {
        debug!(key = %key, coding = %coding, "unsupported content coding; relaying uncached");
        return CaptureState::Relay(CacheStoreResult::Skipped);
    }
    if let ResponseBodyPlan::Fixed(length) = body_plan
        && length > max_entry_size as u64
    {
        debug!(key = %key, length, "declared length exceeds cache entry limit");
        return CaptureState::Relay(CacheStoreResult::Skipped);
    }
    CaptureState::Buffer {
        key,
        coding,
        content_type: head.header_value("content-type").map(str::to_string),
    }
}

impl CaptureState {
    /// Delivers the response head and body to the client. Returns the bytes written and the
    /// capture outcome. Errors raised after the first client write carry [`ResponseStarted`].
    pub(super) async fn respond<S, C>(
        self,
        upstream: &mut BufReader<S>,
        client: &mut C,
        response: ClientResponse<'_>,
        cache: &ResponseCache,
        timeouts: &ForwardTimeouts,
        upstream_peer: SocketAddr,
    ) -> Result<(u64, CacheStoreResult)>
    where
        S: AsyncRead + Unpin,
        C: AsyncWrite + Unpin,
    {
        match self {
            CaptureState::Relay(result) => {
                let head_bytes = write_head(client, &response, response.body_plan, timeouts).await?;
                let body_bytes =
                    relay_body(upstream, client, response.body_plan, timeouts, upstream_peer)
                        .await
                        .map_err(started)?;
                Ok((head_bytes.saturating_add(body_bytes), result))
            }
            CaptureState::Buffer {
                key,
                coding,
                content_type,
            } => {
                let limit = cache.max_entry_size();
                let buffered = match response.body_plan {
                    ResponseBodyPlan::Empty => BufferedBody::Complete(Vec::new()),
                    ResponseBodyPlan::Fixed(length) => BufferedBody::Complete(
                        read_fixed_body(upstream, length as usize, timeouts.upstream_io, upstream_peer)
                            .await?,
                    ),
                    ResponseBodyPlan::Chunked => {
                        read_chunked_body(upstream, limit, timeouts.upstream_io, upstream_peer)
                            .await?
                    }
                    ResponseBodyPlan::UntilClose => {
                        read_until_close_body(upstream, limit, timeouts.upstream_io, upstream_peer)
                            .await?
                    }
                };

                match buffered {
                    BufferedBody::Complete(body) => {
                        let result = cache
                            .capture(
                                &key,
                                CapturedResponse {
                                    body: &body,
                                    coding,
                                    content_type,
                                },
                            )
                            .await;
                        let plan = match response.body_plan {
                            ResponseBodyPlan::Empty => ResponseBodyPlan::Empty,
                            _ => ResponseBodyPlan::Fixed(body.len() as u64),
                        };
                        let head_bytes = write_head(client, &response, plan, timeouts).await?;
                        write_all_with_timeout(
                            client,
                            &body,
                            timeouts.client_io,
                            "writing response body to client",
                        )
                        .await
                        .map_err(started)?;
                        Ok((head_bytes.saturating_add(body.len() as u64), result))
                    }
                    BufferedBody::Overflow {
                        buffered,
                        pending_chunk,
                    } => {
                        debug!(key = %key, "response body exceeds cache entry limit; streaming");
                        let bytes = stream_overflow(
                            upstream,
                            client,
                            &response,
                            buffered,
                            pending_chunk,
                            timeouts,
                            upstream_peer,
                        )
                        .await
                        .map_err(started)?;
                        Ok((bytes, CacheStoreResult::Skipped))
                    }
                }
            }
        }
    }
}

async fn write_head<C>(
    client: &mut C,
    response: &ClientResponse<'_>,
    body_plan: ResponseBodyPlan,
    timeouts: &ForwardTimeouts,
) -> Result<u64>
where
    C: AsyncWrite + Unpin,
{
    let encoded = response
        .head
        .encode(body_plan, response.connection, Some(response.disposition));
    write_all_with_timeout(
        client,
        &encoded,
        timeouts.client_io,
        "writing response head to client",
    )
    .await
    .map_err(started)?;
    Ok(encoded.len() as u64)
}

/// Replays the bytes already buffered with the original framing, then relays the remainder.
async fn stream_overflow<S, C>(
    upstream: &mut BufReader<S>,
    client: &mut C,
    response: &ClientResponse<'_>,
    buffered: Vec<u8>,
    pending_chunk: Option<usize>,
    timeouts: &ForwardTimeouts,
    upstream_peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut total = write_head(client, response, response.body_plan, timeouts).await?;
    match response.body_plan {
        ResponseBodyPlan::Chunked => {
            let mut prefix = Vec::with_capacity(buffered.len() + 32);
            if !buffered.is_empty() {
                prefix.extend_from_slice(format!("{:x}\r\n", buffered.len()).as_bytes());
                prefix.extend_from_slice(&buffered);
                prefix.extend_from_slice(b"\r\n");
            }
            if let Some(size) = pending_chunk {
                prefix.extend_from_slice(format!("{size:x}\r\n").as_bytes());
            }
            write_all_with_timeout(client, &prefix, timeouts.client_io, "writing response body to client")
                .await?;
            total = total.saturating_add(prefix.len() as u64);
            if let Some(size) = pending_chunk {
                // Chunk data plus its CRLF terminator.
                let copied = relay_fixed_body(
                    upstream,
                    client,
                    size as u64 + 2,
                    timeouts.upstream_io,
                    timeouts.client_io,
                    upstream_peer,
                )
                .await?;
                total = total.saturating_add(copied);
            }
            let rest = relay_chunked_body(
                upstream,
                client,
                timeouts.upstream_io,
                timeouts.client_io,
                upstream_peer,
            )
            .await?;
            Ok(total.saturating_add(rest))
        }
        _ => {
            write_all_with_timeout(client, &buffered, timeouts.client_io, "writing response body to client")
                .await?;
            total = total.saturating_add(buffered.len() as u64);
            let rest = relay_until_close(
                upstream,
                client,
                timeouts.upstream_io,
                timeouts.client_io,
                upstream_peer,
            )
            .await?;
            Ok(total.saturating_add(rest))
        }
    }
}
