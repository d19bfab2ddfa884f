use std::net::SocketAddr;

use anyhow::{Result, bail};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::io_util::write_all_with_timeout;
use crate::util::timeout_with_context;

use super::super::body::{relay_chunked_body, relay_fixed_body, relay_until_close};
use super::super::codec::{Http1ResponseHead, read_http1_response_head};
use super::ForwardTimeouts;

/// Framing of an upstream response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResponseBodyPlan {
    Chunked,
    Fixed(u64),
    Empty,
    UntilClose,
}

/// Reads response heads until a final one arrives, relaying interim 1xx heads to the client.
pub(super) async fn read_final_response_head<S, C>(
    upstream_reader: &mut BufReader<S>,
    client: &mut C,
    timeouts: &ForwardTimeouts,
    upstream_peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<(Http1ResponseHead, u64)>
where
    S: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut informational_bytes = 0u64;
    loop {
        let mut head = read_http1_response_head(
            upstream_reader,
            timeouts.upstream_io,
            upstream_peer,
            max_header_bytes,
        )
        .await?;

        if head.status == StatusCode::SWITCHING_PROTOCOLS {
            bail!("upstream attempted protocol upgrade (101 Switching Protocols)");
        }
        if !head.status.is_informational() {
            return Ok((head, informational_bytes));
        }

        if head.transfer_encoding_present || head.content_length.is_some_and(|len| len > 0) {
            bail!("informational response must not include a body");
        }
        head.content_length = None;
        let encoded = head.encode(ResponseBodyPlan::Empty, None, None);
        write_all_with_timeout(
            client,
            &encoded,
            timeouts.client_io,
            "writing informational response to client",
        )
        .await?;
        timeout_with_context(
            timeouts.client_io,
            client.flush(),
            "flushing informational response to client",
        )
        .await?;
        informational_bytes = informational_bytes.saturating_add(encoded.len() as u64);
    }
}

pub(crate) fn determine_response_body_plan(
    method: &Method,
    status: StatusCode,
    head: &Http1ResponseHead,
) -> ResponseBodyPlan {
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::RESET_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return ResponseBodyPlan::Empty;
    }

    if head.chunked {
        return ResponseBodyPlan::Chunked;
    }

    match head.content_length {
        Some(length) => ResponseBodyPlan::Fixed(length),
        None => ResponseBodyPlan::UntilClose,
    }
}

pub(super) async fn relay_body<S, C>(
    upstream: &mut BufReader<S>,
    client: &mut C,
    body_plan: ResponseBodyPlan,
    timeouts: &ForwardTimeouts,
    upstream_peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    match body_plan {
        ResponseBodyPlan::Empty => Ok(0),
        ResponseBodyPlan::Fixed(length) => {
            relay_fixed_body(
                upstream,
                client,
                length,
                timeouts.upstream_io,
                timeouts.client_io,
                upstream_peer,
            )
            .await
        }
        ResponseBodyPlan::Chunked => {
            relay_chunked_body(
                upstream,
                client,
                timeouts.upstream_io,
                timeouts.client_io,
                upstream_peer,
            )
            .await
        }
        ResponseBodyPlan::UntilClose => {
            relay_until_close(
                upstream,
                client,
                timeouts.upstream_io,
                timeouts.client_io,
                upstream_peer,
            )
            .await
        }
    }
}
