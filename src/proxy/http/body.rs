use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{
    proxy::{forward_limits::BodySizeTracker, http::codec::read_line_with_timeout},
    util::timeout_with_context,
};

const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const COPY_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
#[error("request body exceeds configured limit")]
pub struct BodyTooLarge {
    pub bytes_read: u64,
}

/// Framing of the client request body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(usize),
    Chunked,
}

/// A response body read into memory for capture.
#[derive(Debug, PartialEq, Eq)]
pub enum BufferedBody {
    Complete(Vec<u8>),
    /// The body outgrew the capture limit. `buffered` holds the decoded bytes read so far; for
    /// chunked bodies `pending_chunk` is the size of the chunk whose size line was already
    /// consumed but whose data was not.
    Overflow {
        buffered: Vec<u8>,
        pending_chunk: Option<usize>,
    },
}

pub(crate) fn parse_chunk_size(line: &str) -> Result<usize> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let size_str = trimmed
        .split_once(';')
        .map(|(size, _)| size)
        .unwrap_or(trimmed)
        .trim();
    usize::from_str_radix(size_str, 16).with_context(|| format!("invalid chunk size '{size_str}'"))
}

pub async fn stream_fixed_body<S, U>(
    reader: &mut BufReader<S>,
    upstream: &mut U,
    mut remaining: usize,
    client_timeout: Duration,
    upstream_timeout: Duration,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    let mut transferred = 0u64;
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    while remaining > 0 {
        let to_read = remaining.min(buffer.len());
        let read = timeout_with_context(
            client_timeout,
            reader.read(&mut buffer[..to_read]),
            "reading request body from client",
        )
        .await?;
        if read == 0 {
            bail!("unexpected EOF while reading request body from client");
        }
        remaining -= read;
        timeout_with_context(
            upstream_timeout,
            upstream.write_all(&buffer[..read]),
            "writing request body to upstream",
        )
        .await?;
        transferred = transferred.saturating_add(read as u64);
    }
    Ok(transferred)
}

async fn relay_chunked_body_generic<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    read_timeout: Duration,
    write_timeout: Duration,
    peer: SocketAddr,
    write_target: &str,
    mut limit: Option<&mut BodySizeTracker>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total_bytes = 0u64;
    let mut line = String::new();

    loop {
        let size_bytes =
            read_line_with_timeout(reader, &mut line, read_timeout, peer, MAX_CHUNK_LINE_LENGTH)
                .await?;
        if size_bytes == 0 {
            bail!("unexpected EOF while reading chunk size from {peer}");
        }
        total_bytes = total_bytes.saturating_add(size_bytes as u64);
        let chunk_size = parse_chunk_size(&line)?;

        if let Some(limit_tracker) = limit.as_deref_mut() {
            limit_tracker.record(chunk_size)?;
        }

        timeout_with_context(
            write_timeout,
            writer.write_all(line.as_bytes()),
            format!("forwarding chunk size {write_target}"),
        )
        .await?;

        if chunk_size == 0 {
            loop {
                let trailer_bytes = read_line_with_timeout(
                    reader,
                    &mut line,
                    read_timeout,
                    peer,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if trailer_bytes == 0 {
                    bail!("unexpected EOF while reading chunk trailer from {peer}");
                }
                timeout_with_context(
                    write_timeout,
                    writer.write_all(line.as_bytes()),
                    format!("forwarding chunk trailer {write_target}"),
                )
                .await?;
                total_bytes = total_bytes.saturating_add(trailer_bytes as u64);
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            break;
        }

        let mut remaining = chunk_size;
        let mut buffer = [0u8; COPY_BUFFER_SIZE];
        while remaining > 0 {
            let to_read = remaining.min(buffer.len());
            let read = timeout_with_context(
                read_timeout,
                reader.read(&mut buffer[..to_read]),
                format!("reading chunk data from {peer}"),
            )
            .await?;
            if read == 0 {
                bail!("unexpected EOF while reading chunk data from {peer}");
            }
            remaining -= read;
            timeout_with_context(
                write_timeout,
                writer.write_all(&buffer[..read]),
                format!("forwarding chunk data {write_target}"),
            )
            .await?;
            total_bytes = total_bytes.saturating_add(read as u64);
        }

        read_chunk_terminator(reader, read_timeout, peer).await?;
        timeout_with_context(
            write_timeout,
            writer.write_all(b"\r\n"),
            format!("forwarding chunk terminator {write_target}"),
        )
        .await?;
        total_bytes = total_bytes.saturating_add(2);
    }

    Ok(total_bytes)
}

async fn read_chunk_terminator<R>(
    reader: &mut BufReader<R>,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut crlf = [0u8; 2];
    timeout_with_context(
        read_timeout,
        reader.read_exact(&mut crlf),
        format!("reading chunk terminator from {peer}"),
    )
    .await?;
    if &crlf != b"\r\n" {
        bail!("invalid chunk terminator when reading from {peer}");
    }
    Ok(())
}

pub async fn stream_chunked_body<S, U>(
    reader: &mut BufReader<S>,
    upstream: &mut U,
    client_timeout: Duration,
    upstream_timeout: Duration,
    peer: SocketAddr,
    max_body_size: usize,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    let mut tracker = BodySizeTracker::new(max_body_size);
    relay_chunked_body_generic(
        reader,
        upstream,
        client_timeout,
        upstream_timeout,
        peer,
        "to upstream",
        Some(&mut tracker),
    )
    .await
}

pub async fn relay_fixed_body<S, C>(
    upstream: &mut BufReader<S>,
    client: &mut C,
    mut remaining: u64,
    upstream_timeout: Duration,
    client_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut transferred = 0u64;
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let read = timeout_with_context(
            upstream_timeout,
            upstream.read(&mut buffer[..to_read]),
            format!("reading upstream response body from {peer}"),
        )
        .await?;
        if read == 0 {
            bail!("upstream closed connection early while sending response body");
        }
        remaining -= read as u64;
        timeout_with_context(
            client_timeout,
            client.write_all(&buffer[..read]),
            "writing response body to client",
        )
        .await?;
        transferred = transferred.saturating_add(read as u64);
    }
    Ok(transferred)
}

pub async fn relay_chunked_body<S, C>(
    upstream: &mut BufReader<S>,
    client: &mut C,
    upstream_timeout: Duration,
    client_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    relay_chunked_body_generic(
        upstream,
        client,
        upstream_timeout,
        client_timeout,
        peer,
        "to client",
        None,
    )
    .await
}

pub async fn relay_until_close<S, C>(
    upstream: &mut BufReader<S>,
    client: &mut C,
    upstream_timeout: Duration,
    client_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    loop {
        let read = timeout_with_context(
            upstream_timeout,
            upstream.read(&mut buffer),
            format!("reading response body from upstream {peer}"),
        )
        .await?;
        if read == 0 {
            break;
        }
        timeout_with_context(
            client_timeout,
            client.write_all(&buffer[..read]),
            "writing response body to client",
        )
        .await?;
        total = total.saturating_add(read as u64);
    }
    Ok(total)
}

/// Reads exactly `length` bytes of a Content-Length framed response body.
pub async fn read_fixed_body<S>(
    upstream: &mut BufReader<S>,
    length: usize,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = vec![0u8; length];
    timeout_with_context(
        read_timeout,
        upstream.read_exact(&mut body),
        format!("reading upstream response body from {peer}"),
    )
    .await?;
    Ok(body)
}

/// Decodes a chunked response body into memory, stopping before the first chunk that would
/// take the total past `limit`. Trailers are consumed and dropped.
pub async fn read_chunked_body<S>(
    upstream: &mut BufReader<S>,
    limit: usize,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<BufferedBody>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = String::new();

    loop {
        let size_bytes = read_line_with_timeout(
            upstream,
            &mut line,
            read_timeout,
            peer,
            MAX_CHUNK_LINE_LENGTH,
        )
        .await?;
        if size_bytes == 0 {
            bail!("unexpected EOF while reading chunk size from {peer}");
        }
        let chunk_size = parse_chunk_size(&line)?;

        if chunk_size == 0 {
            loop {
                let trailer_bytes = read_line_with_timeout(
                    upstream,
                    &mut line,
                    read_timeout,
                    peer,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if trailer_bytes == 0 {
                    bail!("unexpected EOF while reading chunk trailer from {peer}");
                }
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            return Ok(BufferedBody::Complete(body));
        }

        if body.len().saturating_add(chunk_size) > limit {
            return Ok(BufferedBody::Overflow {
                buffered: body,
                pending_chunk: Some(chunk_size),
            });
        }

        let start = body.len();
        body.resize(start + chunk_size, 0);
        timeout_with_context(
            read_timeout,
            upstream.read_exact(&mut body[start..]),
            format!("reading chunk data from {peer}"),
        )
        .await?;
        read_chunk_terminator(upstream, read_timeout, peer).await?;
    }
}

/// Reads a close-delimited response body until EOF or until more than `limit` bytes arrived.
pub async fn read_until_close_body<S>(
    upstream: &mut BufReader<S>,
    limit: usize,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<BufferedBody>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    loop {
        let read = timeout_with_context(
            read_timeout,
            upstream.read(&mut buffer),
            format!("reading response body from upstream {peer}"),
        )
        .await?;
        if read == 0 {
            return Ok(BufferedBody::Complete(body));
        }
        body.extend_from_slice(&buffer[..read]);
        if body.len() > limit {
            return Ok(BufferedBody::Overflow {
                buffered: body,
                pending_chunk: None,
            });
        }
    }
}
