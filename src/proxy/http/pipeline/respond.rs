use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::io_util::write_all_with_timeout;
use crate::logging::AccessLogBuilder;
use crate::proxy::cache::Disposition;
use crate::util::timeout_with_context;

use super::super::codec::CACHE_STATUS_HEADER;

/// A proxy-generated response that ends the client connection.
pub struct LocalResponse<'a> {
    pub status: StatusCode,
    pub body: &'a [u8],
    pub disposition: Option<Disposition>,
}

impl<'a> LocalResponse<'a> {
    pub fn new(status: StatusCode, body: &'a [u8]) -> Self {
        Self {
            status,
            body,
            disposition: None,
        }
    }

    pub fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = Some(disposition);
        self
    }
}

/// Sends `response`, closes the stream and emits the access log entry.
pub async fn respond_with_access_log<S>(
    stream: &mut S,
    response: LocalResponse<'_>,
    timeout_dur: Duration,
    bytes_in: u64,
    elapsed: Duration,
    log_builder: AccessLogBuilder,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes_out = send_response(stream, &response, timeout_dur).await?;
    shutdown_stream(stream, timeout_dur).await?;
    let log_builder = match response.disposition {
        Some(disposition) => log_builder.disposition(disposition),
        None => log_builder,
    };
    log_builder
        .status(response.status)
        .bytes(bytes_in, bytes_out as u64)
        .elapsed(elapsed)
        .log();
    Ok(())
}

pub async fn send_response<S>(
    stream: &mut S,
    response: &LocalResponse<'_>,
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let status = response.status;
    let mut header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain; charset=utf-8\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown"),
        response.body.len()
    );
    if let Some(disposition) = response.disposition {
        header.push_str(&format!("{CACHE_STATUS_HEADER}: {}\r\n", disposition.as_str()));
    }
    header.push_str("\r\n");
    write_all_with_timeout(
        stream,
        header.as_bytes(),
        timeout_dur,
        "writing response header",
    )
    .await?;
    let mut written = header.len();
    if !response.body.is_empty() {
        write_all_with_timeout(stream, response.body, timeout_dur, "writing response body").await?;
        written += response.body.len();
    }
    Ok(written)
}

pub async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(timeout_dur, stream.shutdown(), "shutting down stream").await
}
