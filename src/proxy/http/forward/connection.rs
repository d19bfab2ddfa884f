use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::io_util::write_all_with_timeout;
use crate::proxy::AppContext;
use crate::proxy::forward_error::{ResponseStarted, StaleConnection};
use crate::util::{TimedOut, timeout_with_context};

use super::capture::{ClientResponse, prepare_capture};
use super::request::{build_upstream_request, send_continue_if_needed};
use super::response::{ResponseBodyPlan, determine_response_body_plan, read_final_response_head};
use super::{ForwardRequest, ForwardStats, ForwardTimeouts};
use crate::proxy::http::body::{BodyPlan, stream_chunked_body, stream_fixed_body};
use crate::proxy::http::codec::ConnectionOverride;
use crate::proxy::http::upstream::UpstreamConnection;

pub(crate) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Unpin for UpstreamIo {}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

pub(super) struct ConnectionOutcome {
    pub stats: ForwardStats,
    pub reuse_upstream: bool,
    pub client_close: bool,
}

/// Waits for the first response byte on a reused connection. EOF or a reset here means the
/// origin closed the idle connection before it saw the request.
async fn peek_response<S>(reader: &mut BufReader<S>, timeout: Duration) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) if !buf.is_empty() => Ok(()),
        Ok(Ok(_)) => Err(anyhow!("upstream closed idle connection").context(StaleConnection)),
        Ok(Err(err)) => Err(anyhow::Error::new(err).context(StaleConnection)),
        Err(_) => Err(TimedOut {
            context: "waiting for upstream response head".to_string(),
        }
        .into()),
    }
}

pub(super) async fn forward_with_connection<S>(
    client_reader: &mut BufReader<S>,
    connection: &mut UpstreamConnection,
    request: &ForwardRequest<'_>,
    reused: bool,
    app: &AppContext,
    timeouts: &ForwardTimeouts,
) -> Result<ConnectionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body_plan = request.body_plan;
    let stale_eligible = reused && matches!(body_plan, BodyPlan::Empty);
    let mark_stale = |err: anyhow::Error| {
        if stale_eligible {
            err.context(StaleConnection)
        } else {
            err
        }
    };

    let forwarded_for = request.headers.forwarded_for(&request.peer.ip().to_string());
    let request_bytes = build_upstream_request(
        request.parsed,
        request.headers,
        &app.origin,
        &forwarded_for,
        &body_plan,
        request.expect_continue,
    );
    write_all_with_timeout(
        &mut connection.stream,
        &request_bytes,
        timeouts.upstream_io,
        "sending request headers to upstream",
    )
    .await
    .map_err(mark_stale)?;

    send_continue_if_needed(
        client_reader.get_mut(),
        request.expect_continue,
        body_plan,
        timeouts.client_io,
    )
    .await?;

    let client_body_bytes = match body_plan {
        BodyPlan::Empty => 0,
        BodyPlan::Fixed(length) => {
            stream_fixed_body(
                client_reader,
                &mut connection.stream,
                length,
                timeouts.client_io,
                timeouts.upstream_io,
            )
            .await?
        }
        BodyPlan::Chunked => {
            stream_chunked_body(
                client_reader,
                &mut connection.stream,
                timeouts.client_io,
                timeouts.upstream_io,
                request.peer,
                app.settings.max_request_body_size,
            )
            .await?
        }
    };

    timeout_with_context(
        timeouts.upstream_io,
        connection.stream.flush(),
        "flushing upstream stream",
    )
    .await
    .map_err(mark_stale)?;

    let upstream_peer = connection.peer;
    let mut upstream_reader = BufReader::new(&mut connection.stream);
    if stale_eligible {
        peek_response(&mut upstream_reader, timeouts.upstream_io).await?;
    }
    let (head, informational_bytes) = read_final_response_head(
        &mut upstream_reader,
        client_reader.get_mut(),
        timeouts,
        upstream_peer,
        app.settings.max_response_header_size,
    )
    .await?;

    let method = &request.parsed.method;
    let response_body_plan = determine_response_body_plan(method, head.status, &head);
    // The origin's `Connection: close` only ends the upstream connection; the client keeps
    // its own unless the body is delimited by close.
    let client_close =
        request.client_close || matches!(response_body_plan, ResponseBodyPlan::UntilClose);

    let capture = prepare_capture(
        request.capture.clone(),
        method,
        &head,
        response_body_plan,
        app.cache.max_entry_size(),
    );
    let response = ClientResponse {
        head: &head,
        body_plan: response_body_plan,
        connection: ConnectionOverride::when(client_close),
        disposition: request.disposition,
    };
    let (response_bytes, cache_store) = capture
        .respond(
            &mut upstream_reader,
            client_reader.get_mut(),
            response,
            &app.cache,
            timeouts,
            upstream_peer,
        )
        .await?;

    timeout_with_context(
        timeouts.client_io,
        client_reader.get_mut().flush(),
        "flushing client stream",
    )
    .await
    .map_err(|err| err.context(ResponseStarted))?;

    drop(upstream_reader);

    // Some origins send a body after HEAD, which would desync the next response.
    let reuse_upstream = *method != Method::HEAD
        && !head.connection_close
        && !matches!(response_body_plan, ResponseBodyPlan::UntilClose);

    Ok(ConnectionOutcome {
        stats: ForwardStats {
            bytes_to_client: informational_bytes.saturating_add(response_bytes),
            status: head.status,
            client_body_bytes,
            cache_store,
        },
        reuse_upstream,
        client_close,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex};

    #[tokio::test]
    async fn peek_flags_closed_connection_as_stale() -> anyhow::Result<()> {
        let (server, client) = duplex(64);
        drop(server);
        let mut reader = BufReader::new(client);
        let err = peek_response(&mut reader, Duration::from_secs(1))
            .await
            .expect_err("closed connection");
        assert!(err.downcast_ref::<StaleConnection>().is_some(), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn peek_passes_when_response_arrives() -> anyhow::Result<()> {
        let (mut server, client) = duplex(64);
        server.write_all(b"HTTP/1.1 200 OK\r\n").await?;
        let mut reader = BufReader::new(client);
        peek_response(&mut reader, Duration::from_secs(1)).await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn peek_timeout_is_not_stale() {
        let (_server, client) = duplex(64);
        let mut reader = BufReader::new(client);
        let err = peek_response(&mut reader, Duration::from_millis(10))
            .await
            .expect_err("timeout");
        assert!(err.downcast_ref::<StaleConnection>().is_none());
        assert!(err.downcast_ref::<TimedOut>().is_some());
    }
}
