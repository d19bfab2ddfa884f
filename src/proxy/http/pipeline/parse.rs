use anyhow::Result;
use http::StatusCode;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::warn;

use crate::logging::AccessLogBuilder;
use crate::proxy::cache::Disposition;
use crate::proxy::{
    AppContext,
    forward_limits::RequestLogTracker,
    request::{parse_http1_request, redacted_path},
    request_pipeline,
};

use super::handler::Http1RequestHandler;
use super::respond::{LocalResponse, respond_with_access_log};
use super::{ClientDisposition, RequestContext};

use super::super::body::BodyPlan;

/// Validates one request head, then hands it to the cache router.
pub async fn handle_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    ctx: RequestContext,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let total_request_bytes = ctx.total_request_bytes();
    let RequestContext {
        method,
        target,
        headers,
        close_requested,
        request_line_bytes: _,
        header_bytes: _,
        start,
    } = ctx;
    let client_timeout = app.settings.client_timeout();
    let log_path = if app.settings.log_queries {
        target.clone()
    } else {
        redacted_path(&target)
    };
    let error_log = || {
        AccessLogBuilder::new(peer)
            .method(method.as_str())
            .path(log_path.clone())
    };

    let expect_continue = match headers.expect_continue() {
        Ok(value) => value,
        Err(err) => {
            warn!(peer = %peer, error = %err, "unsupported Expect header");
            respond_with_access_log(
                reader.get_mut(),
                LocalResponse::new(StatusCode::EXPECTATION_FAILED, b"expectation failed\r\n"),
                client_timeout,
                total_request_bytes,
                start.elapsed(),
                error_log().error_reason("expectation_failed"),
            )
            .await?;
            return Ok(ClientDisposition::Close);
        }
    };

    let content_length = headers.content_length();
    if !headers.is_chunked()
        && let Some(length) = content_length
        && length > app.settings.max_request_body_size
    {
        warn!(
            peer = %peer,
            length,
            max = app.settings.max_request_body_size,
            "request body exceeds limit"
        );
        respond_with_access_log(
            reader.get_mut(),
            LocalResponse::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                b"request body exceeds configured limit\r\n",
            )
            .with_disposition(Disposition::for_method(&method)),
            client_timeout,
            total_request_bytes,
            start.elapsed(),
            error_log().error_reason("request_body_too_large"),
        )
        .await?;
        return Ok(ClientDisposition::Close);
    }

    let body_plan = if headers.is_chunked() {
        BodyPlan::Chunked
    } else {
        match content_length {
            Some(length) if length > 0 => BodyPlan::Fixed(length),
            _ => BodyPlan::Empty,
        }
    };

    let parsed = match parse_http1_request(method.clone(), &target) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(peer = %peer, error = ?err, "failed to parse HTTP request target");
            respond_with_access_log(
                reader.get_mut(),
                LocalResponse::new(StatusCode::BAD_REQUEST, b"invalid request target\r\n"),
                client_timeout,
                total_request_bytes,
                start.elapsed(),
                error_log().error_reason("invalid_target"),
            )
            .await?;
            return Ok(ClientDisposition::Close);
        }
    };

    let mut handler = Http1RequestHandler {
        reader,
        app,
        headers,
        body_plan,
        close_requested,
        log_tracker: RequestLogTracker::new(total_request_bytes, start),
        peer,
        parsed: &parsed,
        expect_continue,
    };
    request_pipeline::route_request(&app.cache, &parsed, &mut handler).await
}
