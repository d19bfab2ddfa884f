use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::proxy::cache::{CacheStoreResult, Disposition};
use crate::proxy::forward_error::{classify_forward_error, log_forward_error, response_started};

use super::ClientDisposition;
use super::handler::Http1RequestHandler;
use super::respond::{LocalResponse, respond_with_access_log, shutdown_stream};

use super::super::forward::{CapturePlan, ForwardRequest, forward_to_upstream};

pub(super) async fn forward_and_respond<S>(
    handler: &mut Http1RequestHandler<'_, S>,
    capture: CapturePlan,
    disposition: Disposition,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let request = ForwardRequest {
        parsed: handler.parsed,
        headers: &handler.headers,
        body_plan: handler.body_plan,
        expect_continue: handler.expect_continue,
        client_close: handler.close_requested,
        peer: handler.peer,
        capture,
        disposition,
    };
    let client_timeout = handler.app.settings.client_timeout();

    match forward_to_upstream(handler.reader, handler.app, request).await {
        Ok(success) => {
            handler
                .log_tracker
                .add_client_bytes(success.stats.client_body_bytes);
            let builder = handler
                .access_log()
                .disposition(disposition)
                .cache_store(success.stats.cache_store)
                .status(success.stats.status)
                .upstream_addr(success.upstream_addr.to_string())
                .upstream_reused(success.reused_existing);
            handler
                .log_tracker
                .finish(builder, success.stats.bytes_to_client)
                .log();

            if success.client_close {
                shutdown_stream(handler.reader.get_mut(), client_timeout).await?;
            }
            Ok(ClientDisposition::when_close(success.client_close))
        }
        Err(err) => {
            let kind = classify_forward_error(&err);
            log_forward_error(&kind, handler.peer, &handler.parsed.path, &err);
            let builder = handler
                .access_log()
                .disposition(disposition)
                .cache_store(CacheStoreResult::Bypassed)
                .error_reason(kind.reason())
                .error_detail(format!("{err:#}"));

            if response_started(&err) {
                // Part of the upstream response is already on the wire.
                handler
                    .log_tracker
                    .finish(builder.status(kind.status()), 0)
                    .log();
                return Ok(ClientDisposition::Close);
            }

            respond_with_access_log(
                handler.reader.get_mut(),
                LocalResponse::new(kind.status(), kind.body().as_bytes())
                    .with_disposition(disposition),
                client_timeout,
                handler.log_tracker.bytes_in(),
                handler.log_tracker.elapsed(),
                builder,
            )
            .await?;
            Ok(ClientDisposition::Close)
        }
    }
}
