use std::{net::SocketAddr, time::Instant};

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, warn};

use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;
use crate::util::TimedOut;

use super::codec::{Http1RequestHead, read_http1_request_head};
use super::pipeline::{
    ClientDisposition, LocalResponse, RequestContext, handle_request, respond_with_access_log,
};

/// Serves requests on one client connection until either side asks to close.
pub(super) async fn serve_http_loop<S>(stream: S, peer: SocketAddr, app: &AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_timeout = app.settings.client_timeout();
    let max_header_size = app.settings.max_request_header_size;
    let mut reader = BufReader::new(stream);

    loop {
        let start = Instant::now();
        let head = match read_http1_request_head(
            &mut reader,
            peer,
            client_timeout,
            client_timeout,
            max_header_size,
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) if err.downcast_ref::<TimedOut>().is_some() => {
                debug!(peer = %peer, error = %err, "client request head timed out");
                break;
            }
            Err(err) => {
                warn!(peer = %peer, error = %format!("{err:#}"), "malformed request head");
                respond_with_access_log(
                    reader.get_mut(),
                    LocalResponse::new(StatusCode::BAD_REQUEST, b"bad request\r\n"),
                    client_timeout,
                    0,
                    start.elapsed(),
                    AccessLogBuilder::new(peer).error_reason("malformed_request"),
                )
                .await?;
                break;
            }
        };

        let close_requested = head.wants_close();
        let Http1RequestHead {
            method,
            target,
            headers,
            request_line_bytes,
            header_bytes,
            ..
        } = head;
        let ctx = RequestContext {
            method,
            target,
            headers,
            close_requested,
            request_line_bytes,
            header_bytes,
            start,
        };

        match handle_request(&mut reader, peer, app, ctx).await? {
            ClientDisposition::Continue => continue,
            ClientDisposition::Close => break,
        }
    }

    Ok(())
}
