mod capture;
mod connection;
mod request;
mod response;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::proxy::AppContext;
use crate::proxy::cache::{CacheStoreResult, Disposition};
use crate::proxy::forward_error::is_stale_connection;
use crate::proxy::request::ParsedRequest;

use super::body::BodyPlan;
use super::codec::Http1HeaderAccumulator;
use super::upstream::UpstreamConnection;

pub use capture::CapturePlan;
pub(crate) use connection::UpstreamIo;
pub(crate) use response::ResponseBodyPlan;

pub struct ForwardTimeouts {
    pub connect: Duration,
    pub client_io: Duration,
    pub upstream_io: Duration,
}

impl ForwardTimeouts {
    pub fn from_app(app: &AppContext) -> Self {
        Self {
            connect: app.settings.upstream_connect_timeout(),
            client_io: app.settings.client_timeout(),
            upstream_io: app.settings.upstream_timeout(),
        }
    }
}

/// One client request as handed to the forwarder.
pub struct ForwardRequest<'a> {
    pub parsed: &'a ParsedRequest,
    pub headers: &'a Http1HeaderAccumulator,
    pub body_plan: BodyPlan,
    pub expect_continue: bool,
    pub client_close: bool,
    pub peer: SocketAddr,
    pub capture: CapturePlan,
    pub disposition: Disposition,
}

pub struct ForwardStats {
    pub bytes_to_client: u64,
    pub status: http::StatusCode,
    pub client_body_bytes: u64,
    pub cache_store: CacheStoreResult,
}

pub struct ForwardResult {
    pub stats: ForwardStats,
    pub client_close: bool,
    pub upstream_addr: SocketAddr,
    pub reused_existing: bool,
}

/// Forwards `request` to the origin over a pooled connection when one is idle.
///
/// A bodiless request whose pooled connection turns out to be closed is replayed once on a
/// fresh connection.
pub async fn forward_to_upstream<S>(
    client_reader: &mut BufReader<S>,
    app: &AppContext,
    request: ForwardRequest<'_>,
) -> Result<ForwardResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeouts = ForwardTimeouts::from_app(app);
    let mut allow_reuse = true;
    loop {
        let pooled = if allow_reuse { app.upstreams.take() } else { None };
        let reused_existing = pooled.is_some();
        let mut connection = match pooled {
            Some(conn) => {
                debug!(peer = %conn.peer, "reusing upstream connection");
                conn
            }
            None => {
                UpstreamConnection::connect(&app.origin, app.tls.as_ref(), timeouts.connect).await?
            }
        };
        let upstream_addr = connection.peer;

        let outcome = connection::forward_with_connection(
            client_reader,
            &mut connection,
            &request,
            reused_existing,
            app,
            &timeouts,
        )
        .await;

        match outcome {
            Ok(outcome) => {
                if outcome.reuse_upstream {
                    app.upstreams.put(connection, timeouts.upstream_io);
                } else if let Err(err) = connection.shutdown(timeouts.upstream_io).await {
                    debug!(
                        peer = %upstream_addr,
                        error = %err,
                        "failed to shutdown upstream connection after response"
                    );
                }
                return Ok(ForwardResult {
                    stats: outcome.stats,
                    client_close: outcome.client_close,
                    upstream_addr,
                    reused_existing,
                });
            }
            Err(err) => {
                if let Err(shutdown_err) = connection.shutdown(timeouts.upstream_io).await {
                    debug!(
                        peer = %upstream_addr,
                        error = %shutdown_err,
                        "failed to shutdown upstream connection after error"
                    );
                }
                if reused_existing && is_stale_connection(&err) {
                    debug!(
                        peer = %upstream_addr,
                        error = %err,
                        "pooled upstream connection was stale; retrying on a fresh connection"
                    );
                    allow_reuse = false;
                    continue;
                }
                return Err(err);
            }
        }
    }
}
