use std::collections::VecDeque;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::origin::{Origin, Scheme};
use crate::proxy::upstream;
use crate::util::timeout_with_context;

use super::forward::UpstreamIo;
use super::pipeline::shutdown_stream;

/// Idle keep-alive connections to the origin, shared by every client connection.
///
/// The most recently returned connection is handed out first; once `capacity` is reached the
/// oldest idle connection is closed.
pub struct UpstreamPool {
    idle: Mutex<VecDeque<UpstreamConnection>>,
    capacity: NonZeroUsize,
}

pub(crate) struct UpstreamConnection {
    pub(crate) stream: UpstreamIo,
    pub(crate) peer: SocketAddr,
}

impl UpstreamPool {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::with_capacity(capacity.get())),
            capacity,
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub(crate) fn take(&self) -> Option<UpstreamConnection> {
        self.idle.lock().pop_back()
    }

    pub(crate) fn put(&self, conn: UpstreamConnection, shutdown_timeout: Duration) {
        let evicted = {
            let mut idle = self.idle.lock();
            idle.push_back(conn);
            if idle.len() > self.capacity.get() {
                idle.pop_front()
            } else {
                None
            }
        };
        if let Some(mut evicted) = evicted {
            tokio::spawn(async move {
                if let Err(err) = evicted.shutdown(shutdown_timeout).await {
                    debug!(
                        peer = %evicted.peer,
                        error = %err,
                        "failed to shutdown evicted upstream connection"
                    );
                }
            });
        }
    }

    pub async fn shutdown_all(&self, timeout: Duration) {
        let drained: Vec<UpstreamConnection> = self.idle.lock().drain(..).collect();
        for mut conn in drained {
            if let Err(err) = conn.shutdown(timeout).await {
                debug!(
                    peer = %conn.peer,
                    error = %err,
                    "failed to shutdown idle upstream connection"
                );
            }
        }
    }
}

impl UpstreamConnection {
    pub(crate) async fn connect(
        origin: &Origin,
        tls: Option<&Arc<ClientConfig>>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let (upstream_tcp, peer) = upstream::connect_origin(origin, connect_timeout).await?;
        let stream = match origin.scheme() {
            Scheme::Http => UpstreamIo::Plain(upstream_tcp),
            Scheme::Https => {
                let config = tls.ok_or_else(|| anyhow!("TLS client is not configured"))?;
                let server_name = ServerName::try_from(origin.host().to_string())
                    .map_err(|_| anyhow!("invalid origin host for TLS '{}'", origin.host()))?;
                let connector = TlsConnector::from(config.clone());
                let tls_stream = timeout_with_context(
                    connect_timeout,
                    connector.connect(server_name, upstream_tcp),
                    format!("establishing TLS with origin {}", origin.authority()),
                )
                .await
                .with_context(|| format!("TLS handshake with {peer} failed"))?;
                UpstreamIo::Tls(Box::new(tls_stream))
            }
        };
        debug!(peer = %peer, scheme = origin.scheme().as_str(), "opened upstream connection");
        Ok(Self { stream, peer })
    }

    pub(crate) async fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        shutdown_stream(&mut self.stream, timeout).await
    }
}
