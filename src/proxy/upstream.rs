use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::debug;

use crate::origin::Origin;
use crate::util::timeout_with_context;

/// Attempt to connect to the supplied socket addresses without performing name resolution.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on upstream stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to upstream");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err =
                    Some(anyhow::Error::new(err).context(format!("failed to connect to {addr}")));
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses provided for upstream connect")))
}

/// Resolves the origin host, re-resolving on every call so DNS changes are picked up.
pub async fn resolve_origin(origin: &Origin, resolve_timeout: Duration) -> Result<Vec<SocketAddr>> {
    let host = origin.host();
    let port = origin.port();
    let addrs: Vec<SocketAddr> = if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        vec![SocketAddr::new(ip, port)]
    } else {
        timeout_with_context(
            resolve_timeout,
            lookup_host((host, port)),
            format!("resolving origin {host}:{port}"),
        )
        .await?
        .collect()
    };
    if addrs.is_empty() {
        bail!("origin {host}:{port} resolved to no addresses");
    }
    Ok(addrs)
}

/// Resolves the origin and connects to the first reachable address.
pub async fn connect_origin(
    origin: &Origin,
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let addrs = resolve_origin(origin, connect_timeout).await?;
    connect_to_addrs(&addrs, connect_timeout)
        .await
        .with_context(|| format!("failed to connect to origin {}", origin.authority()))
}
