use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::proxy::AppContext;

use super::dispatch;

pub async fn handle_http(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    serve_connection(stream, peer, &app).await
}

/// Serves HTTP/1.x over any byte stream, one request at a time.
pub async fn serve_connection<S>(stream: S, peer: SocketAddr, app: &AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    dispatch::serve_http_loop(stream, peer, app).await
}
