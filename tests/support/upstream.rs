use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Canned origin response, written verbatim after each request head.
#[derive(Clone)]
pub struct UpstreamReply {
    raw: Arc<Vec<u8>>,
}

impl UpstreamReply {
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            raw: Arc::new(bytes.into()),
        }
    }

    pub fn ok(content_type: &str, body: &[u8]) -> Self {
        Self::with_status("200 OK", &[("Content-Type", content_type)], body)
    }

    pub fn with_status(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Self {
        let mut raw = format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\n", body.len());
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str("Connection: close\r\n\r\n");
        let mut raw = raw.into_bytes();
        raw.extend_from_slice(body);
        Self::raw(raw)
    }

    pub fn chunked(content_type: &str, chunks: &[&[u8]]) -> Self {
        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
        )
        .into_bytes();
        for chunk in chunks {
            raw.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            raw.extend_from_slice(chunk);
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"0\r\n\r\n");
        Self::raw(raw)
    }
}

/// Origin server that counts requests and records their heads.
pub struct MockUpstream {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    heads: Arc<Mutex<Vec<String>>>,
    reply: Arc<Mutex<UpstreamReply>>,
    handle: JoinHandle<()>,
}

impl MockUpstream {
    pub async fn spawn(reply: UpstreamReply) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let heads = Arc::new(Mutex::new(Vec::new()));
        let reply = Arc::new(Mutex::new(reply));

        let handle = {
            let requests = requests.clone();
            let heads = heads.clone();
            let reply = reply.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => break,
                    };
                    let requests = requests.clone();
                    let heads = heads.clone();
                    let reply = reply.clone();
                    tokio::spawn(async move {
                        let _ = handle_connection(stream, requests, heads, reply).await;
                    });
                }
            })
        };

        Ok(Self {
            addr,
            requests,
            heads,
            reply,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn request_heads(&self) -> Vec<String> {
        self.heads.lock().clone()
    }

    /// Changes what later requests receive.
    pub fn set_reply(&self, reply: UpstreamReply) {
        *self.reply.lock() = reply;
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    requests: Arc<AtomicUsize>,
    heads: Arc<Mutex<Vec<String>>>,
    reply: Arc<Mutex<UpstreamReply>>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    while !data.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        data.extend_from_slice(&buf[..n]);
    }

    let head_end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .unwrap_or(data.len());
    let head = String::from_utf8_lossy(&data[..head_end]).into_owned();
    let body_len = content_length(&head);
    while data.len() - head_end < body_len {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }

    requests.fetch_add(1, Ordering::SeqCst);
    heads.lock().push(head);

    let response = reply.lock().raw.clone();
    stream.write_all(&response).await?;
    stream.shutdown().await.ok();
    Ok(())
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
