use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, StatusCode, Version};
use tokio::io::{AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::warn;

use crate::proxy::cache::{CachedReply, Disposition};
use crate::proxy::forward_limits::HeaderBudget;
use crate::proxy::http::forward::ResponseBodyPlan;

use super::headers::{Http1HeaderLine, header_lines_to_map};
use super::line::read_line_with_deadline;

pub(crate) const CACHE_STATUS_HEADER: &str = "X-Cache";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionOverride {
    Close,
}

impl ConnectionOverride {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionOverride::Close => "close",
        }
    }

    pub fn when(close: bool) -> Option<Self> {
        close.then_some(ConnectionOverride::Close)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Http1ResponseHead {
    pub status_line: String,
    pub status: StatusCode,
    pub headers: Vec<Http1HeaderLine>,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub transfer_encoding_present: bool,
    pub connection_close: bool,
}

fn is_hop_by_hop(lower_name: &str) -> bool {
    matches!(
        lower_name,
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "upgrade"
    )
}

fn push_header(buffer: &mut Vec<u8>, name: &str, value: &str) {
    buffer.extend_from_slice(name.as_bytes());
    buffer.extend_from_slice(b": ");
    buffer.extend_from_slice(value.as_bytes());
    buffer.extend_from_slice(b"\r\n");
}

impl Http1ResponseHead {
    /// Re-encodes the head for the client with framing headers rewritten for `body_plan`.
    /// Any `X-Cache` sent by the origin is replaced by the proxy's own disposition.
    pub fn encode(
        &self,
        body_plan: ResponseBodyPlan,
        override_connection: Option<ConnectionOverride>,
        disposition: Option<Disposition>,
    ) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(self.status_line.as_bytes());
        buffer.extend_from_slice(b"\r\n");

        let mut connection_tokens = HashSet::new();
        for header in &self.headers {
            if header.lower_name() == "connection" {
                for token in header.value.split(',') {
                    let token = token.trim();
                    if token.is_empty() {
                        continue;
                    }
                    connection_tokens.insert(token.to_ascii_lowercase());
                }
            }
        }

        let mut transfer_encodings = Vec::new();
        let mut trailers = Vec::new();

        for header in &self.headers {
            let name_lower = header.lower_name();
            match name_lower {
                "transfer-encoding" => {
                    transfer_encodings.push(header.value.clone());
                    continue;
                }
                "trailer" => {
                    trailers.push(header.value.clone());
                    continue;
                }
                "content-length" | "x-cache" => continue,
                _ => {}
            }
            if is_hop_by_hop(name_lower) || connection_tokens.contains(name_lower) {
                continue;
            }
            push_header(&mut buffer, &header.name, &header.value);
        }

        match body_plan {
            ResponseBodyPlan::Chunked => {
                let value = if transfer_encodings.is_empty() {
                    "chunked".to_string()
                } else {
                    transfer_encodings.join(", ")
                };
                push_header(&mut buffer, "Transfer-Encoding", &value);
                if !trailers.is_empty() {
                    push_header(&mut buffer, "Trailer", &trailers.join(", "));
                }
            }
            ResponseBodyPlan::Fixed(length) => {
                push_header(&mut buffer, "Content-Length", &length.to_string());
            }
            ResponseBodyPlan::Empty => {
                if let Some(length) = self.content_length {
                    push_header(&mut buffer, "Content-Length", &length.to_string());
                }
            }
            ResponseBodyPlan::UntilClose => {
                if !transfer_encodings.is_empty() {
                    push_header(&mut buffer, "Transfer-Encoding", &transfer_encodings.join(", "));
                }
            }
        }

        if let Some(disposition) = disposition {
            push_header(&mut buffer, CACHE_STATUS_HEADER, disposition.as_str());
        }
        if let Some(connection) = override_connection {
            push_header(&mut buffer, "Connection", connection.as_str());
        }

        buffer.extend_from_slice(b"\r\n");
        buffer
    }

    pub fn header_map(&self) -> HeaderMap {
        header_lines_to_map(self.headers.iter())
    }

    pub fn header_value(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.lower_name() == lower_name)
            .map(|header| header.value.as_str())
    }
}

/// Head of a response served from the cache. `Content-Length` describes `reply.body`; a HEAD
/// entry stores no body, so `head_only` leaves the length out rather than announce zero.
pub(crate) fn encode_hit_response(
    reply: &CachedReply,
    head_only: bool,
    override_connection: Option<ConnectionOverride>,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(192);
    buffer.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    push_header(&mut buffer, "Content-Type", &reply.content_type);
    if let Some(encoding) = reply.content_encoding {
        push_header(&mut buffer, "Content-Encoding", encoding);
    }
    if reply.vary_accept_encoding {
        push_header(&mut buffer, "Vary", "Accept-Encoding");
    }
    if !head_only {
        push_header(&mut buffer, "Content-Length", &reply.body.len().to_string());
    }
    push_header(&mut buffer, CACHE_STATUS_HEADER, Disposition::Hit.as_str());
    if let Some(connection) = override_connection {
        push_header(&mut buffer, "Connection", connection.as_str());
    }
    buffer.extend_from_slice(b"\r\n");
    buffer
}

pub(crate) async fn read_http1_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Http1ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max response header size must be greater than zero"
    );
    let deadline = Instant::now() + timeout_dur;
    let mut status_line = String::new();
    let mut budget = HeaderBudget::new(
        max_header_bytes,
        "upstream response headers exceed configured limit",
    )?;

    let bytes = read_line_with_deadline(
        reader,
        &mut status_line,
        deadline,
        peer,
        max_header_bytes,
        "upstream status line",
    )
    .await?;
    if bytes == 0 {
        bail!("upstream closed connection before sending status line");
    }
    budget.record(bytes)?;
    let trimmed = status_line.trim_end_matches(['\r', '\n']);
    let (version, status, _) = parse_http1_status_line(trimmed)?;

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut transfer_encoding_present = false;
    let mut connection_close = version == Version::HTTP_10;

    let mut header_line = String::new();
    loop {
        let read = read_line_with_deadline(
            reader,
            &mut header_line,
            deadline,
            peer,
            max_header_bytes,
            "upstream header",
        )
        .await?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        budget.record(read)?;
        let trimmed_line = header_line.trim_end_matches(['\r', '\n']);
        if trimmed_line.is_empty() {
            break;
        }
        let (name, value) = trimmed_line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from upstream"))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            if content_length.is_some() {
                bail!("multiple Content-Length headers from upstream are not supported");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
        if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(|token| token.trim()) {
                if token.eq_ignore_ascii_case("close") {
                    connection_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") && version == Version::HTTP_10
                {
                    connection_close = false;
                }
            }
        }
        headers.push(Http1HeaderLine::new(name, value));
    }

    if transfer_encoding_present && content_length.is_some() {
        warn!(
            peer = %peer,
            "upstream response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(Http1ResponseHead {
        status_line: trimmed.to_string(),
        status,
        headers,
        content_length,
        chunked,
        transfer_encoding_present,
        connection_close,
    })
}

pub(crate) fn parse_http1_status_line(value: &str) -> Result<(Version, StatusCode, String)> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported upstream HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))?;

    Ok((version, status, reason))
}

#[cfg(test)]
mod tests {
    use super::super::headers::Http1HeaderLine;
    use super::{
        ConnectionOverride, Http1ResponseHead, encode_hit_response, parse_http1_status_line,
        read_http1_response_head,
    };
    use crate::proxy::cache::{CachedReply, Disposition};
    use crate::proxy::http::forward::ResponseBodyPlan;
    use http::{StatusCode, Version};
    use std::time::Duration;

    fn head_with(headers: Vec<Http1HeaderLine>) -> Http1ResponseHead {
        Http1ResponseHead {
            status_line: "HTTP/1.1 200 OK".to_string(),
            status: StatusCode::OK,
            headers,
            content_length: None,
            chunked: false,
            transfer_encoding_present: false,
            connection_close: false,
        }
    }

    async fn read_head(raw: &[u8]) -> anyhow::Result<Http1ResponseHead> {
        let mut reader = tokio::io::BufReader::new(raw);
        read_http1_response_head(
            &mut reader,
            Duration::from_secs(1),
            "127.0.0.1:80".parse().unwrap(),
            1024,
        )
        .await
    }

    #[test]
    fn response_encode_strips_hop_by_hop_and_connection_tokens() {
        let mut head = head_with(vec![
            Http1HeaderLine::new("Connection", "Foo, Upgrade"),
            Http1HeaderLine::new("Foo", "bar"),
            Http1HeaderLine::new("Upgrade", "websocket"),
            Http1HeaderLine::new("Transfer-Encoding", "chunked"),
            Http1HeaderLine::new("Trailer", "X-Trailer"),
            Http1HeaderLine::new("X-Test", "1"),
        ]);
        head.chunked = true;
        head.transfer_encoding_present = true;

        let encoded = head.encode(ResponseBodyPlan::Chunked, None, None);
        let text = String::from_utf8(encoded).unwrap();

        assert!(!text.contains("Connection:"));
        assert!(!text.contains("Foo:"));
        assert!(!text.contains("Upgrade:"));
        assert!(!text.contains("Content-Length:"));
        assert!(!text.contains("X-Cache:"));
        assert!(text.contains("Transfer-Encoding: chunked"));
        assert!(text.contains("Trailer: X-Trailer"));
        assert!(text.contains("X-Test: 1"));
    }

    #[test]
    fn captured_body_is_sent_with_recomputed_length() {
        let mut head = head_with(vec![
            Http1HeaderLine::new("Transfer-Encoding", "chunked"),
            Http1HeaderLine::new("Trailer", "X-Checksum"),
            Http1HeaderLine::new("Content-Encoding", "gzip"),
        ]);
        head.chunked = true;
        head.transfer_encoding_present = true;

        let encoded = head.encode(
            ResponseBodyPlan::Fixed(5),
            Some(ConnectionOverride::Close),
            Some(Disposition::Miss),
        );
        let text = String::from_utf8(encoded).unwrap();

        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Content-Encoding: gzip\r\n"));
        assert!(!text.contains("Transfer-Encoding:"));
        assert!(!text.contains("Trailer:"));
        assert!(text.contains("X-Cache: MISS\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn head_hit_omits_length_of_empty_payload() {
        let reply = CachedReply {
            body: Vec::new(),
            content_type: "application/json".into(),
            content_encoding: Some("gzip"),
            vary_accept_encoding: true,
        };
        let text = String::from_utf8(encode_hit_response(&reply, true, None)).unwrap();
        assert!(!text.contains("Content-Length"), "{text}");
        assert!(text.contains("X-Cache: HIT\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn origin_cache_status_is_replaced() {
        let head = head_with(vec![Http1HeaderLine::new("x-cache", "HIT from cdn")]);
        let text = String::from_utf8(head.encode(
            ResponseBodyPlan::Fixed(0),
            None,
            Some(Disposition::Skip),
        ))
        .unwrap();
        assert!(!text.contains("cdn"));
        assert!(text.contains("X-Cache: SKIP\r\n"));
    }

    #[test]
    fn head_response_keeps_origin_length() {
        let mut head = head_with(Vec::new());
        head.content_length = Some(42);
        let text =
            String::from_utf8(head.encode(ResponseBodyPlan::Empty, None, Some(Disposition::Miss)))
                .unwrap();
        assert!(text.contains("Content-Length: 42\r\n"));
    }

    #[test]
    fn hit_response_describes_negotiated_reply() {
        let reply = CachedReply {
            body: vec![1, 2, 3],
            content_type: "application/json".into(),
            content_encoding: Some("gzip"),
            vary_accept_encoding: true,
        };
        let text = String::from_utf8(encode_hit_response(&reply, false, None)).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Encoding: gzip\r\n"));
        assert!(text.contains("Vary: Accept-Encoding\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.contains("X-Cache: HIT\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        let plain = CachedReply {
            body: b"ok".to_vec(),
            content_type: "text/plain".into(),
            content_encoding: None,
            vary_accept_encoding: false,
        };
        let text =
            String::from_utf8(encode_hit_response(&plain, false, Some(ConnectionOverride::Close)))
                .unwrap();
        assert!(!text.contains("Content-Encoding"));
        assert!(!text.contains("Vary"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn parse_status_line_accepts_valid_line() -> anyhow::Result<()> {
        let (version, status, reason) = parse_http1_status_line("HTTP/1.1 404 Not Found")?;
        assert_eq!(version, Version::HTTP_11);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(reason, "Not Found");

        let (version, status, _) = parse_http1_status_line("HTTP/1.0 200 OK")?;
        assert_eq!(version, Version::HTTP_10);
        assert_eq!(status, StatusCode::OK);
        Ok(())
    }

    #[test]
    fn parse_status_line_rejects_invalid_input() {
        let err = parse_http1_status_line("BAD 200 OK").unwrap_err();
        assert!(
            err.to_string()
                .contains("unsupported upstream HTTP version"),
            "unexpected error: {err:?}"
        );
        let err = parse_http1_status_line("HTTP/1.1").unwrap_err();
        assert!(err.to_string().contains("missing status code"), "{err:?}");
        let err = parse_http1_status_line("HTTP/1.1 twohundred OK").unwrap_err();
        assert!(
            err.to_string().contains("invalid upstream status code"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn http10_response_closes_unless_keep_alive() -> anyhow::Result<()> {
        let head = read_head(b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\n").await?;
        assert!(head.connection_close);
        let head =
            read_head(b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\nContent-Length: 2\r\n\r\n")
                .await?;
        assert!(!head.connection_close);
        let head = read_head(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n").await?;
        assert!(head.connection_close);
        Ok(())
    }

    #[tokio::test]
    async fn read_response_head_collects_framing() -> anyhow::Result<()> {
        let head = read_head(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Encoding: gzip\r\nContent-Length: 7\r\n\r\n",
        )
        .await?;
        assert_eq!(head.content_length, Some(7));
        assert_eq!(head.header_value("content-type"), Some("text/plain"));
        assert_eq!(
            head.header_map()
                .get(http::header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok()),
            Some("gzip")
        );
        Ok(())
    }

    #[tokio::test]
    async fn read_response_head_rejects_duplicate_content_length() {
        let result =
            read_head(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nContent-Length: 10\r\n\r\n")
                .await;
        let err = result.expect_err("duplicate Content-Length should be rejected");
        assert!(
            err.to_string().contains("multiple Content-Length"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn read_response_head_rejects_transfer_encoding_with_content_length() {
        let result =
            read_head(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n")
                .await;
        let err = result.expect_err("Transfer-Encoding with Content-Length should be rejected");
        assert!(
            err.to_string()
                .contains("must not include both Transfer-Encoding and Content-Length"),
            "unexpected error: {err}"
        );
    }
}
