mod body;
mod codec;
mod dispatch;
mod forward;
mod pipeline;
mod server;
pub mod upstream;

pub use body::BodyTooLarge;
pub use pipeline::{LocalResponse, respond_with_access_log, send_response, shutdown_stream};
pub use server::{handle_http, serve_connection};

#[cfg(feature = "fuzzing")]
pub mod fuzzing {
    use std::net::SocketAddr;
    use std::time::Duration;

    use anyhow::Result;
    use tokio::io::{AsyncRead, BufReader};

    pub use super::body::{read_chunked_body, stream_chunked_body};

    pub async fn parse_http1_request_head<S>(
        reader: &mut BufReader<S>,
        peer: SocketAddr,
        timeout: Duration,
        max_header_bytes: usize,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        if let Some(head) =
            super::codec::read_http1_request_head(reader, peer, timeout, timeout, max_header_bytes)
                .await?
        {
            if let Ok(parsed) =
                crate::proxy::request::parse_http1_request(head.method.clone(), &head.target)
            {
                let _ = crate::proxy::cache::CacheKey::for_request(&parsed);
            }
            let _ = head.headers.expect_continue();
            let _ = head.headers.content_length();
        }
        Ok(())
    }

    pub async fn parse_http1_response_head<S>(
        reader: &mut BufReader<S>,
        timeout: Duration,
        peer: SocketAddr,
        max_header_bytes: usize,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let head =
            super::codec::read_http1_response_head(reader, timeout, peer, max_header_bytes).await?;
        let _ = crate::proxy::cache::ContentCoding::from_headers(&head.header_map());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::time::Duration;

    use http::Method;
    use tokio::io::{AsyncWriteExt, BufReader, duplex};

    use super::body::{BodyTooLarge, stream_chunked_body};
    use super::codec::read_http1_request_head;
    use crate::proxy::request::parse_http1_request;

    #[tokio::test]
    async fn chunked_request_body_errors_when_over_limit() {
        let (client_stream, mut client_writer) = duplex(1024);
        let (_upstream_stream, mut upstream_sink) = duplex(1024);

        client_writer
            .write_all(b"5\r\nhello\r\n0\r\n\r\n")
            .await
            .unwrap();
        drop(client_writer);

        let mut reader = BufReader::new(client_stream);
        let peer = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 443));
        let err = stream_chunked_body(
            &mut reader,
            &mut upstream_sink,
            Duration::from_secs(1),
            Duration::from_secs(1),
            peer,
            2,
        )
        .await
        .expect_err("expected body size limit error");
        assert!(err.downcast::<BodyTooLarge>().is_ok());
    }

    #[tokio::test]
    async fn absolute_form_target_keeps_path_and_query() -> anyhow::Result<()> {
        let (client_stream, mut writer) = duplex(1024);
        writer
            .write_all(b"GET http://example.com/path?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await?;
        drop(writer);

        let mut reader = BufReader::new(client_stream);
        let head = read_http1_request_head(
            &mut reader,
            "127.0.0.1:12345".parse()?,
            Duration::from_secs(1),
            Duration::from_secs(1),
            1024,
        )
        .await?
        .expect("expected request head");
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.headers.host(), Some("example.com"));

        let parsed = parse_http1_request(head.method.clone(), &head.target)?;
        assert_eq!(parsed.path, "/path");
        assert_eq!(parsed.query.as_deref(), Some("x=1"));
        Ok(())
    }

    #[tokio::test]
    async fn long_request_line_is_rejected() -> anyhow::Result<()> {
        let (client_stream, mut writer) = duplex(4096);
        let request = format!("GET /{} HTTP/1.1\r\nHost: example.com\r\n\r\n", "a".repeat(2048));
        writer.write_all(request.as_bytes()).await?;
        drop(writer);

        let mut reader = BufReader::new(client_stream);
        let result = read_http1_request_head(
            &mut reader,
            "127.0.0.1:12345".parse()?,
            Duration::from_secs(1),
            Duration::from_secs(1),
            512,
        )
        .await;
        let err = match result {
            Ok(_) => panic!("request line should exceed limit"),
            Err(err) => err,
        };
        assert!(
            err.to_string().contains("request line from"),
            "unexpected error message: {err}"
        );
        Ok(())
    }
}
