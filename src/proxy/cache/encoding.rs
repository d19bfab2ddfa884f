use std::io::{Read, Write};

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use http::HeaderMap;
use http::header::CONTENT_ENCODING;
use thiserror::Error;

/// The decoded payload exceeded the configured entry limit.
#[derive(Debug, Error)]
#[error("decompressed payload exceeds cache entry limit of {limit} bytes")]
pub struct CaptureTooLarge {
    pub limit: usize,
}

/// Transport compression of an upstream response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentCoding {
    Identity,
    Gzip,
    /// Any other coding or a stack of codings. Relayed but never captured.
    Other(String),
}

impl ContentCoding {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut codings = Vec::new();
        for value in headers.get_all(CONTENT_ENCODING) {
            let Ok(value) = value.to_str() else {
                return ContentCoding::Other(String::from_utf8_lossy(value.as_bytes()).into());
            };
            codings.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|token| !token.is_empty() && !token.eq_ignore_ascii_case("identity"))
                    .map(str::to_ascii_lowercase),
            );
        }
        match codings.as_slice() {
            [] => ContentCoding::Identity,
            [single] if single == "gzip" || single == "x-gzip" => ContentCoding::Gzip,
            _ => ContentCoding::Other(codings.join(", ")),
        }
    }
}

/// Whether an `Accept-Encoding` value admits a gzip response. An explicit `gzip` entry wins over
/// `*`, and `q=0` rejects.
pub fn accepts_gzip(accept_encoding: Option<&str>) -> bool {
    let Some(value) = accept_encoding else {
        return false;
    };
    let mut gzip = None;
    let mut wildcard = None;
    for item in value.split(',') {
        let mut parts = item.split(';');
        let coding = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let accepted = parts
            .filter_map(|param| param.trim().split_once('='))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("q"))
            .map(|(_, q)| q.trim().parse::<f32>().map(|q| q > 0.0).unwrap_or(false))
            .unwrap_or(true);
        match coding.as_str() {
            "gzip" | "x-gzip" => gzip = Some(gzip.unwrap_or(false) || accepted),
            "*" => wildcard = Some(accepted),
            _ => {}
        }
    }
    gzip.or(wildcard).unwrap_or(false)
}

pub fn gzip(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
    encoder
        .write_all(payload)
        .context("failed to gzip payload")?;
    encoder.finish().context("failed to finish gzip stream")
}

/// Decodes one or more concatenated gzip members, refusing to produce more than `limit` bytes.
pub fn gunzip(body: &[u8], limit: usize) -> Result<Vec<u8>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let mut decoded = Vec::new();
    MultiGzDecoder::new(body)
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)
        .context("failed to decompress gzip body")?;
    if decoded.len() > limit {
        return Err(CaptureTooLarge { limit }.into());
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(values: &[&'static str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for value in values {
            map.append(CONTENT_ENCODING, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn detects_content_coding() {
        assert_eq!(ContentCoding::from_headers(&headers(&[])), ContentCoding::Identity);
        assert_eq!(
            ContentCoding::from_headers(&headers(&["identity"])),
            ContentCoding::Identity
        );
        assert_eq!(ContentCoding::from_headers(&headers(&["GZIP"])), ContentCoding::Gzip);
        assert_eq!(ContentCoding::from_headers(&headers(&["x-gzip"])), ContentCoding::Gzip);
        assert_eq!(
            ContentCoding::from_headers(&headers(&["br"])),
            ContentCoding::Other("br".into())
        );
        assert_eq!(
            ContentCoding::from_headers(&headers(&["gzip", "gzip"])),
            ContentCoding::Other("gzip, gzip".into())
        );
        assert_eq!(
            ContentCoding::from_headers(&headers(&["deflate, gzip"])),
            ContentCoding::Other("deflate, gzip".into())
        );
    }

    #[test]
    fn accept_encoding_negotiation() {
        assert!(!accepts_gzip(None));
        assert!(!accepts_gzip(Some("")));
        assert!(accepts_gzip(Some("gzip")));
        assert!(accepts_gzip(Some("deflate, GZIP;q=0.5")));
        assert!(accepts_gzip(Some("br, x-gzip")));
        assert!(!accepts_gzip(Some("br, deflate")));
        assert!(!accepts_gzip(Some("gzip;q=0")));
        assert!(!accepts_gzip(Some("gzip; q=0.000")));
        assert!(accepts_gzip(Some("*")));
        assert!(!accepts_gzip(Some("*;q=0")));
        assert!(!accepts_gzip(Some("*, gzip;q=0")));
        assert!(accepts_gzip(Some("*;q=0, gzip")));
        assert!(!accepts_gzip(Some("identity")));
    }

    #[test]
    fn gzip_then_gunzip_recovers_payload() -> Result<()> {
        let payload = br#"{"items":[1,2,3],"next":null}"#.repeat(20);
        let compressed = gzip(&payload)?;
        assert_ne!(compressed, payload);
        assert_eq!(gunzip(&compressed, payload.len())?, payload);
        Ok(())
    }

    #[test]
    fn gunzip_reads_concatenated_members() -> Result<()> {
        let mut body = gzip(b"hello ")?;
        body.extend(gzip(b"world")?);
        assert_eq!(gunzip(&body, 1024)?, b"hello world");
        Ok(())
    }

    #[test]
    fn gunzip_enforces_limit() -> Result<()> {
        let compressed = gzip(&[b'a'; 4096])?;
        let err = gunzip(&compressed, 100).unwrap_err();
        let too_large = err
            .downcast_ref::<CaptureTooLarge>()
            .expect("limit error should be typed");
        assert_eq!(too_large.limit, 100);
        assert_eq!(gunzip(&compressed, 4096)?.len(), 4096);
        Ok(())
    }

    #[test]
    fn gunzip_rejects_invalid_data() {
        assert!(gunzip(b"definitely not gzip", 1024).is_err());
    }

    #[test]
    fn gunzip_of_empty_body_is_empty() -> Result<()> {
        assert!(gunzip(b"", 1024)?.is_empty());
        Ok(())
    }
}
