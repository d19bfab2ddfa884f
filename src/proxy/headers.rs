use std::collections::HashSet;

use anyhow::{Context, Result, anyhow, bail, ensure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDisposition {
    Connection,
    Host,
    ContentLength,
    TransferEncoding,
    ForwardedFor,
    Skip,
    Forward,
}

/// Classifies a lowercase request header name by how it is treated on the way upstream.
pub fn classify_request_header(name: &str) -> HeaderDisposition {
    match name {
        "connection" => HeaderDisposition::Connection,
        "host" => HeaderDisposition::Host,
        "content-length" => HeaderDisposition::ContentLength,
        "transfer-encoding" => HeaderDisposition::TransferEncoding,
        "x-forwarded-for" => HeaderDisposition::ForwardedFor,
        "keep-alive" | "upgrade" | "te" | "trailer" => HeaderDisposition::Skip,
        other if other.starts_with("proxy-") => HeaderDisposition::Skip,
        _ => HeaderDisposition::Forward,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderAction {
    Forward,
    Skip,
}

/// Enforces the header byte budget and extracts framing and routing headers from a request.
#[derive(Debug, Clone)]
pub struct RequestHeaderSanitizer {
    max_bytes: usize,
    consumed: usize,
    host: Option<String>,
    content_length: Option<usize>,
    chunked: bool,
    connection_tokens: HashSet<String>,
    forwarded_for: Vec<String>,
    transfer_encoding_seen: bool,
}

impl RequestHeaderSanitizer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            consumed: 0,
            host: None,
            content_length: None,
            chunked: false,
            connection_tokens: HashSet::new(),
            forwarded_for: Vec::new(),
            transfer_encoding_seen: false,
        }
    }

    pub fn reserve(&mut self, byte_len: usize) -> Result<()> {
        self.consumed = self
            .consumed
            .checked_add(byte_len)
            .ok_or_else(|| anyhow!("header section exceeds configured limit"))?;
        ensure!(
            self.consumed <= self.max_bytes,
            "header section exceeds configured limit"
        );
        Ok(())
    }

    pub fn record(&mut self, name: &str, value: &str, byte_len: usize) -> Result<HeaderAction> {
        self.reserve(byte_len)?;

        let name_lower = name.to_ascii_lowercase();
        match classify_request_header(&name_lower) {
            HeaderDisposition::Connection => {
                // Repeated Connection headers are one comma-separated list.
                self.record_connection_tokens(value);
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::Host => {
                if self.host.is_some() {
                    bail!("duplicate Host header");
                }
                self.host = Some(value.to_ascii_lowercase());
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::ContentLength => {
                if self.chunked {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                if self.content_length.is_some() {
                    bail!("multiple Content-Length headers are not supported");
                }
                let length: usize = value
                    .parse()
                    .with_context(|| format!("invalid Content-Length value '{value}'"))?;
                self.content_length = Some(length);
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::TransferEncoding => {
                if self.transfer_encoding_seen {
                    bail!("duplicate Transfer-Encoding header");
                }
                self.transfer_encoding_seen = true;
                let encodings: Vec<String> = value
                    .split(',')
                    .map(|item| item.trim().to_ascii_lowercase())
                    .filter(|item| !item.is_empty())
                    .collect();
                if encodings != ["chunked"] {
                    bail!("unsupported Transfer-Encoding '{value}'");
                }
                if self.content_length.is_some() {
                    bail!("request must not include both Content-Length and Transfer-Encoding");
                }
                self.chunked = true;
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::ForwardedFor => {
                if !value.is_empty() {
                    self.forwarded_for.push(value.to_string());
                }
                Ok(HeaderAction::Skip)
            }
            HeaderDisposition::Skip => Ok(HeaderAction::Skip),
            HeaderDisposition::Forward => Ok(HeaderAction::Forward),
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn total_bytes(&self) -> usize {
        self.consumed
    }

    pub fn connection_tokens(&self) -> &HashSet<String> {
        &self.connection_tokens
    }

    /// `X-Forwarded-For` value to send upstream, with `client_ip` appended to any existing chain.
    pub fn forwarded_for_with(&self, client_ip: &str) -> String {
        let mut chain = self.forwarded_for.join(", ");
        if !chain.is_empty() {
            chain.push_str(", ");
        }
        chain.push_str(client_ip);
        chain
    }

    fn record_connection_tokens(&mut self, value: &str) {
        for token in value.split(',') {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                continue;
            }
            self.connection_tokens.insert(trimmed.to_ascii_lowercase());
        }
    }
}
