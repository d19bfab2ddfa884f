use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, ensure};

use crate::{logging::AccessLogBuilder, proxy::http::BodyTooLarge};

/// Tracks cumulative payload bytes and enforces a configured limit.
pub struct BodySizeTracker {
    max_bytes: usize,
    total_bytes: u64,
}

impl BodySizeTracker {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            total_bytes: 0,
        }
    }

    pub fn record(&mut self, chunk_len: usize) -> Result<()> {
        if chunk_len == 0 {
            return Ok(());
        }
        self.total_bytes = self
            .total_bytes
            .checked_add(chunk_len as u64)
            .ok_or(BodyTooLarge {
                bytes_read: self.total_bytes,
            })?;
        if self.total_bytes > self.max_bytes as u64 {
            return Err(BodyTooLarge {
                bytes_read: self.total_bytes,
            }
            .into());
        }
        Ok(())
    }

    pub fn total(&self) -> u64 {
        self.total_bytes
    }
}

/// Enforces a maximum number of header bytes while parsing.
pub struct HeaderBudget {
    limit: usize,
    used: usize,
    error_message: &'static str,
}

impl HeaderBudget {
    pub fn new(limit: usize, error_message: &'static str) -> Result<Self> {
        ensure!(limit > 0, "header limit must be greater than zero");
        Ok(Self {
            limit,
            used: 0,
            error_message,
        })
    }

    pub fn record(&mut self, bytes: usize) -> Result<()> {
        self.used = self
            .used
            .checked_add(bytes)
            .ok_or_else(|| anyhow!("header size overflow"))?;
        ensure!(self.used <= self.limit, "{}", self.error_message);
        Ok(())
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

/// Bytes received from the client for one request plus its start time, for the access log.
pub struct RequestLogTracker {
    bytes_in: u64,
    start: Instant,
}

impl RequestLogTracker {
    pub fn new(head_bytes: u64, start: Instant) -> Self {
        Self {
            bytes_in: head_bytes,
            start,
        }
    }

    pub fn add_client_bytes(&mut self, bytes: u64) {
        self.bytes_in = self.bytes_in.saturating_add(bytes);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Fills in byte counts and elapsed time on an access log entry.
    pub fn finish(&self, builder: AccessLogBuilder, bytes_out: u64) -> AccessLogBuilder {
        builder
            .bytes(self.bytes_in, bytes_out)
            .elapsed(self.elapsed())
    }
}
