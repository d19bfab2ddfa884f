mod forward;
mod handler;
mod hit;
mod parse;
mod respond;

use std::time::Instant;

use http::Method;

use super::codec::Http1HeaderAccumulator;

pub use parse::handle_request;
pub use respond::{LocalResponse, respond_with_access_log, send_response, shutdown_stream};

pub enum ClientDisposition {
    Continue,
    Close,
}

impl ClientDisposition {
    pub fn when_close(close: bool) -> Self {
        if close {
            ClientDisposition::Close
        } else {
            ClientDisposition::Continue
        }
    }
}

pub struct RequestContext {
    pub method: Method,
    pub target: String,
    pub headers: Http1HeaderAccumulator,
    /// The client asked for the connection to end after this request.
    pub close_requested: bool,
    pub request_line_bytes: usize,
    pub header_bytes: usize,
    pub start: Instant,
}

impl RequestContext {
    pub fn total_request_bytes(&self) -> u64 {
        (self.request_line_bytes + self.header_bytes) as u64
    }
}
