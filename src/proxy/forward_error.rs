use std::net::SocketAddr;

use anyhow::Error;
use http::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{proxy::http::BodyTooLarge, util::TimedOut};

/// Attached as context once any response bytes reached the client; no error response can
/// follow on that connection.
#[derive(Debug, Error)]
#[error("response to client already started")]
pub struct ResponseStarted;

/// Attached as context when a pooled upstream connection failed before producing a response
/// head, so the request may be replayed on a fresh connection.
#[derive(Debug, Error)]
#[error("reused upstream connection was closed by the origin")]
pub struct StaleConnection;

/// Classification of forwarding failures into the response the client receives.
pub enum ForwardErrorKind<'a> {
    BodyTooLarge(&'a BodyTooLarge),
    TimedOut(&'a TimedOut),
    Other,
}

impl ForwardErrorKind<'_> {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardErrorKind::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ForwardErrorKind::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            ForwardErrorKind::Other => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ForwardErrorKind::BodyTooLarge(_) => "request_body_too_large",
            ForwardErrorKind::TimedOut(_) => "upstream_timeout",
            ForwardErrorKind::Other => "upstream_error",
        }
    }

    pub fn body(&self) -> &'static str {
        match self {
            ForwardErrorKind::BodyTooLarge(_) => "request body exceeds configured limit\r\n",
            ForwardErrorKind::TimedOut(_) => "upstream timed out\r\n",
            ForwardErrorKind::Other => "upstream request failed\r\n",
        }
    }
}

pub fn classify_forward_error(err: &Error) -> ForwardErrorKind<'_> {
    if let Some(body) = err.downcast_ref::<BodyTooLarge>() {
        ForwardErrorKind::BodyTooLarge(body)
    } else if let Some(timed_out) = err.downcast_ref::<TimedOut>() {
        ForwardErrorKind::TimedOut(timed_out)
    } else {
        ForwardErrorKind::Other
    }
}

pub fn response_started(err: &Error) -> bool {
    err.downcast_ref::<ResponseStarted>().is_some()
}

pub fn is_stale_connection(err: &Error) -> bool {
    err.downcast_ref::<StaleConnection>().is_some()
}

pub fn log_forward_error(kind: &ForwardErrorKind<'_>, peer: SocketAddr, path: &str, err: &Error) {
    match kind {
        ForwardErrorKind::BodyTooLarge(body) => debug!(
            peer = %peer,
            path,
            bytes_read = body.bytes_read,
            "request body exceeded configured limit"
        ),
        ForwardErrorKind::TimedOut(timed_out) => warn!(
            peer = %peer,
            path,
            context = %timed_out.context,
            "upstream request timed out"
        ),
        ForwardErrorKind::Other => warn!(
            peer = %peer,
            path,
            error = %format!("{err:#}"),
            "upstream request failed"
        ),
    }
}
