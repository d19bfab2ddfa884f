use http::{Method, StatusCode};

/// Only GET and HEAD are served from or written to the store.
pub fn is_cacheable(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

pub fn is_capture_eligible(method: &Method, status: StatusCode) -> bool {
    is_cacheable(method) && status == StatusCode::OK
}

/// How the cache handled a request, reported in the `X-Cache` response header and the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Hit,
    Miss,
    Skip,
}

impl Disposition {
    pub fn for_method(method: &Method) -> Self {
        if is_cacheable(method) {
            Disposition::Miss
        } else {
            Disposition::Skip
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Hit => "HIT",
            Disposition::Miss => "MISS",
            Disposition::Skip => "SKIP",
        }
    }
}
