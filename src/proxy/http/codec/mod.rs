mod headers;
mod line;
mod request;
mod response;

pub(crate) use headers::{Http1HeaderAccumulator, Http1HeaderLine};
pub(crate) use line::read_line_with_timeout;
pub(crate) use request::{Http1RequestHead, read_http1_request_head};
pub(crate) use response::{
    CACHE_STATUS_HEADER, ConnectionOverride, Http1ResponseHead, encode_hit_response,
    read_http1_response_head,
};
