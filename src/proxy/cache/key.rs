use std::fmt;

use http::Method;

use crate::proxy::request::ParsedRequest;

/// Store key for one `(method, path, query)` triple: the lowercase hex blake3 digest of the
/// three fields joined with `_`.
///
/// The separator is not escaped, so triples whose fields contain `_` can in principle map to
/// the same key (`GET`, `/a_b`, `` vs `GET`, `/a`, `b_`). Keys are never parsed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    hex: String,
}

impl CacheKey {
    pub fn derive(method: &Method, path: &str, raw_query: &str) -> Self {
        let material = format!("{}_{}_{}", method.as_str(), path, raw_query);
        Self {
            hex: blake3::hash(material.as_bytes()).to_hex().to_string(),
        }
    }

    pub fn for_request(request: &ParsedRequest) -> Self {
        Self::derive(&request.method, &request.path, request.raw_query())
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}
