use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use http::{Method, Uri};

use crate::logging::AccessLogBuilder;

/// An inbound request reduced to the parts that select a cache entry and an upstream target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: Method,
    /// Raw (still percent-encoded) path, or `*` for server-wide OPTIONS.
    pub path: String,
    pub query: Option<String>,
}

impl ParsedRequest {
    pub fn raw_query(&self) -> &str {
        self.query.as_deref().unwrap_or("")
    }

    /// Path for the access log; the query is included only when `log_queries` is set.
    pub fn log_path(&self, log_queries: bool) -> String {
        match (&self.query, log_queries) {
            (Some(query), true) => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }

    pub fn access_log_builder(&self, peer: SocketAddr, log_queries: bool) -> AccessLogBuilder {
        AccessLogBuilder::new(peer)
            .method(self.method.as_str())
            .path(self.log_path(log_queries))
    }
}

/// Parse an HTTP/1.x request target (origin-form, absolute-form or asterisk-form).
///
/// Absolute-form targets keep only their path and query: every request goes to the configured
/// origin regardless of the authority the client named.
pub fn parse_http1_request(method: Method, target: &str) -> Result<ParsedRequest> {
    if target == "*" {
        if method != Method::OPTIONS {
            bail!("asterisk-form request target is only valid for OPTIONS");
        }
        return Ok(ParsedRequest {
            method,
            path: target.to_string(),
            query: None,
        });
    }

    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;
    if uri.scheme().is_none() && !target.starts_with('/') {
        bail!("request target must be origin-form (start with '/') or absolute-form");
    }

    let path = match uri.path() {
        "" => "/".to_string(),
        path => path.to_string(),
    };
    let query = uri
        .query()
        .filter(|query| !query.is_empty())
        .map(str::to_string);

    Ok(ParsedRequest {
        method,
        path,
        query,
    })
}

/// Return a target with query parameters removed for logging purposes.
pub fn redacted_path(target: &str) -> String {
    target.split('?').next().unwrap_or("/").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_origin_form_path_and_query() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "/users/42?fields=name&x=%20")?;
        assert_eq!(parsed.path, "/users/42");
        assert_eq!(parsed.query.as_deref(), Some("fields=name&x=%20"));
        assert_eq!(parsed.raw_query(), "fields=name&x=%20");
        Ok(())
    }

    #[test]
    fn keeps_path_percent_encoding() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "/files/a%2Fb")?;
        assert_eq!(parsed.path, "/files/a%2Fb");
        assert_eq!(parsed.query, None);
        Ok(())
    }

    #[test]
    fn empty_query_counts_as_absent() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "/search?")?;
        assert_eq!(parsed.query, None);
        assert_eq!(parsed.raw_query(), "");
        Ok(())
    }

    #[test]
    fn absolute_form_uses_path_and_query_only() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "http://elsewhere.example/data?page=1")?;
        assert_eq!(parsed.path, "/data");
        assert_eq!(parsed.query.as_deref(), Some("page=1"));

        let parsed = parse_http1_request(Method::GET, "http://elsewhere.example")?;
        assert_eq!(parsed.path, "/");
        Ok(())
    }

    #[test]
    fn reject_non_origin_form_target() {
        let err = parse_http1_request(Method::GET, "example.com:443").unwrap_err();
        assert!(
            err.to_string().contains("origin-form"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn allow_options_asterisk_form() -> Result<()> {
        let parsed = parse_http1_request(Method::OPTIONS, "*")?;
        assert_eq!(parsed.path, "*");
        Ok(())
    }

    #[test]
    fn reject_asterisk_form_for_non_options() {
        let err = parse_http1_request(Method::GET, "*").unwrap_err();
        assert!(
            err.to_string().contains("asterisk-form"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn reject_invalid_target() {
        let err = parse_http1_request(Method::GET, "/bad path").unwrap_err();
        assert!(
            err.to_string().contains("invalid request target"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn log_path_redacts_query_unless_enabled() -> Result<()> {
        let parsed = parse_http1_request(Method::GET, "/token?secret=1")?;
        assert_eq!(parsed.log_path(false), "/token");
        assert_eq!(parsed.log_path(true), "/token?secret=1");
        assert_eq!(redacted_path("/token?secret=1"), "/token");
        Ok(())
    }
}
