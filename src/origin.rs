use std::fmt;

use http::Uri;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginError {
    #[error("origin URL '{url}' is malformed: {reason}")]
    Malformed { url: String, reason: String },
    #[error("origin URL '{0}' must be absolute (scheme and host are required)")]
    NotAbsolute(String),
    #[error("origin URL '{url}' uses unsupported scheme '{scheme}'")]
    UnsupportedScheme { url: String, scheme: String },
    #[error("origin URL '{0}' must not contain userinfo")]
    Userinfo(String),
}

/// The single upstream server every request is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
    authority: String,
    base_path: String,
    base_query: Option<String>,
}

impl Origin {
    pub fn parse(url: &str) -> Result<Self, OriginError> {
        let trimmed = url.trim();
        let uri: Uri = trimmed.parse().map_err(|err: http::uri::InvalidUri| {
            OriginError::Malformed {
                url: trimmed.to_string(),
                reason: err.to_string(),
            }
        })?;

        let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) else {
            return Err(OriginError::NotAbsolute(trimmed.to_string()));
        };
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(OriginError::UnsupportedScheme {
                    url: trimmed.to_string(),
                    scheme: other.to_string(),
                });
            }
        };
        if authority.as_str().contains('@') {
            return Err(OriginError::Userinfo(trimmed.to_string()));
        }

        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        if host.is_empty() {
            return Err(OriginError::NotAbsolute(trimmed.to_string()));
        }
        let port = authority.port_u16().unwrap_or_else(|| scheme.default_port());
        let base_path = match uri.path() {
            "" => "/".to_string(),
            path => path.to_string(),
        };
        let base_query = uri
            .query()
            .filter(|query| !query.is_empty())
            .map(str::to_string);

        Ok(Self {
            scheme,
            host,
            port,
            authority: authority.as_str().to_string(),
            base_path,
            base_query,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value sent as the upstream `Host` header.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Builds the request target sent upstream: the origin base path joined with the request
    /// path, and the origin base query followed by the request query.
    pub fn upstream_target(&self, path: &str, query: Option<&str>) -> String {
        if path == "*" {
            return path.to_string();
        }
        let mut target = join_paths(&self.base_path, path);
        let query = query.filter(|query| !query.is_empty());
        match (self.base_query.as_deref(), query) {
            (Some(base), Some(request)) => {
                target.push('?');
                target.push_str(base);
                target.push('&');
                target.push_str(request);
            }
            (Some(single), None) | (None, Some(single)) => {
                target.push('?');
                target.push_str(single);
            }
            (None, None) => {}
        }
        target
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme.as_str(),
            self.authority,
            self.base_path
        )?;
        if let Some(query) = &self.base_query {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_https_origin_with_default_port() {
        let origin = Origin::parse("https://api.example.com").unwrap();
        assert_eq!(origin.scheme(), Scheme::Https);
        assert_eq!(origin.host(), "api.example.com");
        assert_eq!(origin.port(), 443);
        assert_eq!(origin.authority(), "api.example.com");
        assert_eq!(origin.to_string(), "https://api.example.com/");
    }

    #[test]
    fn keeps_explicit_port_in_authority() {
        let origin = Origin::parse("http://127.0.0.1:9000").unwrap();
        assert_eq!(origin.port(), 9000);
        assert_eq!(origin.authority(), "127.0.0.1:9000");
    }

    #[test]
    fn strips_brackets_from_ipv6_host() {
        let origin = Origin::parse("http://[fd00::1]:8080/").unwrap();
        assert_eq!(origin.host(), "fd00::1");
        assert_eq!(origin.authority(), "[fd00::1]:8080");
    }

    #[test]
    fn rejects_relative_url() {
        let err = Origin::parse("/just/a/path").unwrap_err();
        assert!(matches!(err, OriginError::NotAbsolute(_)), "{err:?}");
    }

    #[test]
    fn rejects_garbage() {
        let err = Origin::parse("http://exa mple.com").unwrap_err();
        assert!(matches!(err, OriginError::Malformed { .. }), "{err:?}");
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let err = Origin::parse("ftp://files.example.com").unwrap_err();
        assert!(
            matches!(err, OriginError::UnsupportedScheme { ref scheme, .. } if scheme == "ftp"),
            "{err:?}"
        );
    }

    #[test]
    fn rejects_userinfo() {
        let err = Origin::parse("https://user:pw@example.com").unwrap_err();
        assert!(matches!(err, OriginError::Userinfo(_)), "{err:?}");
    }

    #[test]
    fn upstream_target_joins_base_path_with_single_slash() {
        let origin = Origin::parse("https://example.com/api/").unwrap();
        assert_eq!(origin.upstream_target("/users", None), "/api/users");

        let origin = Origin::parse("https://example.com/api").unwrap();
        assert_eq!(origin.upstream_target("/users", None), "/api/users");

        let origin = Origin::parse("https://example.com").unwrap();
        assert_eq!(origin.upstream_target("/users", None), "/users");
    }

    #[test]
    fn upstream_target_merges_queries() {
        let origin = Origin::parse("https://example.com/v1?key=abc").unwrap();
        assert_eq!(
            origin.upstream_target("/items", Some("page=2")),
            "/v1/items?key=abc&page=2"
        );
        assert_eq!(origin.upstream_target("/items", None), "/v1/items?key=abc");

        let origin = Origin::parse("https://example.com").unwrap();
        assert_eq!(
            origin.upstream_target("/items", Some("page=2")),
            "/items?page=2"
        );
        assert_eq!(origin.upstream_target("/items", Some("")), "/items");
    }

    #[test]
    fn upstream_target_passes_asterisk_through() {
        let origin = Origin::parse("https://example.com/base").unwrap();
        assert_eq!(origin.upstream_target("*", None), "*");
    }
}
