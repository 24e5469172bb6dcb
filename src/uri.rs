//! Request-target parsing.

use crate::error::ProxyError;
use http::Uri;
use std::fmt;
use url::Url;

/// Components of an absolute-form request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriParts {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
    pub fragment: Option<String>,
}

impl UriParts {
    /// Parses an absolute URI such as `http://host:8080/path?q`.
    pub fn parse(target: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(target).map_err(|e| ProxyError::parse(format!("invalid URI {:?}: {}", target, e)))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::parse(format!("URI has no host: {}", target)))?;

        Ok(Self {
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port: url.port(),
            path: url.path().to_string(),
            query: url.query().map(ToOwned::to_owned),
            fragment: url.fragment().map(ToOwned::to_owned),
        })
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == "https"
    }

    pub fn is_http(&self) -> bool {
        self.scheme == "http" || self.scheme == "https"
    }

    /// Explicit port, else 443 for https and 80 otherwise.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(if self.is_secure() { 443 } else { 80 })
    }

    /// Origin-form target (`/path?query`) to send to the origin itself.
    pub fn origin_form(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        match &self.query {
            Some(query) => format!("{}?{}", path, query),
            None => path.to_string(),
        }
    }

    /// `Host` header value. Default ports are already dropped by the parser.
    pub fn host_header(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

/// `host:port` target of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub host: String,
    pub port: u16,
}

impl Authority {
    pub fn parse(target: &str) -> Result<Self, ProxyError> {
        let uri: Uri = target
            .parse()
            .map_err(|e| ProxyError::parse(format!("invalid authority {:?}: {}", target, e)))?;

        if uri.scheme().is_some() || uri.path_and_query().is_some_and(|pq| !pq.as_str().is_empty()) {
            return Err(ProxyError::parse(format!("expected host:port, got {:?}", target)));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| ProxyError::parse(format!("expected host:port, got {:?}", target)))?;
        if authority.as_str().contains('@') {
            return Err(ProxyError::parse("authority must not carry user info"));
        }
        let port = authority
            .port_u16()
            .ok_or_else(|| ProxyError::parse(format!("authority {:?} has no port", target)))?;
        let host = authority.host();
        if host.is_empty() {
            return Err(ProxyError::parse(format!("authority {:?} has no host", target)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
