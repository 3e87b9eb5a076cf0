use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use http::uri::{Authority, Scheme, Uri};
use thiserror::Error;

/// Errors related to service addresses
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddressError {
    #[error("Invalid service address '{address}': {reason}")]
    Invalid { address: String, reason: String },
}

pub type AddressResult<T> = Result<T, AddressError>;

/// A resolved backend location (`http://host:port`).
///
/// Backends live inside the cluster network and speak plain HTTP, so any
/// other scheme is rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAddress {
    authority: Authority,
}

impl ServiceAddress {
    /// Accepts `host:port`, `[v6]:port` or `http://host:port[/]`.
    pub fn parse(address: &str) -> AddressResult<Self> {
        let invalid = |reason: &str| AddressError::Invalid {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(invalid("address is empty"));
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };

        let uri: Uri = with_scheme.parse().map_err(|_| invalid("not a valid URI"))?;
        if uri.scheme() != Some(&Scheme::HTTP) {
            return Err(invalid("only http:// backends are supported"));
        }
        if !matches!(uri.path(), "" | "/") || uri.query().is_some() {
            return Err(invalid("address must not carry a path or query"));
        }
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid("missing host"))?;
        if authority.host().is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self { authority })
    }

    pub fn scheme(&self) -> &'static str {
        "http"
    }

    /// `host:port` as sent in the Host header
    pub fn authority(&self) -> &str {
        self.authority.as_str()
    }

    /// Same port on another host; used to reach a pod behind a service.
    pub fn on_host(&self, ip: IpAddr) -> AddressResult<Self> {
        let port = self.authority.port_u16().unwrap_or(80);
        Self::parse(&SocketAddr::new(ip, port).to_string())
    }

    /// Builds the absolute URI for `path_and_query` on this backend.
    pub fn uri_for(&self, path_and_query: &str) -> AddressResult<Uri> {
        format!("{}://{}{}", self.scheme(), self.authority, path_and_query)
            .parse()
            .map_err(|e: http::uri::InvalidUri| AddressError::Invalid {
                address: self.to_string(),
                reason: format!("cannot target '{path_and_query}': {e}"),
            })
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme(), self.authority)
    }
}

impl FromStr for ServiceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_prefixed_forms() {
        let bare = ServiceAddress::parse("10.0.0.7:8888").unwrap();
        let full: ServiceAddress = "http://10.0.0.7:8888/".parse().unwrap();
        assert_eq!(bare, full);
        assert_eq!(bare.authority(), "10.0.0.7:8888");
        assert_eq!(bare.to_string(), "http://10.0.0.7:8888");
    }

    #[test]
    fn parses_ipv6_literal() {
        let addr = ServiceAddress::parse("[fd00::1]:8080").unwrap();
        assert_eq!(addr.authority(), "[fd00::1]:8080");
    }

    #[test]
    fn moves_to_pod_host_keeping_port() {
        let service = ServiceAddress::parse("hello.fission-function:8888").unwrap();
        let pod = service.on_host("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(pod.authority(), "10.1.2.3:8888");

        let pod = service.on_host("fd00::9".parse().unwrap()).unwrap();
        assert_eq!(pod.authority(), "[fd00::9]:8888");

        let bare = ServiceAddress::parse("svc").unwrap();
        assert_eq!(bare.on_host("10.0.0.1".parse().unwrap()).unwrap().authority(), "10.0.0.1:80");
    }

    #[test]
    fn rejects_other_schemes_and_paths() {
        assert!(ServiceAddress::parse("").is_err());
        assert!(ServiceAddress::parse("https://svc:443").is_err());
        assert!(ServiceAddress::parse("http://svc:80/path").is_err());
    }

    #[test]
    fn builds_target_uri() {
        let addr = ServiceAddress::parse("svc.ns:80").unwrap();
        let uri = addr.uri_for("/hello?x=1").unwrap();
        assert_eq!(uri.to_string(), "http://svc.ns:80/hello?x=1");
    }
}
