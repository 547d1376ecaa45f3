//! Upstream target computation for resolved tenants
//!
//! Given a tenant's routing data and the inbound request URI, [`Rewriter::target`] decides which
//! authority the outbound connection goes to, which virtual host the backend sees, and which path
//! it receives:
//!
//! 1. A tenant `backend_domain` replaces the default host. Loopback names are swapped for the
//!    Docker host alias so a containerized router can reach services on the host machine. The
//!    port is the tenant's `project_port`, else the default backend's port.
//! 2. A `project_port` alone keeps the default hostname and swaps the port.
//! 3. Otherwise the default backend authority is used as configured.
//!
//! The scheme always comes from the default backend.

use crate::route::{route_prefix, ResolvedTenant};
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::http::uri::{Authority, Scheme};
use hyper::Uri;
use std::str::FromStr;
use thiserror::Error;

/// Alias substituted for loopback backend domains
pub const DEFAULT_DOCKER_HOST_ALIAS: &str = "host.docker.internal";

/// Headers that are meaningful for a single transport hop only
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RewriteError {
    #[error("invalid backend URL {url:?}: {reason}")]
    InvalidBackendUrl { url: String, reason: String },
    #[error("backend URL has no host: {0:?}")]
    MissingHost(String),
    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),
}

/// The configured default backend, parsed once
#[derive(Debug, Clone)]
pub struct DefaultBackend {
    scheme: Scheme,
    authority: Authority,
}

impl DefaultBackend {
    /// Parse a backend URL such as `http://localhost:3000`.
    ///
    /// Scheme-less values (`localhost:3000`) are read as plain HTTP.
    pub fn parse(raw: &str) -> Result<Self, RewriteError> {
        let raw = raw.trim();
        let invalid = |reason: String| RewriteError::InvalidBackendUrl {
            url: raw.to_string(),
            reason,
        };

        let uri = match Uri::from_str(raw) {
            Ok(uri) if uri.host().is_some() => uri,
            first => {
                if raw.contains("://") {
                    return match first {
                        Ok(_) => Err(RewriteError::MissingHost(raw.to_string())),
                        Err(e) => Err(invalid(e.to_string())),
                    };
                }
                Uri::from_str(&format!("http://{}", raw)).map_err(|e| invalid(e.to_string()))?
            }
        };

        let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
        if scheme != Scheme::HTTP && scheme != Scheme::HTTPS {
            return Err(invalid(format!("unsupported scheme {}", scheme)));
        }

        let authority = uri
            .authority()
            .filter(|a| !a.host().is_empty())
            .cloned()
            .ok_or_else(|| RewriteError::MissingHost(raw.to_string()))?;

        Ok(Self { scheme, authority })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        self.authority.host()
    }

    /// Port given explicitly in the URL, if any
    pub fn port(&self) -> Option<u16> {
        self.authority.port_u16()
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }
}

/// Where one request goes upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    /// Absolute URI the connection is made to
    pub uri: Uri,
    /// Value for the outbound `Host` header
    pub virtual_host: String,
}

pub struct Rewriter {
    backend: Result<DefaultBackend, RewriteError>,
    docker_host_alias: String,
}

impl Rewriter {
    pub fn new(backend: DefaultBackend, docker_host_alias: impl Into<String>) -> Self {
        Self {
            backend: Ok(backend),
            docker_host_alias: alias_or_default(docker_host_alias.into()),
        }
    }

    /// Build from the raw backend URL. A bad URL is kept as an error and reported per request.
    pub fn from_url(backend_url: &str, docker_host_alias: impl Into<String>) -> Self {
        Self {
            backend: DefaultBackend::parse(backend_url),
            docker_host_alias: alias_or_default(docker_host_alias.into()),
        }
    }

    pub fn backend(&self) -> Result<&DefaultBackend, RewriteError> {
        self.backend.as_ref().map_err(Clone::clone)
    }

    pub fn docker_host_alias(&self) -> &str {
        &self.docker_host_alias
    }

    /// Compute the upstream URI and virtual host for one inbound request
    pub fn target(&self, tenant: &ResolvedTenant, inbound: &Uri) -> Result<UpstreamTarget, RewriteError> {
        let backend = self.backend()?;

        let (authority, virtual_host) = match (&tenant.backend_domain, tenant.project_port) {
            (Some(domain), port) => {
                let host = if is_loopback_name(domain) {
                    self.docker_host_alias.as_str()
                } else {
                    domain.as_str()
                };
                let authority = match port.or(backend.port()) {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
                (authority, domain.clone())
            }
            (None, Some(port)) => {
                let authority = format!("{}:{}", backend.host(), port);
                (authority.clone(), authority)
            }
            (None, None) => {
                let authority = backend.authority().to_string();
                (authority.clone(), authority)
            }
        };

        let path = upstream_path(&tenant.project_route, inbound.path());
        let path_and_query = match inbound.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };

        let uri = Uri::builder()
            .scheme(backend.scheme().clone())
            .authority(authority.as_str())
            .path_and_query(path_and_query.as_str())
            .build()
            .map_err(|e| RewriteError::InvalidTarget(format!("{}: {}", authority, e)))?;

        Ok(UpstreamTarget { uri, virtual_host })
    }
}

fn alias_or_default(alias: String) -> String {
    let alias = alias.trim();
    if alias.is_empty() {
        DEFAULT_DOCKER_HOST_ALIAS.to_string()
    } else {
        alias.to_string()
    }
}

/// Names that only resolve to the local machine
fn is_loopback_name(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "localhost" || host == "127.0.0.1" || host.ends_with(".localhost")
}

/// Upstream path for an inbound path under a normalized project route.
///
/// Dot segments are removed from the inbound path before the route prefix is applied, so a
/// request can never climb out of its tenant's route.
pub fn upstream_path(project_route: &str, inbound_path: &str) -> String {
    let inbound = if inbound_path.starts_with('/') {
        remove_dot_segments(inbound_path)
    } else {
        remove_dot_segments(&format!("/{}", inbound_path))
    };

    format!("{}{}", route_prefix(project_route), inbound)
}

enum Segment {
    Current,
    Parent,
    Name,
}

fn classify(segment: &str) -> Segment {
    const CURRENT: [&str; 2] = [".", "%2e"];
    const PARENT: [&str; 4] = ["..", ".%2e", "%2e.", "%2e%2e"];

    if CURRENT.iter().any(|dot| segment.eq_ignore_ascii_case(dot)) {
        Segment::Current
    } else if PARENT.iter().any(|dots| segment.eq_ignore_ascii_case(dots)) {
        Segment::Parent
    } else {
        Segment::Name
    }
}

/// RFC 3986 section 5.2.4 for an absolute path
fn remove_dot_segments(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').skip(1).collect();
    let last = segments.len().saturating_sub(1);
    let mut output: Vec<&str> = Vec::with_capacity(segments.len());

    for (i, segment) in segments.iter().enumerate() {
        match classify(segment) {
            Segment::Current => {
                if i == last {
                    output.push("");
                }
            }
            Segment::Parent => {
                output.pop();
                if i == last {
                    output.push("");
                }
            }
            Segment::Name => output.push(segment),
        }
    }

    format!("/{}", output.join("/"))
}

/// Remove hop-by-hop headers, including any named by the `Connection` header
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(&name);
    }

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
