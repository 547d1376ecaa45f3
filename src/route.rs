//! Tenant routing rows, host normalization and domain pattern matching
//!
//! A stored domain pattern is either an exact host (`tenant1.example.com`) or contains a single
//! `*` wildcard in one of three shapes: `*.suffix`, `prefix.*` or `prefix*suffix`. The first two
//! compare plain string suffix/prefix plus a label count; the third only checks prefix and suffix.
//! Other patterns with more than one `*` are accepted by the store but never match a host.

use crate::directory::DirectoryError;
use hyper::http::uri::Authority;
use serde::Serialize;
use std::str::FromStr;

/// Project route used when a row has none
pub const DEFAULT_PROJECT_ROUTE: &str = "/projects/backend";

/// Maximum hostname length per RFC 1035
const MAX_DOMAIN_LEN: usize = 253;

/// One persisted routing row, keyed by its domain pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantRoute {
    #[serde(rename = "domain")]
    pub domain_pattern: String,
    pub tenant_id: String,
    pub project_route: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl TenantRoute {
    /// Check if a normalized host matches this row
    pub fn matches(&self, host: &str) -> bool {
        matches_pattern(host, &self.domain_pattern)
    }

    pub fn resolved(&self) -> ResolvedTenant {
        ResolvedTenant {
            tenant_id: self.tenant_id.clone(),
            project_route: normalize_project_route(&self.project_route),
            project_port: self.project_port,
            backend_domain: self.backend_domain.clone(),
        }
    }
}

/// Validated input for an upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTenantRoute {
    pub domain_pattern: String,
    pub tenant_id: String,
    pub project_route: String,
    pub project_port: Option<u16>,
    pub backend_domain: Option<String>,
}

impl NewTenantRoute {
    pub fn new(
        domain_pattern: &str,
        tenant_id: &str,
        project_route: Option<&str>,
        project_port: Option<u16>,
        backend_domain: Option<&str>,
    ) -> Result<Self, DirectoryError> {
        let domain_pattern = normalize_pattern(domain_pattern)?;

        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return Err(DirectoryError::InvalidRoute("tenant_id is required".to_string()));
        }

        if project_port == Some(0) {
            return Err(DirectoryError::InvalidRoute(
                "project_port must be between 1 and 65535".to_string(),
            ));
        }

        let backend_domain = match backend_domain.map(str::trim).filter(|d| !d.is_empty()) {
            Some(domain) => Some(validate_backend_domain(domain)?),
            None => None,
        };

        Ok(Self {
            domain_pattern,
            tenant_id: tenant_id.to_string(),
            project_route: normalize_project_route(project_route.unwrap_or_default()),
            project_port,
            backend_domain,
        })
    }
}

/// Routing data for one resolved host, shared read-only by cache consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTenant {
    pub tenant_id: String,
    pub project_route: String,
    pub project_port: Option<u16>,
    pub backend_domain: Option<String>,
}

fn normalize_pattern(pattern: &str) -> Result<String, DirectoryError> {
    let pattern = pattern.trim().to_lowercase();

    if pattern.is_empty() {
        return Err(DirectoryError::InvalidRoute("domain is required".to_string()));
    }

    if pattern.len() > MAX_DOMAIN_LEN {
        return Err(DirectoryError::InvalidRoute("domain name too long".to_string()));
    }

    let valid_chars = pattern
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '*' | '_'));
    if !valid_chars {
        return Err(DirectoryError::InvalidRoute(format!(
            "domain contains invalid characters: {}",
            pattern
        )));
    }

    Ok(pattern)
}

fn validate_backend_domain(domain: &str) -> Result<String, DirectoryError> {
    let invalid = || DirectoryError::InvalidRoute(format!("backend_domain must be a bare hostname: {}", domain));

    if domain.contains(|c: char| c.is_whitespace() || c == '/' || c == '@') {
        return Err(invalid());
    }

    let authority = Authority::from_str(domain).map_err(|_| invalid())?;
    if authority.port().is_some() {
        return Err(invalid());
    }

    Ok(domain.to_string())
}

/// Normalize a project route to its stored form.
///
/// Blank routes fall back to [`DEFAULT_PROJECT_ROUTE`]. The result always starts with `/` and
/// never ends with one, except the root route which stays `/`.
pub fn normalize_project_route(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT_PROJECT_ROUTE.to_string();
    }

    let without_trailing = trimmed.trim_end_matches('/');
    if without_trailing.is_empty() {
        return "/".to_string();
    }

    if without_trailing.starts_with('/') {
        without_trailing.to_string()
    } else {
        format!("/{}", without_trailing)
    }
}

/// Path prefix contributed by a normalized project route (root contributes nothing)
pub fn route_prefix(project_route: &str) -> &str {
    if project_route == "/" {
        ""
    } else {
        project_route
    }
}

/// Normalize an inbound host: drop any `:port` suffix and lower-case the rest
pub fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();

    let host = if let Some(rest) = raw.strip_prefix('[') {
        // Bracketed IPv6 literal, keep the brackets
        match rest.find(']') {
            Some(end) => &raw[..end + 2],
            None => raw,
        }
    } else {
        raw.split(':').next().unwrap_or(raw)
    };

    host.to_lowercase()
}

fn label_count(name: &str) -> usize {
    name.split('.').count()
}

/// Match a normalized host against a lower-cased domain pattern
pub fn matches_pattern(host: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return host == pattern;
    }

    // `*.suffix`: the wildcard has to consume at least one label
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host.ends_with(suffix) && label_count(host) > label_count(suffix);
    }

    // `prefix.*`: symmetric rule on the right-hand side
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return host.starts_with(prefix) && label_count(host) > label_count(prefix);
    }

    if pattern.matches('*').count() != 1 {
        return false;
    }

    match pattern.split_once('*') {
        Some((prefix, suffix)) => host.starts_with(prefix) && host.ends_with(suffix),
        None => false,
    }
}

/// Literal length of a pattern, used to order wildcard candidates most-specific first
pub fn pattern_specificity(pattern: &str) -> usize {
    pattern.chars().filter(|c| *c != '*').count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_project_route() {
        assert_eq!(normalize_project_route(""), DEFAULT_PROJECT_ROUTE);
        assert_eq!(normalize_project_route("   "), DEFAULT_PROJECT_ROUTE);
        assert_eq!(normalize_project_route("/projects/api"), "/projects/api");
        assert_eq!(normalize_project_route("projects/api/"), "/projects/api");
        assert_eq!(normalize_project_route("/"), "/");
        assert_eq!(normalize_project_route("//"), "/");
    }

    #[test]
    fn test_route_prefix() {
        assert_eq!(route_prefix("/"), "");
        assert_eq!(route_prefix("/projects/api"), "/projects/api");
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Tenant1.Example.COM"), "tenant1.example.com");
        assert_eq!(normalize_host("tenant1.example.com:8080"), "tenant1.example.com");
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
        assert_eq!(normalize_host(" api.example.com "), "api.example.com");
    }

    #[test]
    fn test_exact_pattern() {
        assert!(matches_pattern("example.com", "example.com"));
        assert!(!matches_pattern("sub.example.com", "example.com"));
    }

    #[test]
    fn test_leading_wildcard() {
        assert!(matches_pattern("foo.example.com", "*.example.com"));
        assert!(matches_pattern("deep.foo.example.com", "*.example.com"));
        assert!(!matches_pattern("example.com", "*.example.com"));
        // same label count as the suffix
        assert!(!matches_pattern("fooexample.com", "*.example.com"));
        // plain suffix match plus an extra label is enough
        assert!(matches_pattern("a.fooexample.com", "*.example.com"));
    }

    #[test]
    fn test_trailing_wildcard() {
        assert!(matches_pattern("api.example.com", "api.*"));
        assert!(matches_pattern("api.example", "api.*"));
        assert!(!matches_pattern("api", "api.*"));
        assert!(matches_pattern("apix.example.com", "api.*"));
        assert!(!matches_pattern("web.example.com", "api.*"));
    }

    #[test]
    fn test_inner_wildcard() {
        assert!(matches_pattern("api-eu.example.com", "api-*.example.com"));
        assert!(matches_pattern("api-.example.com", "api-*.example.com"));
        assert!(!matches_pattern("web-eu.example.com", "api-*.example.com"));
        // prefix and suffix are checked independently and may overlap
        assert!(matches_pattern("aba", "ab*ba"));
        assert!(!matches_pattern("abc", "ab*ba"));
    }

    #[test]
    fn test_multiple_wildcards_never_match() {
        assert!(!matches_pattern("a.b.example.com", "*.*.example.com"));
        assert!(!matches_pattern("anything", "**"));
    }

    #[test]
    fn test_new_route_normalizes() {
        let route = NewTenantRoute::new(
            " *.Example.COM ",
            "tenant-1",
            Some("projects/api/"),
            Some(8080),
            Some(" localhost "),
        )
        .unwrap();

        assert_eq!(route.domain_pattern, "*.example.com");
        assert_eq!(route.project_route, "/projects/api");
        assert_eq!(route.project_port, Some(8080));
        assert_eq!(route.backend_domain.as_deref(), Some("localhost"));
    }

    #[test]
    fn test_new_route_defaults() {
        let route = NewTenantRoute::new("a.example.com", "t", None, None, Some("")).unwrap();
        assert_eq!(route.project_route, DEFAULT_PROJECT_ROUTE);
        assert!(route.backend_domain.is_none());
    }

    #[test]
    fn test_new_route_rejects_invalid_input() {
        assert!(NewTenantRoute::new("", "t", None, None, None).is_err());
        assert!(NewTenantRoute::new("a.example.com", "  ", None, None, None).is_err());
        assert!(NewTenantRoute::new("a.example.com", "t", None, Some(0), None).is_err());
        assert!(NewTenantRoute::new("bad host.com", "t", None, None, None).is_err());
        assert!(NewTenantRoute::new("a.example.com", "t", None, None, Some("api:8080")).is_err());
        assert!(NewTenantRoute::new("a.example.com", "t", None, None, Some("api/x")).is_err());
    }

    #[test]
    fn test_resolved_normalizes_legacy_route() {
        let row = TenantRoute {
            domain_pattern: "legacy.example.com".to_string(),
            tenant_id: "legacy".to_string(),
            project_route: "".to_string(),
            project_port: None,
            backend_domain: None,
            created_at: None,
        };

        assert_eq!(row.resolved().project_route, DEFAULT_PROJECT_ROUTE);
    }

    #[test]
    fn test_pattern_specificity() {
        assert!(pattern_specificity("*.api.example.com") > pattern_specificity("*.example.com"));
    }
}
