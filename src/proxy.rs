//! HTTP front door of the router.
//!
//! Each request is dispatched in order: `/health` answers locally, the admin routes go to
//! [`AdminApi`], a bare `/` on the admin domain redirects to the tenant list, and everything else
//! is proxied. Proxying takes the effective host, resolves it through the [`TenantDirectory`],
//! rewrites the target with the [`Rewriter`], forwards through the connection pool and relays the
//! upstream response back.

use crate::admin::{is_admin_path, AdminApi};
use crate::directory::{ResolveError, TenantDirectory};
use crate::error::{error_response, ProxyErrorCode};
use crate::pool::ConnectionPool;
use crate::relay::{relay_response, RelayContext};
use crate::rewrite::{strip_hop_by_hop, Rewriter};
use crate::route::normalize_host;
use futures::FutureExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Fallback host header set by some load balancers
const X_ORIGINAL_HOST: &str = "x-original-host";

/// Maximum hostname length per RFC 1035, plus room for a port
const MAX_HOST_LEN: usize = 253 + 6;

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Settings for the request pipeline
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Upper bound on waiting for an upstream response head
    pub request_timeout: Duration,
    /// Host whose `/` redirects to the admin console
    pub admin_domain: Option<String>,
    /// Bearer token for the admin API
    pub admin_token: Option<String>,
    /// Header carrying the resolved tenant id upstream
    pub tenant_id_header: Option<HeaderName>,
    /// How long shutdown waits for open connections
    pub shutdown_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            admin_domain: None,
            admin_token: None,
            tenant_id_header: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// State shared by every connection
struct ProxyState {
    directory: Arc<TenantDirectory>,
    rewriter: Rewriter,
    pool: ConnectionPool,
    admin: AdminApi,
    options: ProxyOptions,
}

/// The tenant-routing reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        directory: Arc<TenantDirectory>,
        rewriter: Rewriter,
        pool: ConnectionPool,
        options: ProxyOptions,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let admin = AdminApi::new(Arc::clone(&directory), options.admin_token.clone());
        if !admin.auth_required() {
            warn!("Admin API has no token configured; tenant routes can be changed by any client");
        }

        Self {
            bind_addr,
            state: Arc::new(ProxyState {
                directory,
                rewriter,
                pool,
                admin,
                options,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let active = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let shutdown_rx = self.shutdown_rx.clone();
                            let active = Arc::clone(&active);

                            active.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state, shutdown_rx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                                active.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        self.drain(&active).await;
        Ok(())
    }

    async fn drain(&self, active: &AtomicUsize) {
        let timeout = self.state.options.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, async {
            while active.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => info!("All connections closed"),
            Err(_) => warn!(
                remaining = active.load(Ordering::SeqCst),
                timeout_secs = timeout.as_secs(),
                "Shutdown timeout reached with open connections"
            ),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle_request_guarded(req, state, addr).await) }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
        _ = shutdown_rx.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
    }

    Ok(())
}

/// Run the request pipeline, turning a panic into a 500 for this request only
async fn handle_request_guarded(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> ProxyResponse {
    match AssertUnwindSafe(handle_request(req, state, client_addr))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(client = %client_addr, panic = %message, "Request handler panicked");
            error_response(ProxyErrorCode::InternalError, "Internal server error")
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> ProxyResponse {
    let path = req.uri().path();

    if path == "/health" {
        return health_response();
    }

    if is_admin_path(path) {
        return state.admin.handle(req).await;
    }

    if path == "/" {
        if let (Some(admin_domain), Some(host)) = (&state.options.admin_domain, effective_host(&req)) {
            if normalize_host(&host) == normalize_host(admin_domain) {
                return redirect_response("/admin");
            }
        }
    }

    proxy_request(req, &state, client_addr).await
}

async fn proxy_request(
    req: Request<Incoming>,
    state: &ProxyState,
    client_addr: SocketAddr,
) -> ProxyResponse {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = match effective_host(&req) {
        Some(h) if is_valid_host(&h) => h,
        _ => {
            debug!(request_id, "Request without usable host");
            return error_response(ProxyErrorCode::MissingHostHeader, "Missing Host header");
        }
    };

    debug!(host, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let tenant = match state.directory.resolve(&host).await {
        Ok(tenant) => tenant,
        Err(e) => {
            let code = ProxyErrorCode::from(&e);
            return match e {
                ResolveError::NotFound(_) => {
                    debug!(host, request_id, "Tenant not found");
                    error_response(code, "Invalid tenant domain")
                }
                ResolveError::Directory(message) => {
                    error!(host, request_id, error = %message, "Tenant directory unavailable");
                    error_response(code, "Tenant directory unavailable")
                }
            };
        }
    };

    let target = match state.rewriter.target(&tenant, req.uri()) {
        Ok(target) => target,
        Err(e) => {
            error!(host, tenant_id = %tenant.tenant_id, error = %e, "Invalid backend configuration");
            return error_response(ProxyErrorCode::BackendConfigError, "Invalid backend URL configuration");
        }
    };

    let (mut parts, body) = req.into_parts();

    strip_hop_by_hop(&mut parts.headers);

    let virtual_host = match HeaderValue::from_str(&target.virtual_host) {
        Ok(value) => value,
        Err(e) => {
            error!(host, virtual_host = %target.virtual_host, error = %e, "Invalid virtual host");
            return error_response(ProxyErrorCode::BackendConfigError, "Invalid backend URL configuration");
        }
    };
    let original_host = parts.headers.insert(HOST, virtual_host);

    // Overwrite X-Forwarded-For and X-Forwarded-Proto; this proxy is the first trusted hop
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        parts.headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        parts.headers.insert(X_FORWARDED_FOR, value);
    }
    parts.headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    if !parts.headers.contains_key(X_FORWARDED_HOST) {
        if let Some(original) = original_host {
            parts.headers.insert(X_FORWARDED_HOST, original);
        }
    }

    if let Some(header) = &state.options.tenant_id_header {
        if let Ok(value) = HeaderValue::from_str(&tenant.tenant_id) {
            parts.headers.insert(header.clone(), value);
        }
    }

    let upstream = target.uri.to_string();
    parts.uri = target.uri;
    parts.version = Version::HTTP_11;

    let outbound = Request::from_parts(parts, body.boxed());
    let request_timeout = state.options.request_timeout;

    debug!(host, tenant_id = %tenant.tenant_id, upstream, request_id, "Forwarding request");

    match tokio::time::timeout(request_timeout, state.pool.send_request(outbound)).await {
        Ok(Ok(response)) => {
            debug!(host, upstream, request_id, status = response.status().as_u16(), "Upstream responded");
            relay_response(response, RelayContext::new(request_id, host, upstream))
        }
        Ok(Err(e)) => {
            error!(host, upstream, request_id, error = %e, "Upstream request failed");
            error_response(ProxyErrorCode::UpstreamUnavailable, "Upstream unavailable")
        }
        Err(_) => {
            warn!(
                host,
                upstream,
                request_id,
                timeout_secs = request_timeout.as_secs(),
                "Upstream request timed out"
            );
            error_response(
                ProxyErrorCode::UpstreamTimeout,
                format!("Upstream timed out after {} seconds", request_timeout.as_secs()),
            )
        }
    }
}

fn header_str<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// The request's own host (URI authority or `Host`), then `X-Forwarded-Host`, then
/// `X-Original-Host`
fn effective_host<B>(req: &Request<B>) -> Option<String> {
    req.uri()
        .authority()
        .map(|authority| authority.as_str().to_string())
        .or_else(|| header_str(req, HOST.as_str()))
        .or_else(|| header_str(req, X_FORWARDED_HOST))
        .or_else(|| header_str(req, X_ORIGINAL_HOST))
}

/// Reject hosts that could never name a tenant, keeping them out of logs and the cache
fn is_valid_host(host: &str) -> bool {
    host.len() <= MAX_HOST_LEN
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':' | '[' | ']'))
}

fn health_response() -> ProxyResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(
            Full::new(Bytes::from_static(br#"{"status":"ok","service":"tenant-router"}"#))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}

fn redirect_response(location: &'static str) -> ProxyResponse {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from_static(b"Found"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_effective_host_prefers_own_host() {
        let req = request(
            "/",
            &[("host", "a.example.com"), ("x-forwarded-host", "b.example.com")],
        );
        assert_eq!(effective_host(&req).as_deref(), Some("a.example.com"));
    }

    #[test]
    fn test_effective_host_uses_uri_authority() {
        let req = request("http://c.example.com:8080/path", &[]);
        assert_eq!(effective_host(&req).as_deref(), Some("c.example.com:8080"));
    }

    #[test]
    fn test_effective_host_fallback_order() {
        let req = request(
            "/",
            &[("x-forwarded-host", "b.example.com, proxy.internal"), ("x-original-host", "c.example.com")],
        );
        assert_eq!(effective_host(&req).as_deref(), Some("b.example.com"));

        let req = request("/", &[("x-original-host", "c.example.com")]);
        assert_eq!(effective_host(&req).as_deref(), Some("c.example.com"));

        let req = request("/", &[("host", "")]);
        assert_eq!(effective_host(&req), None);
    }

    #[test]
    fn test_is_valid_host() {
        assert!(is_valid_host("tenant1.example.com"));
        assert!(is_valid_host("tenant1.example.com:8080"));
        assert!(is_valid_host("[::1]:8080"));
        assert!(!is_valid_host("evil.com\r\nX-Injected: 1"));
        assert!(!is_valid_host("a b.com"));
        assert!(!is_valid_host(&"a".repeat(300)));
    }

    #[tokio::test]
    async fn test_health_response() {
        let response = health_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"status":"ok","service":"tenant-router"}"#);
    }

    #[test]
    fn test_redirect_response() {
        let response = redirect_response("/admin");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("location").unwrap(), "/admin");
    }
}
