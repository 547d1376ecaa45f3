//! Administrative API over the tenant directory
//!
//! Served on the main listener under `/admin`. Mutations go through [`TenantDirectory`] so the
//! resolution cache is invalidated on every write.

use crate::console::ADMIN_CONSOLE_HTML;
use crate::directory::{DirectoryError, TenantDirectory};
use crate::route::NewTenantRoute;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Largest accepted admin request body
const MAX_BODY_BYTES: usize = 64 * 1024;

const TENANTS_PATH: &str = "/admin/tenants";
const CACHE_PATH: &str = "/admin/cache";

/// Whether a path belongs to the admin surface. Anything else under `/admin/` is tenant traffic.
pub fn is_admin_path(path: &str) -> bool {
    let path = path.trim_end_matches('/');
    path == "/admin"
        || path == TENANTS_PATH
        || path == CACHE_PATH
        || path
            .strip_prefix(TENANTS_PATH)
            .is_some_and(|rest| rest.starts_with('/'))
}

type AdminResponse = Response<BoxBody<Bytes, hyper::Error>>;

fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: serde_json::Value) -> AdminResponse {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full(body.to_string()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> AdminResponse {
    json_response(status, serde_json::json!({ "error": message.into() }))
}

fn html_response(body: &'static str) -> AdminResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/html; charset=utf-8")
        .body(full(body))
        .expect("valid response with StatusCode enum and static header")
}

fn with_cors(mut response: AdminResponse) -> AdminResponse {
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert("access-control-max-age", HeaderValue::from_static("300"));
    response
}

/// Request body for `POST /admin/tenants`
#[derive(Debug, Deserialize)]
struct AddTenantRequest {
    #[serde(default)]
    domain: String,
    #[serde(default)]
    tenant_id: String,
    project_route: Option<String>,
    project_port: Option<i64>,
    backend_domain: Option<String>,
}

impl AddTenantRequest {
    fn into_route(self) -> Result<NewTenantRoute, DirectoryError> {
        if self.domain.trim().is_empty() || self.tenant_id.trim().is_empty() {
            return Err(DirectoryError::InvalidRoute(
                "domain and tenant_id are required".to_string(),
            ));
        }

        let project_port = match self.project_port {
            Some(port) => Some(u16::try_from(port).map_err(|_| {
                DirectoryError::InvalidRoute("project_port must be between 1 and 65535".to_string())
            })?),
            None => None,
        };

        NewTenantRoute::new(
            &self.domain,
            &self.tenant_id,
            self.project_route.as_deref(),
            project_port,
            self.backend_domain.as_deref(),
        )
    }
}

/// Admin API state shared by every connection
pub struct AdminApi {
    directory: Arc<TenantDirectory>,
    auth_token: Option<String>,
}

impl AdminApi {
    pub fn new(directory: Arc<TenantDirectory>, auth_token: Option<String>) -> Self {
        Self {
            directory,
            auth_token: auth_token.filter(|t| !t.is_empty()),
        }
    }

    pub fn auth_required(&self) -> bool {
        self.auth_token.is_some()
    }

    fn check_auth<B>(&self, req: &Request<B>) -> bool {
        let Some(expected) = self.auth_token.as_deref() else {
            return true;
        };

        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected))
            .unwrap_or(false)
    }

    /// Handle one request whose path is `/admin` or below
    pub async fn handle<B>(&self, req: Request<B>) -> AdminResponse
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        debug!(%method, %path, "Admin API request");

        if method == Method::OPTIONS {
            return with_cors(
                Response::builder()
                    .status(StatusCode::NO_CONTENT)
                    .body(full(Bytes::new()))
                    .expect("valid response with StatusCode enum"),
            );
        }

        let authorized = self.check_auth(&req);
        let response = match (&method, path.trim_end_matches('/')) {
            // Console page (no auth required; it calls the API with the token)
            (&Method::GET, "/admin") => html_response(ADMIN_CONSOLE_HTML),

            _ if !authorized => {
                warn!(%path, "Unauthorized admin API request");
                json_error(StatusCode::UNAUTHORIZED, "unauthorized")
            }

            (&Method::GET, TENANTS_PATH) => self.list_tenants().await,
            (&Method::POST, TENANTS_PATH) => self.add_tenant(req).await,
            (&Method::DELETE, CACHE_PATH) => self.clear_cache(),
            (&Method::DELETE, p) if p.starts_with("/admin/tenants/") => {
                let raw = p.strip_prefix("/admin/tenants/").unwrap_or_default();
                self.delete_tenant(raw).await
            }

            (_, TENANTS_PATH) | (_, CACHE_PATH) => {
                json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
            }
            _ => json_error(StatusCode::NOT_FOUND, "not found"),
        };

        with_cors(response)
    }

    async fn list_tenants(&self) -> AdminResponse {
        let directory = Arc::clone(&self.directory);
        match tokio::task::spawn_blocking(move || directory.list()).await {
            Ok(Ok(tenants)) => json_response(
                StatusCode::OK,
                serde_json::json!({
                    "count": tenants.len(),
                    "tenants": tenants,
                }),
            ),
            Ok(Err(e)) => directory_error_response(e),
            Err(e) => {
                error!(error = %e, "List task failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }

    async fn add_tenant<B>(&self, req: Request<B>) -> AdminResponse
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let bytes = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, "Failed to read admin request body");
                return json_error(StatusCode::BAD_REQUEST, "Invalid request body");
            }
        };

        let request: AddTenantRequest = match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Invalid admin request body");
                return json_error(StatusCode::BAD_REQUEST, "Invalid request body");
            }
        };

        let route = match request.into_route() {
            Ok(route) => route,
            Err(e) => return directory_error_response(e),
        };

        let directory = Arc::clone(&self.directory);
        let saved = route.clone();
        match tokio::task::spawn_blocking(move || directory.add_or_replace(saved)).await {
            Ok(Ok(())) => {
                let mut body = serde_json::json!({
                    "message": "Tenant added successfully",
                    "domain": route.domain_pattern,
                    "tenant_id": route.tenant_id,
                    "project_route": route.project_route,
                });
                if let Some(port) = route.project_port {
                    body["project_port"] = serde_json::json!(port);
                }
                if let Some(domain) = &route.backend_domain {
                    body["backend_domain"] = serde_json::json!(domain);
                }
                json_response(StatusCode::OK, body)
            }
            Ok(Err(e)) => directory_error_response(e),
            Err(e) => {
                error!(error = %e, "Add task failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }

    async fn delete_tenant(&self, raw_domain: &str) -> AdminResponse {
        let domain = match urlencoding::decode(raw_domain) {
            Ok(decoded) => decoded.trim().to_lowercase(),
            Err(_) => return json_error(StatusCode::BAD_REQUEST, "domain is not valid UTF-8"),
        };

        if domain.is_empty() {
            return json_error(StatusCode::BAD_REQUEST, "domain parameter is required");
        }

        let directory = Arc::clone(&self.directory);
        let target = domain.clone();
        match tokio::task::spawn_blocking(move || directory.delete(&target)).await {
            Ok(Ok(true)) => json_response(
                StatusCode::OK,
                serde_json::json!({
                    "message": "Tenant deleted successfully",
                    "domain": domain,
                }),
            ),
            Ok(Ok(false)) => json_error(StatusCode::NOT_FOUND, format!("tenant not found: {}", domain)),
            Ok(Err(e)) => directory_error_response(e),
            Err(e) => {
                error!(error = %e, "Delete task failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }

    fn clear_cache(&self) -> AdminResponse {
        let cleared = self.directory.cached_len();
        self.directory.clear_cache();
        json_response(
            StatusCode::OK,
            serde_json::json!({
                "message": "Cache cleared",
                "cleared": cleared,
            }),
        )
    }
}

fn directory_error_response(err: DirectoryError) -> AdminResponse {
    match err {
        DirectoryError::InvalidRoute(message) => json_error(StatusCode::BAD_REQUEST, message),
        DirectoryError::Store(e) => {
            error!(error = %format!("{:#}", e), "Tenant store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::directory::DirectoryOptions;

    #[test]
    fn test_is_admin_path() {
        let admin = [
            "/admin",
            "/admin/",
            "/admin/tenants",
            "/admin/tenants/",
            "/admin/tenants/%2A.a.com",
            "/admin/cache",
        ];
        for path in admin {
            assert!(is_admin_path(path), "{} should be admin", path);
        }
        for path in ["/admin/dashboard", "/admin/users/5", "/admin/tenantsx", "/administrator", "/"] {
            assert!(!is_admin_path(path), "{} should be proxied", path);
        }
    }

    fn api(token: Option<&str>) -> AdminApi {
        let store = Arc::new(Database::open_in_memory().unwrap());
        let directory = TenantDirectory::new(store, DirectoryOptions::default());
        AdminApi::new(directory, token.map(String::from))
    }

    fn request(method: Method, path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: AdminResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_list_tenants() {
        let api = api(None);

        let response = api
            .handle(request(
                Method::POST,
                "/admin/tenants",
                r#"{"domain":"Tenant1.Example.com","tenant_id":"tenant-123","project_port":4000}"#,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "*");
        let body = body_json(response).await;
        assert_eq!(body["domain"], "tenant1.example.com");
        assert_eq!(body["project_route"], "/projects/backend");
        assert_eq!(body["project_port"], 4000);

        let response = api.handle(request(Method::GET, "/admin/tenants", "")).await;
        let body = body_json(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["tenants"][0]["domain"], "tenant1.example.com");
        assert_eq!(body["tenants"][0]["tenant_id"], "tenant-123");
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_input() {
        let api = api(None);

        for body in [
            "not json",
            r#"{"domain":"a.example.com"}"#,
            r#"{"domain":"a.example.com","tenant_id":"t","project_port":70000}"#,
            r#"{"domain":"a.example.com","tenant_id":"t","backend_domain":"api:80"}"#,
        ] {
            let response = api.handle(request(Method::POST, "/admin/tenants", body)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {}", body);
        }
    }

    #[tokio::test]
    async fn test_delete_decodes_wildcard_domain() {
        let api = api(None);
        api.handle(request(
            Method::POST,
            "/admin/tenants",
            r#"{"domain":"*.saas.com","tenant_id":"tenant-789"}"#,
        ))
        .await;

        let response = api
            .handle(request(Method::DELETE, "/admin/tenants/%2A.saas.com", ""))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = api
            .handle(request(Method::DELETE, "/admin/tenants/%2A.saas.com", ""))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let api = api(None);
        api.handle(request(
            Method::POST,
            "/admin/tenants",
            r#"{"domain":"a.example.com","tenant_id":"a"}"#,
        ))
        .await;
        api.directory.resolve("a.example.com").await.unwrap();
        assert_eq!(api.directory.cached_len(), 1);

        let response = api.handle(request(Method::DELETE, "/admin/cache", "")).await;
        assert_eq!(body_json(response).await["cleared"], 1);
        assert_eq!(api.directory.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_auth_token_required() {
        let api = api(Some("secret"));
        assert!(api.auth_required());

        let response = api.handle(request(Method::GET, "/admin/tenants", "")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut req = request(Method::GET, "/admin/tenants", "");
        req.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert_eq!(api.handle(req).await.status(), StatusCode::OK);

        // The console page itself is public
        let response = api.handle(request(Method::GET, "/admin", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/html; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_preflight_and_unknown_routes() {
        let api = api(Some("secret"));

        let response = api.handle(request(Method::OPTIONS, "/admin/tenants", "")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().contains_key("access-control-allow-methods"));

        let mut req = request(Method::PUT, "/admin/tenants", "");
        req.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert_eq!(api.handle(req).await.status(), StatusCode::METHOD_NOT_ALLOWED);

        let mut req = request(Method::GET, "/admin/nope", "");
        req.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        assert_eq!(api.handle(req).await.status(), StatusCode::NOT_FOUND);
    }
}
