//! Tenant directory: host resolution over the persistent store
//!
//! Resolution normalizes the inbound host, serves repeat lookups from an unbounded read-through
//! cache, and collapses concurrent misses for the same host into a single store query.
//!
//! # Wildcard order
//!
//! When several wildcard patterns match a host, the most specific pattern wins: the one with the
//! most literal (non-`*`) characters, ties broken by pattern text. The store's own enumeration
//! order is never relied on.
//!
//! # Staleness
//!
//! Writes invalidate the cache entry keyed by the written pattern only. Hosts that were resolved
//! through a wildcard pattern stay cached after that pattern changes, until the cache is
//! cleared. There is no reverse index from patterns to the hosts they satisfied.

use crate::route::{normalize_host, pattern_specificity, NewTenantRoute, ResolvedTenant, TenantRoute};
use crate::singleflight::SingleFlight;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Durable table of domain pattern rows
pub trait TenantStore: Send + Sync {
    /// Row stored under exactly this pattern
    fn find_exact(&self, domain: &str) -> anyhow::Result<Option<TenantRoute>>;

    /// All rows whose pattern contains a `*`, in no particular order
    fn wildcard_routes(&self) -> anyhow::Result<Vec<TenantRoute>>;

    /// Insert or replace the row keyed by `route.domain_pattern`
    fn upsert(&self, route: &NewTenantRoute) -> anyhow::Result<()>;

    /// Remove a row, returning whether one existed
    fn delete(&self, domain: &str) -> anyhow::Result<bool>;

    /// All rows ordered by pattern
    fn list(&self) -> anyhow::Result<Vec<TenantRoute>>;
}

/// Resolution failure, shared by every waiter of a collapsed lookup
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("tenant not found for domain: {0}")]
    NotFound(String),
    #[error("directory unavailable: {0}")]
    Directory(String),
}

/// Failure on the mutation surface
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("invalid tenant route: {0}")]
    InvalidRoute(String),
    #[error("directory store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct DirectoryOptions {
    /// Serve repeat resolutions from memory
    pub cache_enabled: bool,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        Self { cache_enabled: true }
    }
}

type Resolution = Result<Arc<ResolvedTenant>, ResolveError>;

/// Outcome of one store lookup, tagged with the generation it started under
#[derive(Clone)]
struct Flight {
    resolution: Resolution,
    generation: u64,
}

/// Maps inbound hosts to tenant routing data.
///
/// Constructed once at startup and shared as `Arc<TenantDirectory>` by the proxy and the admin
/// surface.
pub struct TenantDirectory {
    store: Arc<dyn TenantStore>,
    cache: DashMap<String, Arc<ResolvedTenant>>,
    flights: SingleFlight<Flight>,
    /// Bumped by every mutation; lookups started under an older generation are not cached
    generation: Arc<AtomicU64>,
    options: DirectoryOptions,
}

impl TenantDirectory {
    pub fn new(store: Arc<dyn TenantStore>, options: DirectoryOptions) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache: DashMap::new(),
            flights: SingleFlight::new(),
            generation: Arc::new(AtomicU64::new(0)),
            options,
        })
    }

    pub fn cache_enabled(&self) -> bool {
        self.options.cache_enabled
    }

    /// Resolve an inbound host (optionally carrying `:port`) to its tenant
    pub async fn resolve(&self, host: &str) -> Result<Arc<ResolvedTenant>, ResolveError> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(ResolveError::NotFound(host));
        }

        if self.options.cache_enabled {
            if let Some(hit) = self.cache.get(&host) {
                return Ok(Arc::clone(hit.value()));
            }
        }

        let store = Arc::clone(&self.store);
        let generation = Arc::clone(&self.generation);
        let key = host.clone();

        // The generation is read by the call that queries the store, so every waiter sharing
        // this call sees the generation its result was read under
        let work = async move {
            let started = generation.load(Ordering::Acquire);
            let lookup_host = key.clone();
            let task = tokio::task::spawn_blocking(move || lookup(store.as_ref(), &lookup_host));
            let resolution = match task.await {
                Ok(result) => result,
                Err(e) => Err(ResolveError::Directory(format!("lookup task failed: {}", e))),
            };
            Flight {
                resolution,
                generation: started,
            }
        };

        let flight = self.flights.run(&host, work).await.ok_or_else(|| {
            ResolveError::Directory("lookup aborted".to_string())
        })?;
        let resolved = flight.resolution?;

        if self.options.cache_enabled
            && !resolved.tenant_id.is_empty()
            && self.generation.load(Ordering::Acquire) == flight.generation
        {
            self.cache.insert(host.clone(), Arc::clone(&resolved));
            // A mutation that landed between the check and the insert wins
            if self.generation.load(Ordering::Acquire) != flight.generation {
                self.cache.remove_if(&host, |_, cached| Arc::ptr_eq(cached, &resolved));
            }
        }

        Ok(resolved)
    }

    /// Insert or replace a row, then drop the cache entry for its pattern
    pub fn add_or_replace(&self, route: NewTenantRoute) -> Result<(), DirectoryError> {
        self.store.upsert(&route)?;
        self.invalidate(&route.domain_pattern);

        info!(
            domain = %route.domain_pattern,
            tenant_id = %route.tenant_id,
            project_route = %route.project_route,
            project_port = ?route.project_port,
            backend_domain = ?route.backend_domain,
            "Tenant route saved"
        );
        Ok(())
    }

    /// Delete a row, then drop the cache entry for its pattern
    pub fn delete(&self, domain_pattern: &str) -> Result<bool, DirectoryError> {
        let domain = domain_pattern.trim().to_lowercase();
        let removed = self.store.delete(&domain)?;
        self.invalidate(&domain);

        if removed {
            info!(domain = %domain, "Tenant route deleted");
        }
        Ok(removed)
    }

    /// All rows ordered by pattern, straight from the store
    pub fn list(&self) -> Result<Vec<TenantRoute>, DirectoryError> {
        Ok(self.store.list()?)
    }

    /// Drop every cached resolution
    pub fn clear_cache(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.flights.forget_all();
        let cleared = self.cache.len();
        self.cache.clear();
        info!(cleared, "Resolution cache cleared");
    }

    /// Number of cached hosts
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn invalidate(&self, domain: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.flights.forget_all();
        if self.cache.remove(domain).is_some() {
            debug!(domain, "Cache entry invalidated");
        }
    }
}

/// Exact match first, then the most specific matching wildcard
fn lookup(store: &dyn TenantStore, host: &str) -> Resolution {
    let directory_error = |e: anyhow::Error| {
        warn!(host, error = %format!("{:#}", e), "Tenant lookup failed");
        ResolveError::Directory(format!("{:#}", e))
    };

    if let Some(route) = store.find_exact(host).map_err(directory_error)? {
        debug!(host, tenant_id = %route.tenant_id, "Resolved by exact match");
        return Ok(Arc::new(route.resolved()));
    }

    let mut candidates = store.wildcard_routes().map_err(directory_error)?;
    candidates.sort_by(|a, b| {
        pattern_specificity(&b.domain_pattern)
            .cmp(&pattern_specificity(&a.domain_pattern))
            .then_with(|| a.domain_pattern.cmp(&b.domain_pattern))
    });

    match candidates.iter().find(|route| route.matches(host)) {
        Some(route) => {
            debug!(host, pattern = %route.domain_pattern, tenant_id = %route.tenant_id, "Resolved by wildcard");
            Ok(Arc::new(route.resolved()))
        }
        None => {
            debug!(host, "No tenant matches host");
            Err(ResolveError::NotFound(host.to_string()))
        }
    }
}
