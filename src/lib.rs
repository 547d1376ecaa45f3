//! Tenant Router - A multi-tenant HTTP gateway
//!
//! This library provides a reverse proxy that:
//! - Maps the inbound host to a tenant using exact and wildcard domain patterns
//! - Keeps the routing table in SQLite behind a read-through resolution cache
//! - Collapses concurrent first lookups for the same host into one store query
//! - Rewrites each request onto the tenant's project route and backend host
//! - Streams upstream responses back verbatim, redirects included
//! - Exposes a small admin API and console for managing tenant routes

pub mod admin;
pub mod config;
pub mod console;
pub mod db;
pub mod directory;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod rewrite;
pub mod route;
pub mod singleflight;
