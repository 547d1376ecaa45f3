//! SQLite storage for tenant routing rows
//!
//! This module provides the durable `tenants` table behind the directory. Schema changes are
//! additive and tolerate databases created before a column existed.

use crate::directory::TenantStore;
use crate::route::{normalize_project_route, NewTenantRoute, TenantRoute};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Default lock wait for concurrent writers
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const ROUTE_COLUMNS: &str =
    "domain, tenant_id, project_route, project_port, backend_domain, created_at";

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL gives concurrent readers alongside the single writer
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL journal mode")?;
        conn.busy_timeout(busy_timeout)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Current schema version recorded in `schema_migrations`
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("Failed to read schema version")
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                migrate_v1(&conn)?;
            }

            if current_version < 2 {
                migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Get the row stored under an exact domain pattern
    pub fn get_route(&self, domain: &str) -> Result<Option<TenantRoute>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM tenants WHERE domain = ?1", ROUTE_COLUMNS),
            params![domain],
            route_from_row,
        )
        .optional()
        .context("Failed to look up tenant")
    }

    /// Get every row whose pattern contains a wildcard
    pub fn get_wildcard_routes(&self) -> Result<Vec<TenantRoute>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tenants WHERE domain LIKE '%*%'",
            ROUTE_COLUMNS
        ))?;

        let routes = stmt
            .query_map([], route_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to scan wildcard tenants")?;

        Ok(routes)
    }

    /// Insert a row, replacing any row with the same pattern
    pub fn upsert_route(&self, route: &NewTenantRoute) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tenants (domain, tenant_id, project_route, project_port, backend_domain)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(domain) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                project_route = excluded.project_route,
                project_port = excluded.project_port,
                backend_domain = excluded.backend_domain",
            params![
                route.domain_pattern,
                route.tenant_id,
                route.project_route,
                route.project_port,
                route.backend_domain,
            ],
        )
        .context("Failed to add tenant")?;
        Ok(())
    }

    /// Delete a row by pattern
    pub fn delete_route(&self, domain: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn
            .execute("DELETE FROM tenants WHERE domain = ?1", params![domain])
            .context("Failed to delete tenant")?;
        Ok(affected > 0)
    }

    /// List all rows ordered by pattern
    pub fn list_routes(&self) -> Result<Vec<TenantRoute>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tenants ORDER BY domain",
            ROUTE_COLUMNS
        ))?;

        let routes = stmt
            .query_map([], route_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list tenants")?;

        Ok(routes)
    }
}

impl TenantStore for Database {
    fn find_exact(&self, domain: &str) -> Result<Option<TenantRoute>> {
        self.get_route(domain)
    }

    fn wildcard_routes(&self) -> Result<Vec<TenantRoute>> {
        self.get_wildcard_routes()
    }

    fn upsert(&self, route: &NewTenantRoute) -> Result<()> {
        self.upsert_route(route)
    }

    fn delete(&self, domain: &str) -> Result<bool> {
        self.delete_route(domain)
    }

    fn list(&self) -> Result<Vec<TenantRoute>> {
        self.list_routes()
    }
}

fn route_from_row(row: &Row<'_>) -> rusqlite::Result<TenantRoute> {
    let project_route: Option<String> = row.get(2)?;
    let project_port: Option<i64> = row.get(3)?;
    let backend_domain: Option<String> = row.get(4)?;

    Ok(TenantRoute {
        domain_pattern: row.get(0)?,
        tenant_id: row.get(1)?,
        project_route: normalize_project_route(project_route.as_deref().unwrap_or_default()),
        project_port: project_port
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port != 0),
        backend_domain: backend_domain.filter(|domain| !domain.trim().is_empty()),
        created_at: row.get(5)?,
    })
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|name| name == column))
}

/// Add a column unless an older deployment already created it
fn ensure_column(conn: &Connection, table: &str, column: &str, declaration: &str) -> Result<()> {
    if !has_column(conn, table, column)? {
        debug!(table, column, "Adding missing column");
        conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table, column, declaration
        ))?;
    }
    Ok(())
}

/// Migration v1: tenants table
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Applying migration v1: tenants table");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            domain TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            project_route TEXT NOT NULL DEFAULT '/projects/backend',
            project_port INTEGER,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_tenant_id ON tenants(tenant_id);
        "#,
    )?;

    // Tables created before these columns existed
    ensure_column(conn, "tenants", "project_route", "TEXT DEFAULT '/projects/backend'")?;
    ensure_column(conn, "tenants", "project_port", "INTEGER")?;

    conn.execute("INSERT INTO schema_migrations (version) VALUES (1)", [])?;
    Ok(())
}

/// Migration v2: per-tenant backend domain override
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Applying migration v2: backend domain override");

    ensure_column(conn, "tenants", "backend_domain", "TEXT")?;

    conn.execute("INSERT INTO schema_migrations (version) VALUES (2)", [])?;
    Ok(())
}
