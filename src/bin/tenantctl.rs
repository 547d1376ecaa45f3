//! tenantctl - Offline management of the tenant routing database
//!
//! Usage:
//!   tenantctl [--db <path>] list
//!   tenantctl [--db <path>] add <domain> <tenant_id> [--route <path>] [--port <n>] [--backend-domain <host>]
//!   tenantctl [--db <path>] delete <domain>
//!   tenantctl [--db <path>] seed
//!
//! The database path defaults to `DB_PATH`, then `./tenants.db`.
//! A running router caches resolutions; use `DELETE /admin/cache` after offline edits.

use anyhow::{bail, Context, Result};
use std::env;
use tenant_router::db::{Database, DEFAULT_BUSY_TIMEOUT};
use tenant_router::route::NewTenantRoute;

const DEFAULT_DB_PATH: &str = "./tenants.db";

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Version,
    List,
    Add {
        domain: String,
        tenant_id: String,
        route: Option<String>,
        port: Option<u16>,
        backend_domain: Option<String>,
    },
    Delete {
        domain: String,
    },
    Seed,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let db_path = take_flag(&mut args, "--db")
        .or_else(|| env::var("DB_PATH").ok().filter(|p| !p.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

    let command = parse_command(&args)?;

    match command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("tenantctl {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let db = Database::open(&db_path, DEFAULT_BUSY_TIMEOUT)
        .with_context(|| format!("Failed to open database at {}", db_path))?;

    match command {
        Command::List => list(&db)?,
        Command::Add {
            domain,
            tenant_id,
            route,
            port,
            backend_domain,
        } => {
            let new_route = NewTenantRoute::new(
                &domain,
                &tenant_id,
                route.as_deref(),
                port,
                backend_domain.as_deref(),
            )?;
            db.upsert_route(&new_route)?;
            println!(
                "Saved {} -> {} ({})",
                new_route.domain_pattern, new_route.tenant_id, new_route.project_route
            );
        }
        Command::Delete { domain } => {
            if db.delete_route(&domain.trim().to_ascii_lowercase())? {
                println!("Deleted {}", domain);
            } else {
                bail!("No tenant route for {}", domain);
            }
        }
        Command::Seed => seed(&db)?,
        Command::Help | Command::Version => {}
    }

    Ok(())
}

/// Remove `flag <value>` from the argument list and return the value
fn take_flag(args: &mut Vec<String>, flag: &str) -> Option<String> {
    let index = args.iter().position(|a| a == flag)?;
    args.remove(index);
    if index < args.len() {
        Some(args.remove(index))
    } else {
        None
    }
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };

    let command = match first.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-v" => Command::Version,
        "list" | "ls" => Command::List,
        "seed" => Command::Seed,
        "delete" | "rm" => {
            let domain = args.get(1).cloned().context("delete requires <domain>")?;
            Command::Delete { domain }
        }
        "add" => {
            let mut rest: Vec<String> = args[1..].to_vec();
            let route = take_flag(&mut rest, "--route");
            let port = match take_flag(&mut rest, "--port") {
                Some(raw) => Some(
                    raw.parse::<u16>()
                        .with_context(|| format!("Invalid port '{}'", raw))?,
                ),
                None => None,
            };
            let backend_domain = take_flag(&mut rest, "--backend-domain");

            let mut positional = rest.into_iter();
            let domain = positional.next().context("add requires <domain> <tenant_id>")?;
            let tenant_id = positional.next().context("add requires <domain> <tenant_id>")?;

            Command::Add {
                domain,
                tenant_id,
                route,
                port,
                backend_domain,
            }
        }
        other => bail!("Unknown command '{}'; run `tenantctl help`", other),
    };

    Ok(command)
}

fn list(db: &Database) -> Result<()> {
    let routes = db.list_routes()?;
    if routes.is_empty() {
        println!("No tenants configured");
        return Ok(());
    }

    println!(
        "{:<32} {:<16} {:<24} {:<6} {}",
        "DOMAIN", "TENANT", "ROUTE", "PORT", "BACKEND DOMAIN"
    );
    for route in routes {
        println!(
            "{:<32} {:<16} {:<24} {:<6} {}",
            route.domain_pattern,
            route.tenant_id,
            route.project_route,
            route.project_port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            route.backend_domain.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn seed(db: &Database) -> Result<()> {
    let samples = [
        ("tenant1.example.com", "tenant-123"),
        ("tenant2.example.com", "tenant-456"),
        ("*.saas.com", "tenant-789"),
    ];

    for (domain, tenant_id) in samples {
        let route = NewTenantRoute::new(domain, tenant_id, None, None, None)?;
        db.upsert_route(&route)?;
        println!("Seeded {} -> {}", domain, tenant_id);
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"tenantctl - manage the tenant routing database

USAGE:
    tenantctl [--db <path>] <command>

COMMANDS:
    list                                  List tenant routes
    add <domain> <tenant_id> [options]    Add or replace a tenant route
        --route <path>                    Project route (default /projects/backend)
        --port <n>                        Backend port for this tenant
        --backend-domain <host>           Virtual host sent upstream
    delete <domain>                       Delete a tenant route
    seed                                  Insert example tenants
    help                                  Show this help
    version                               Show version

ENVIRONMENT:
    DB_PATH                               Database path (default ./tenants.db)"#
    );
}
