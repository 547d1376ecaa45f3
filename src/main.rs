use hyper::header::HeaderName;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tenant_router::config::Config;
use tenant_router::db::Database;
use tenant_router::directory::{DirectoryOptions, TenantDirectory};
use tenant_router::pool::{ConnectionPool, PoolConfig};
use tenant_router::proxy::{ProxyOptions, ProxyServer};
use tenant_router::rewrite::Rewriter;
use tokio::sync::watch;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenant_router=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; a missing file means defaults plus environment
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tenant-router.toml"));

    let mut config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    config.apply_env();
    config.validate()?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let bind_addr: SocketAddr = config
        .server
        .address()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.address(), e))?;

    let database = Database::open(&config.database.path, config.database.busy_timeout())?;
    info!(
        path = %config.database.path,
        schema_version = database.schema_version()?,
        "Database schema ready"
    );

    let directory = TenantDirectory::new(
        Arc::new(database),
        DirectoryOptions {
            cache_enabled: config.database.cache_enabled,
        },
    );

    let rewriter = Rewriter::from_url(&config.proxy.backend_url, config.proxy.docker_host_alias.clone());
    if let Ok(backend) = rewriter.backend() {
        if backend.scheme().as_str() == "https" {
            warn!(
                backend_url = %config.proxy.backend_url,
                "HTTPS upstreams are not supported; requests to this backend will fail"
            );
        }
    }

    let pool_config = PoolConfig {
        max_idle_per_host: config.proxy.pool_max_idle_per_host,
        idle_timeout: config.proxy.pool_idle_timeout(),
        keep_alive: !config.proxy.disable_keep_alive,
    };
    let pool = ConnectionPool::new(pool_config);
    let pool_stats = pool.stats();

    let tenant_id_header = match &config.proxy.tenant_id_header {
        Some(name) => Some(HeaderName::try_from(name.as_str())?),
        None => None,
    };

    let options = ProxyOptions {
        request_timeout: config.proxy.request_timeout(),
        admin_domain: config.server.admin_domain.clone(),
        admin_token: config.server.admin_token.clone(),
        tenant_id_header,
        shutdown_timeout: config.server.shutdown_timeout(),
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = ProxyServer::new(bind_addr, directory, rewriter, pool, options, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    if let Err(e) = server_handle.await {
        error!(error = %e, "Proxy server task failed");
    }

    info!(
        total_requests = pool_stats.get_total_requests(),
        failed_requests = pool_stats.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting tenant router");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_domain = ?config.server.admin_domain,
        admin_auth = config.server.admin_token.is_some(),
        "Server configuration"
    );
    info!(
        path = %config.database.path,
        cache_enabled = config.database.cache_enabled,
        busy_timeout_ms = config.database.busy_timeout_ms,
        "Database settings"
    );
    info!(
        backend_url = %config.proxy.backend_url,
        docker_host_alias = %config.proxy.docker_host_alias,
        request_timeout_secs = config.proxy.request_timeout_secs,
        tenant_id_header = ?config.proxy.tenant_id_header,
        "Proxy settings"
    );
    info!(
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
        keep_alive = !config.proxy.disable_keep_alive,
        "Connection pool settings"
    );
}
