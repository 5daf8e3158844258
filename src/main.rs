use anyhow::{Context, Result};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use country_gate::api;
use country_gate::auth::AuthService;
use country_gate::config::{AuthMode, Config, DatabaseBackend};
use country_gate::gate::{CountryApiResolver, GatePipeline, GateState};
use country_gate::models::COUNTRY_CODES;
use country_gate::site;
use country_gate::storage::{PostgresStorage, SqliteStorage, Storage};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration");

    // Initialize storage
    let storage: Arc<dyn Storage> = match config.database.backend {
        DatabaseBackend::Sqlite => {
            info!("Using SQLite storage: {}", config.database.url);
            Arc::new(
                SqliteStorage::new(&config.database.url, config.database.max_connections).await?,
            )
        }
        DatabaseBackend::Postgres => {
            info!("Using PostgreSQL storage: {}", config.database.url);
            Arc::new(
                PostgresStorage::new(&config.database.url, config.database.max_connections)
                    .await?,
            )
        }
    };

    info!("Initializing database...");
    storage.init().await.context("failed to initialize database")?;
    info!("Database initialized successfully");

    if config.ledger.preload_countries {
        let inserted = storage
            .preload(COUNTRY_CODES)
            .await
            .context("failed to preload country statistics")?;
        if inserted > 0 {
            info!("Preloaded {} countries into visitor statistics", inserted);
        }
    }

    let auth_service = Arc::new(AuthService::new(&config.auth));
    match config.auth.mode {
        AuthMode::None => {
            info!("🔓 Authentication is disabled - admin API is open and no visitor is privileged");
        }
        AuthMode::ApiKey => {
            info!(
                "🔐 API key authentication enabled ({} key(s) configured)",
                config.auth.api_keys.len()
            );
        }
    }

    let resolver = Arc::new(CountryApiResolver::new(&config.geolocation)?);
    info!(
        "🌍 Geolocation provider: {} (timeout {} ms, cache {} s)",
        config.geolocation.api_url, config.geolocation.timeout_ms, config.geolocation.cache_ttl_secs
    );

    let gate = Arc::new(GateState {
        pipeline: Arc::new(GatePipeline::new(Arc::clone(&storage), resolver)),
        auth: Arc::clone(&auth_service),
        proxy: config.proxy.clone(),
    });

    // Create routers
    let api_router = api::create_api_router(Arc::clone(&storage), auth_service, Arc::clone(&gate));
    let site_router = site::create_site_router(gate, config.site.static_dir.as_deref());

    if let Some(ref static_dir) = config.site.static_dir {
        info!("🗂  Serving site from directory: {}", static_dir);
    } else {
        info!("🗂  No SITE_STATIC_DIR set, serving placeholder page");
    }

    // Start API server
    let api_addr = format!("{}:{}", config.api_server.host, config.api_server.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind admin API on {api_addr}"))?;
    info!("🚀 Admin API listening on http://{}/api", api_addr);

    // Start site server
    let site_addr = format!("{}:{}", config.site_server.host, config.site_server.port);
    let site_listener = tokio::net::TcpListener::bind(&site_addr)
        .await
        .with_context(|| format!("failed to bind site on {site_addr}"))?;
    info!("🚀 Gated site listening on http://{}", site_addr);

    // Run both servers concurrently
    tokio::try_join!(
        axum::serve(
            api_listener,
            api_router.into_make_service_with_connect_info::<SocketAddr>()
        )
        .into_future(),
        axum::serve(
            site_listener,
            site_router.into_make_service_with_connect_info::<SocketAddr>()
        )
        .into_future(),
    )?;

    Ok(())
}
