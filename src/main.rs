use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use credential_gate::auth::refresh::RefreshFlights;
use credential_gate::cache::SharedCache;
use credential_gate::config::Config;
use credential_gate::gate::RedirectThrottle;
use credential_gate::store::{CredentialBackend, HttpCredentialStore};
use credential_gate::{http_client, middleware, routes};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("Credential Gate starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );

    // One pooled client for refresh, whoami and remote cache calls
    let http = http_client::build_client(
        config.http_max_connections,
        config.http_connect_timeout,
        config.http_request_timeout,
    )?;
    tracing::info!("HTTP client initialized with connection pooling");

    let cache = SharedCache::new();
    let backend = match config.cache_url {
        Some(ref cache_url) => {
            tracing::info!(cache_url = %cache_url, "Using remote credential cache");
            CredentialBackend::Remote(HttpCredentialStore::with_client(
                http.clone(),
                cache_url.clone(),
                Some(config.cache_api_key.clone()),
            ))
        }
        None => {
            tracing::info!("Using built-in credential cache");
            CredentialBackend::Local(cache.clone())
        }
    };

    let throttle = RedirectThrottle::new(config.redirect_throttle_window());
    spawn_throttle_pruner(throttle.clone(), config.redirect_throttle_window());

    let app_state = routes::AppState {
        cache_api_key: config.cache_api_key.clone(),
        cache,
        backend,
        http,
        flights: RefreshFlights::new(),
        throttle,
        settings: Arc::new(config.auth_settings()),
        gate_routes: Arc::new(config.gate_routes()),
    };

    // Build the application with routes and middleware
    let app = build_app(app_state);

    // Bind to configured host and port
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    print_startup_banner(&config);

    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Build the application with all routes and middleware
fn build_app(state: routes::AppState) -> axum::Router {
    use axum::Router;

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::cache_routes(state.clone()))
        .merge(routes::session_routes(state.clone()))
        .merge(routes::gate_routes(state))
        // Auth is per-route
        .layer(middleware::cors_layer())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Drop throttle entries older than the window so idle sessions don't accumulate
fn spawn_throttle_pruner(throttle: RedirectThrottle, window: Duration) {
    let period = window.max(Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            throttle.prune();
        }
    });
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    let banner = r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║                     Credential Gate                       ║
║                                                           ║
║  Token lifecycle and presence gate for the web tier       ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
"#;

    println!("{}", banner);
    println!("  Version:     {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:      http://{}:{}",
        config.server_host, config.server_port
    );
    println!(
        "  Cache:       {}",
        config.cache_url.as_deref().unwrap_or("built-in")
    );
    println!("  Primary:     {}", config.primary_refresh_url);
    println!("  Secondary:   {}", config.secondary_refresh_url);
    println!(
        "  Refresh:     {} attempts, {}ms expiry buffer",
        config.refresh_max_attempts, config.expiry_buffer_ms
    );
    println!("  Log Level:   {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
