use retroverse_core::{LockManager, Retroverse, SqliteLockStore};
use retroverse_sync_server::{
    auth::UserAuth,
    build_router,
    config::Config,
    db::{SqliteDataService, UserRepo, init_database},
};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::{signal, sync::watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "retroverse_sync_server=debug,retroverse_core=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Retroverse Sync Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {:?}", config.data_dir);
    info!("Lock database: {:?}", config.lock_database_path);
    info!("CORS origins: {:?}", config.cors_origins);

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!("Failed to create data directory: {}", e);
        std::process::exit(1);
    }

    // Users database
    let conn = match Connection::open(config.data_dir.join("users.db")) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to open users database: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = init_database(&conn) {
        error!("Failed to initialize users database: {}", e);
        std::process::exit(1);
    }
    let users = Arc::new(UserRepo::new(conn));
    if let Some(token) = &config.dev_user_token {
        match users.upsert_user("dev", token, &["admin"]) {
            Ok(()) => info!("Registered dev user"),
            Err(e) => error!("Failed to register dev user: {}", e),
        }
    }

    // Engine
    let schema = match config.load_schema() {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!("Loaded {} daton types", schema.datons.len());

    let lock_store = match SqliteLockStore::open(&config.lock_database_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to open lock database: {}", e);
            std::process::exit(1);
        }
    };
    let retro_config = config.retroverse_config();
    let locks = LockManager::new(lock_store, &retro_config);
    info!("Server id: {}", locks.server_id());
    let data = Arc::new(SqliteDataService::new(config.data_dir.clone()));
    let retro = Arc::new(Retroverse::new(schema, locks, data, retro_config));

    let app = build_router(retro.clone(), UserAuth::new(users), &config.cors_origins);

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Start background refresh and cleanup
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let background_retro = retro.clone();
    let background = tokio::spawn(async move {
        background_retro
            .run_background(async move {
                let _ = stop_rx.changed().await;
            })
            .await;
    });

    // Run server with graceful shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    let _ = stop_tx.send(true);
    let _ = background.await;

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
