//! Dubflow API server.

use dubflow_api::{AppState, routes};
use dubflow_config::RuntimeProfiles;
use dubflow_db::{TaskStore, create_pool, run_migrations};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let data_dir = PathBuf::from(
        std::env::var("DUBFLOW_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
    );
    tokio::fs::create_dir_all(&data_dir).await?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/dubflow.db", data_dir.display()));
    info!(%database_url, "connecting to database");
    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;

    let profiles_path = std::env::var("DUBFLOW_WORKERS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("workers.kdl"));
    let profiles = RuntimeProfiles::load(&profiles_path)?;
    if profiles.is_empty() {
        info!(path = %profiles_path.display(), "no worker profiles configured; stage triggers will fail as worker-unavailable");
    }

    let state = AppState::new(pool, data_dir.join("tasks"), profiles);

    // A stage that was `processing` when the previous process died can never
    // report again; relabel before accepting requests.
    let interrupted = state.store.recover_interrupted().await?;
    if interrupted > 0 {
        info!(stages = interrupted, "relabeled interrupted stages as failed");
    }

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr: SocketAddr = std::env::var("DUBFLOW_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()?;
    info!("starting server on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
