pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use state::{AdmissionMetrics, AppState, SharedState};

/// Build the Axum router with all admin API routes and middleware.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/api/health", get(routes::health::health_check))
        // Limiter, scheduler and load overview
        .route("/api/status", get(routes::status::get_status))
        // Per-user quota overrides
        .route(
            "/api/quotas/{user_id}",
            get(routes::quotas::get_quota)
                .put(routes::quotas::set_quota)
                .delete(routes::quotas::clear_quota),
        )
        // Configuration management
        .route(
            "/api/config",
            get(routes::config::get_config).put(routes::config::update_config),
        )
        .route("/api/config/reload", post(routes::config::reload_config))
        // Prometheus metrics
        .route("/api/metrics", get(routes::metrics::get_metrics))
        .with_state(state)
        .layer(cors)
}

/// Serve the admin API until `shutdown` resolves.
pub async fn run_admin_server(
    state: SharedState,
    listen_addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("admin API server listening on {}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
