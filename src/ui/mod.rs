//! HTTP dashboard: static page, JSON API and cached media files.

pub mod formatters;
pub mod handlers;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use state::AppState;

use crate::error::Result;

pub fn build_router(state: Arc<AppState>) -> Router {
    let media = ServeDir::new(state.media.root());
    let root_path = state.root_path.clone();

    let app = Router::new()
        .route("/", get(handlers::index))
        .route("/healthz", get(handlers::healthz))
        .route("/api/choices", get(handlers::choices))
        .route("/api/filters", get(handlers::filters))
        .route("/api/query", get(handlers::run_query))
        .route("/api/rows/{index}/select", post(handlers::select_row))
        .nest_service("/media", media)
        .with_state(state);

    let app = if root_path.is_empty() {
        app
    } else {
        Router::new().nest(&root_path, app)
    };
    app.layer(TraceLayer::new_for_http())
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let root = if state.root_path.is_empty() { "/".to_string() } else { state.root_path.clone() };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Dashboard listening on http://{}{}", addr, root);
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
