//! HTTP surface.
//!
//! - `newsletter` - subscription endpoints (/v1/newsletter/*)
//! - `health` - health check endpoint (/healthz)
//! - `openapi` - OpenAPI/Utoipa configuration (served as Redoc under /api-docs)

pub mod health;
pub mod newsletter;
pub mod openapi;

pub use health::MISC_TAG;
pub use newsletter::NEWSLETTER_TAG;

use sea_orm::DatabaseConnection;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

use crate::service::SubscriptionService;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: SubscriptionService,
    pub db: Arc<DatabaseConnection>,
}

/// Builds the full router, including the API docs.
pub fn app(state: AppState) -> axum::Router {
    let (router, api) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .nest("/v1/newsletter", newsletter::router())
        .routes(routes!(health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .split_for_parts();

    router.merge(Redoc::with_url("/api-docs", api))
}

/// Serves `app` on `addr` until `shutdown` resolves.
#[tracing::instrument(skip(state, shutdown))]
pub async fn start_webserver(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> color_eyre::Result<()> {
    let router = app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        name = "api.start_webserver.listening",
        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
        addr = %addr,
        message = "Server running"
    );
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(
                name = "api.shutdown_signal.ctrl_c_failed",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                error = %e,
                message = "Failed to listen for Ctrl-C"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
