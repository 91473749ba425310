pub mod error;
pub mod middleware;
pub mod registry;
pub mod service;
pub mod settings;
pub mod state;

use anyhow::Result;
use axum::{http::header, response::IntoResponse, routing::get, Router};
use state::AppState;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::{info, warn};

use crate::version::VersionInfo;

/// Build the HTTP router.
///
/// Only the update endpoint sits behind the admission chain.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/robots.txt", get(robots_txt))
        .route("/health", get(health_check))
        .route("/version", get(version_info));

    Router::new()
        .merge(public_routes)
        .nest("/api/v1", service::routes::routes(&state))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::request_id_middleware))
                // ServerError already logs failed requests once
                .layer(
                    TraceLayer::new_for_http()
                        .on_failure(DefaultOnFailure::new().level(tracing::Level::DEBUG)),
                ),
        )
}

/// Run the HTTP server until SIGINT/SIGTERM
pub async fn run_server(settings: settings::Settings) -> Result<()> {
    let state = AppState::new_for_server(&settings)?;
    let app = router(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);

    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signalled_tx.send(());
    });

    let grace = Duration::from_secs(settings.server.shutdown_grace_secs);
    tokio::select! {
        result = server.into_future() => result?,
        _ = async {
            if signalled_rx.await.is_ok() {
                tokio::time::sleep(grace).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            warn!(grace = ?grace, "Shutdown grace period elapsed, dropping in-flight requests");
        }
    }

    info!("HTTP server shutdown complete");
    Ok(())
}

async fn robots_txt() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "User-agent: *\nDisallow: /\n",
    )
}

async fn health_check() -> &'static str {
    "OK"
}

async fn version_info() -> axum::Json<VersionInfo> {
    axum::Json(VersionInfo::current())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
