//! HTTP and WebSocket front end.

pub mod error;
pub mod handlers;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{Method, header};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::PipelineResult;
use crate::engine::StageRunner;
use crate::service::PipelineService;

pub use error::ApiError;
pub use ws::ws_router;

/// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn router<R: StageRunner + 'static>(service: Arc<PipelineService<R>>) -> Router {
    let body_limit = service.config().max_upload_bytes + MULTIPART_OVERHEAD;
    let broker = service.broker().clone();

    Router::new()
        .route("/", get(handlers::health))
        .route("/compile", post(handlers::compile::<R>))
        .route(
            "/compile-with-profiling",
            post(handlers::compile_with_profiling::<R>),
        )
        .route("/generate-proof", post(handlers::generate_proof::<R>))
        .route(
            "/generate-proof-with-verifier",
            post(handlers::generate_proof_with_verifier::<R>),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(service)
        .merge(ws_router(broker))
        .layer(cors())
        .layer(TraceLayer::new_for_http())
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

/// Serve until `shutdown` flips. The log WebSocket also gets its own listener when configured.
pub async fn serve<R: StageRunner + 'static>(
    service: Arc<PipelineService<R>>,
    shutdown: watch::Receiver<bool>,
) -> PipelineResult<()> {
    let listen = service.config().listen;
    let ws_listen = service.config().ws_listen.filter(|addr| *addr != listen);

    let ws_task = match ws_listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            info!("log WebSocket listening on {addr}");
            let app = ws_router(service.broker().clone()).layer(TraceLayer::new_for_http());
            let mut rx = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        rx.changed().await.ok();
                    })
                    .await
            }))
        }
        None => None,
    };

    let listener = TcpListener::bind(listen).await?;
    info!("Noir backend running on {listen}");
    let mut rx = shutdown;
    let served = axum::serve(listener, router(service))
        .with_graceful_shutdown(async move {
            rx.changed().await.ok();
            info!("shutting down gracefully");
        })
        .await;

    if let Some(task) = ws_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("log WebSocket server error: {e}"),
            Err(e) => tracing::error!("log WebSocket task failed: {e}"),
        }
    }
    served?;
    Ok(())
}
