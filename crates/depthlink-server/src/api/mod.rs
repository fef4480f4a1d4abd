mod video;

pub use video::{ByteRange, CHUNK_SIZE};

use crate::state::AppState;
use crate::ws;
use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // Recordings
        .route("/videoInfo", get(video::video_info))
        .route("/video/{id}", get(video::get_video))
        // Signalling relay
        .route("/signalling", get(ws::signalling::ws_handler))
        // Provider ingress
        .route("/colorProvider", get(ws::streams::color_provider))
        .route("/depthProvider", get(ws::streams::depth_provider))
        .route("/matrixProvider", get(ws::streams::matrix_provider))
        // Consumer egress
        .route("/color", get(ws::streams::color_consumer))
        .route("/depth", get(ws::streams::depth_consumer))
        .route("/matrix", get(ws::streams::matrix_consumer))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
