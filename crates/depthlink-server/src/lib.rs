//! Depthlink Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod error;
pub mod recording;
pub mod state;
pub mod ws;

use anyhow::Result;

/// Create and configure the server application
pub async fn create_app(config: state::Config) -> Result<axum::Router> {
    let app_state = state::AppState::new(config).await?;
    Ok(api::create_router(app_state))
}
