//! REST API Routes Module
//!
//! All business routes live under `/api/v1`. CORS is permissive in
//! development (no configured origins) and restricted to the configured
//! origin list otherwise.

pub mod board;
pub mod health;
pub mod pm;
pub mod projects;
pub mod tasks;
pub mod tokens;
pub mod workers;

use axum::{http::HeaderValue, response::IntoResponse, routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

use crate::error::ApiResult;
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Handler for /openapi.json.
async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

fn cors_layer(state: &AppState) -> ApiResult<CorsLayer> {
    if state.config.cors_origins.is_empty() {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }
    let mut origins = Vec::with_capacity(state.config.cors_origins.len());
    for origin in &state.config.cors_origins {
        let value = origin.parse::<HeaderValue>().map_err(|_| {
            crate::error::ApiError::invalid_input(format!("Invalid CORS origin '{}'", origin))
        })?;
        origins.push(value);
    }
    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any))
}

/// Assemble the full application router.
pub fn create_api_router(state: AppState) -> ApiResult<Router> {
    let cors = cors_layer(&state)?;

    let api = Router::new()
        .nest("/workers", workers::create_router(state.clone()))
        .nest("/tasks", tasks::create_router(state.clone()))
        .nest("/pm", pm::create_router(state.clone()))
        .nest("/board", board::create_router(state.clone()))
        .nest("/projects", projects::create_router(state.clone()))
        .nest("/tokens", tokens::create_router(state.clone()));

    Ok(Router::new()
        .nest("/api/v1", api)
        .merge(health::create_router(state))
        .route("/openapi.json", get(openapi_json))
        .layer(cors))
}
