//! Registration Token REST API Routes
//!
//! Operator surface for minting, listing and revoking the single-use tokens
//! workers register with. Token material is returned once at creation and
//! never listed.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use foreman_core::{generate_secret, secret_digest, EntityIdType, RegistrationToken, TokenId};

use crate::error::{ApiError, ApiResult, ErrorEnvelope};
use crate::state::AppState;
use crate::types::{CreateTokenRequest, CreateTokenResponse, TokenView};

/// POST /api/v1/tokens - Mint a registration token
#[utoipa::path(
    post,
    path = "/api/v1/tokens",
    tag = "Tokens",
    request_body = CreateTokenRequest,
    responses(
        (status = 201, description = "Token minted; the plaintext is returned once", body = CreateTokenResponse),
        (status = 400, description = "Invalid expiry", body = ErrorEnvelope),
    )
)]
pub async fn create_token(
    State(state): State<AppState>,
    Json(req): Json<CreateTokenRequest>,
) -> ApiResult<impl IntoResponse> {
    let now = Utc::now();
    if req.expires_at.is_some_and(|exp| exp <= now) {
        return Err(ApiError::invalid_input("expires_at is in the past"));
    }

    let plaintext = generate_secret();
    let token = RegistrationToken {
        id: TokenId::now_v7(),
        token_digest: secret_digest(&plaintext),
        name: req.name,
        created_at: now,
        expires_at: req.expires_at,
        revoked: false,
        consumed_at: None,
    };
    state.store.insert_token(&token).await?;

    tracing::info!(token_id = %token.id, "Registration token minted");
    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            token_id: token.id,
            token: plaintext,
            expires_at: token.expires_at,
        }),
    ))
}

/// GET /api/v1/tokens - List token metadata
#[utoipa::path(
    get,
    path = "/api/v1/tokens",
    tag = "Tokens",
    responses((status = 200, description = "Token metadata", body = [TokenView]))
)]
pub async fn list_tokens(State(state): State<AppState>) -> ApiResult<Json<Vec<TokenView>>> {
    let tokens = state.store.list_tokens().await?;
    let views = tokens
        .into_iter()
        .map(|t| TokenView {
            id: t.id,
            name: t.name,
            created_at: t.created_at,
            expires_at: t.expires_at,
            revoked: t.revoked,
            consumed: t.consumed_at.is_some(),
        })
        .collect();
    Ok(Json(views))
}

/// POST /api/v1/tokens/{id}/revoke - Revoke a token
#[utoipa::path(
    post,
    path = "/api/v1/tokens/{id}/revoke",
    tag = "Tokens",
    params(("id" = TokenId, Path, description = "Token ID")),
    responses(
        (status = 204, description = "Token revoked"),
        (status = 404, description = "Token not found", body = ErrorEnvelope),
    )
)]
pub async fn revoke_token(
    State(state): State<AppState>,
    Path(id): Path<TokenId>,
) -> ApiResult<StatusCode> {
    if !state.store.revoke_token(id).await? {
        return Err(ApiError::not_found("registration token", id));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Create the token routes router.
pub fn create_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/", axum::routing::post(create_token))
        .route("/", axum::routing::get(list_tokens))
        .route("/:id/revoke", axum::routing::post(revoke_token))
        .with_state(state)
}
