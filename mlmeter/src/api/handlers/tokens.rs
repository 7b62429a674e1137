use axum::{Json, extract::State};
use chrono::Utc;
use tracing::info;

use super::run_blocking;
use crate::{
    AppState,
    api::models::tokens::{AddTokensRequest, AddTokensResponse, RateLimitResponse, TokensResponse},
    auth::current_user::CurrentUser,
    errors::Result,
};

/// Get the caller's token balance
#[utoipa::path(
    get,
    path = "/tokens",
    tag = "tokens",
    responses(
        (status = 200, description = "Current balance", body = TokensResponse),
        (status = 401, description = "Missing or invalid session token"),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_tokens(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<TokensResponse>> {
    let tokens = state.accounts.ledger().balance(&current_user.username)?;
    Ok(Json(TokensResponse { tokens }))
}

/// Buy tokens with a (simulated) card payment
#[utoipa::path(
    post,
    path = "/add_tokens",
    request_body = AddTokensRequest,
    tag = "tokens",
    responses(
        (status = 200, description = "Tokens added", body = AddTokensResponse),
        (status = 400, description = "Malformed card number or non-positive amount"),
        (status = 401, description = "Missing or invalid session token"),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn add_tokens(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<AddTokensRequest>,
) -> Result<Json<AddTokensResponse>> {
    let (card, amount) = request.validate()?;
    let accounts = state.accounts.clone();
    let username = current_user.username.clone();
    let new_balance = run_blocking(move || accounts.purchase(&username, amount)).await?;

    info!(
        username = %current_user.username,
        amount,
        new_balance,
        card_last4 = &card[card.len() - 4..],
        "Tokens purchased"
    );
    Ok(Json(AddTokensResponse {
        message: "Tokens added successfully".to_string(),
        username: current_user.username,
        tokens_added: amount,
        new_balance,
    }))
}

/// Inspect the caller's rate limit window without consuming a slot
#[utoipa::path(
    get,
    path = "/rate_limit",
    tag = "tokens",
    responses(
        (status = 200, description = "Rate limit window state", body = RateLimitResponse),
        (status = 401, description = "Missing or invalid session token"),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn get_rate_limit(State(state): State<AppState>, current_user: CurrentUser) -> Json<RateLimitResponse> {
    let status = state.gate.limiter().inspect(&current_user.username, Utc::now());
    Json(status.into())
}
