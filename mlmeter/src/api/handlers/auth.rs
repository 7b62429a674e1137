use axum::{Json, extract::State, http::StatusCode};
use tracing::info;

use super::run_blocking;
use crate::{
    AppState,
    api::models::users::{MessageResponse, TokenResponse, UserCredentials, UserResponse},
    auth::session,
    errors::Result,
};

/// Register a new account
#[utoipa::path(
    post,
    path = "/signup",
    request_body = UserCredentials,
    tag = "accounts",
    responses(
        (status = 201, description = "Account created", body = UserResponse),
        (status = 400, description = "Username or password length out of bounds"),
        (status = 409, description = "Username already taken"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn signup(State(state): State<AppState>, Json(request): Json<UserCredentials>) -> Result<(StatusCode, Json<UserResponse>)> {
    let accounts = state.accounts.clone();
    let username = request.username.clone();
    let tokens = run_blocking(move || accounts.signup(&request.username, &request.password)).await?;

    info!(username = %username, tokens, "New user registered");
    Ok((StatusCode::CREATED, Json(UserResponse { username, tokens })))
}

/// Exchange a username and password for a session token
#[utoipa::path(
    post,
    path = "/login",
    request_body = UserCredentials,
    tag = "accounts",
    responses(
        (status = 200, description = "Logged in", body = TokenResponse),
        (status = 401, description = "Invalid username or password"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn login(State(state): State<AppState>, Json(request): Json<UserCredentials>) -> Result<Json<TokenResponse>> {
    let accounts = state.accounts.clone();
    let username = request.username.clone();
    let account_id = run_blocking(move || accounts.authenticate(&request.username, &request.password)).await?;

    let token = session::create_session_token(&username, account_id, &state.config)?;
    info!(username = %username, "User logged in");
    Ok(Json(TokenResponse::bearer(token)))
}

/// Delete an account after checking its credentials
///
/// Any remaining tokens are forfeited. Its sessions and rate limit window end with it.
#[utoipa::path(
    delete,
    path = "/remove_user",
    request_body = UserCredentials,
    tag = "accounts",
    responses(
        (status = 200, description = "Account deleted", body = MessageResponse),
        (status = 401, description = "Invalid username or password"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn remove_user(State(state): State<AppState>, Json(request): Json<UserCredentials>) -> Result<Json<MessageResponse>> {
    let accounts = state.accounts.clone();
    let username = request.username.clone();
    let forfeited = run_blocking(move || accounts.remove(&request.username, &request.password)).await?;
    state.gate.limiter().forget(&username);

    info!(username = %username, forfeited, "User account deleted");
    Ok(Json(MessageResponse {
        message: format!("User '{username}' deleted successfully"),
    }))
}
