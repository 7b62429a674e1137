use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use tracing::{instrument, trace};

use crate::{
    AppState,
    auth::session,
    errors::{Error, Result},
    types::Identity,
};

/// The account a request is authenticated as.
///
/// Extracted from an `Authorization: Bearer <jwt>` header. The token must verify and the
/// account it was issued for must still hold its username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub username: Identity,
}

fn bearer_token(parts: &Parts) -> Result<&str> {
    let value = parts
        .headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| Error::Unauthenticated {
            message: Some("Not authenticated".to_string()),
        })?
        .to_str()
        .map_err(|_| Error::Unauthenticated {
            message: Some("Invalid authorization header".to_string()),
        })?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(Error::Unauthenticated {
            message: Some("Invalid authentication credentials".to_string()),
        }),
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = bearer_token(parts)?;
        let claims = session::verify_session_token(token, &state.config)?;
        let username = claims.sub;

        match state.accounts.account_id(&username) {
            Some(account_id) if account_id == claims.aid => {}
            Some(_) => {
                trace!(username = %username, "Token was issued to a removed account of the same name");
                return Err(Error::Unauthenticated {
                    message: Some("Session is no longer valid".to_string()),
                });
            }
            None => {
                trace!(username = %username, "Token names a removed account");
                return Err(Error::Unauthenticated {
                    message: Some("User not found".to_string()),
                });
            }
        }

        trace!(username = %username, "Authenticated request");
        Ok(CurrentUser { username })
    }
}
