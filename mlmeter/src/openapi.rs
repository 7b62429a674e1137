//! OpenAPI document for the HTTP API, served at `/api-docs/openapi.json` and rendered by
//! Scalar at `/docs`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::api;

/// Bearer session tokens issued by `/login`.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "BearerAuth".to_string(),
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some(
                            "Session token from `POST /login`. Send it in the `Authorization` header:\n\n\
                            ```\nAuthorization: Bearer YOUR_TOKEN\n```",
                        ))
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "mlmeter",
        description = "Token-metered model training and prediction. Metered calls are charged when admitted, \
                       whether or not they then succeed; the `X-Tokens-Charged` header reports the charge."
    ),
    paths(
        api::handlers::auth::signup,
        api::handlers::auth::login,
        api::handlers::auth::remove_user,
        api::handlers::tokens::get_tokens,
        api::handlers::tokens::add_tokens,
        api::handlers::tokens::get_rate_limit,
        api::handlers::ml::train,
        api::handlers::ml::predict,
        api::handlers::ml::list_models,
        api::handlers::ml::model_metrics,
    ),
    components(schemas(
        api::models::users::UserCredentials,
        api::models::users::UserResponse,
        api::models::users::TokenResponse,
        api::models::users::MessageResponse,
        api::models::tokens::TokensResponse,
        api::models::tokens::AddTokensRequest,
        api::models::tokens::AddTokensResponse,
        api::models::tokens::RateLimitResponse,
        api::models::ml::TrainResponse,
        api::models::ml::PredictionResponse,
        api::models::ml::ModelInfo,
        api::models::ml::ModelsListResponse,
        api::models::ml::ModelMetricsResponse,
        crate::training::ModelType,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "accounts", description = "Signup, login and account removal"),
        (name = "tokens", description = "Token balance, purchases and rate limit state"),
        (name = "models", description = "Metered model training and prediction"),
    )
)]
pub struct ApiDoc;
