//! # mlmeter: token-metered model training and prediction
//!
//! `mlmeter` is an HTTP service where accounts buy tokens and spend them on machine learning
//! work: training regression and classification models on uploaded CSV files, listing and
//! inspecting the stored models, and running predictions.
//!
//! ## Architecture
//!
//! The service is built on [Axum](https://github.com/tokio-rs/axum). All state lives in the
//! process: balances in a sharded [`ledger::Ledger`], per-account request windows in a
//! [`limits::RateLimiter`], credentials in [`accounts::Accounts`] and fitted models in a
//! file-backed [`training::registry::ModelRegistry`].
//!
//! ### Request Flow
//!
//! Authenticated requests carry a session token from `POST /login`, which the
//! [`auth::current_user::CurrentUser`] extractor verifies. Metered handlers then go through the
//! [`admission::AdmissionGate`]:
//!
//! 1. rate-limited operations (prediction, by default) must fit in the caller's window
//! 2. the operation's price is deducted from the caller's balance
//! 3. the work runs, on the blocking pool when it is CPU bound
//!
//! Tokens are spent once step 2 succeeds. A failure in step 3 still costs the caller, and the
//! response says so in an `X-Tokens-Charged` header.
//!
//! ### Persistence
//!
//! Trained models are written to `<data_dir>/models` as they are stored and reloaded at startup.
//! Accounts and balances are snapshotted to `<data_dir>/accounts.json` after every signup,
//! purchase and removal, once more on graceful shutdown, and restored on the next start.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use mlmeter::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = mlmeter::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     mlmeter::telemetry::init_telemetry(config.log_format)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod accounts;
pub mod admission;
pub mod api;
pub mod auth;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod limits;
mod metrics;
mod openapi;
pub mod telemetry;
pub mod training;
pub mod types;

#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, header},
    routing::{delete, get, post},
};
use bon::Builder;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::{
    accounts::Accounts,
    admission::{AdmissionGate, TOKENS_REMAINING_HEADER},
    errors::{RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER, RATE_LIMIT_RESET_HEADER, TOKENS_CHARGED_HEADER},
    limits::RateLimiter,
    openapi::ApiDoc,
    training::{TrainingService, registry::ModelRegistry},
};
pub use config::Config;

/// Application state shared across all request handlers.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .gate(gate)
///     .accounts(accounts)
///     .training(training)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub gate: AdmissionGate,
    pub accounts: Arc<Accounts>,
    pub training: Arc<TrainingService>,
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let cors = if config.cors.allows_any_origin() {
        CorsLayer::new().allow_origin(Any)
    } else {
        let mut origins = Vec::new();
        for origin in &config.cors.allowed_origins {
            origins.push(
                origin
                    .parse::<HeaderValue>()
                    .with_context(|| format!("invalid CORS origin '{origin}'"))?,
            );
        }
        CorsLayer::new().allow_origin(origins)
    };

    let mut cors = cors
        .allow_methods(Any)
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .expose_headers([
            TOKENS_CHARGED_HEADER,
            TOKENS_REMAINING_HEADER,
            RATE_LIMIT_LIMIT_HEADER,
            RATE_LIMIT_REMAINING_HEADER,
            RATE_LIMIT_RESET_HEADER,
            header::RETRY_AFTER,
        ]);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "mlmeter: token-metered model training and prediction",
        "version": env!("CARGO_PKG_VERSION"),
        "docs": "/docs",
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

/// Build the application router with all endpoints and middleware.
///
/// Includes the account, token and model routes, the OpenAPI document and its Scalar UI, the
/// Prometheus endpoint when metrics are enabled, CORS and request tracing.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    use api::handlers::{auth, ml, tokens};

    let upload_limit = state.config.training.max_upload_bytes;

    let mut router = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/signup", post(auth::signup))
        .route("/login", post(auth::login))
        .route("/remove_user", delete(auth::remove_user))
        .route("/tokens", get(tokens::get_tokens))
        .route("/add_tokens", post(tokens::add_tokens))
        .route("/rate_limit", get(tokens::get_rate_limit))
        .route("/train", post(ml::train).layer(DefaultBodyLimit::max(upload_limit)))
        .route("/predict/{model_name}", post(ml::predict))
        .route("/models", get(ml::list_models))
        .route("/models/{model_name}/metrics", get(ml::model_metrics))
        .with_state(state.clone())
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    if state.config.enable_metrics {
        let handle = crate::metrics::get_or_install_prometheus_handle();
        router = router.route("/internal/metrics", get(move || async move { handle.render() }));
    }

    let router = router.layer(create_cors_layer(&state.config)?).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Main application struct that owns the router and the shared state.
///
/// 1. **Create**: [`Application::new`] restores accounts, opens the model registry and builds
///    the router
/// 2. **Serve**: [`Application::serve`] binds to the configured address and handles requests
/// 3. **Shutdown**: once the shutdown future resolves, in-flight requests drain and the
///    accounts are snapshotted to disk one last time (every signup, purchase and removal
///    already rewrote the snapshot)
pub struct Application {
    router: Router,
    app_state: AppState,
    config: Config,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting mlmeter with configuration: {:#?}", config);

        let accounts = Arc::new(Accounts::open(&config)?);

        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let gate = AdmissionGate::new(accounts.ledger().clone(), limiter);

        let registry = ModelRegistry::open(config.models_dir()).context("failed to open the model registry")?;
        let training = Arc::new(TrainingService::new(registry));

        info!(
            accounts = accounts.len(),
            models = training.registry().len(),
            "Restored application state"
        );

        let app_state = AppState::builder()
            .config(config.clone())
            .gate(gate)
            .accounts(accounts)
            .training(training)
            .build();
        let router = build_router(&app_state)?;

        Ok(Self {
            router,
            app_state,
            config,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server")
    }

    /// Write the account snapshot to `<data_dir>/accounts.json`.
    pub fn save_accounts(&self) -> anyhow::Result<()> {
        let path = self.config.accounts_path();
        let saved = self.app_state.accounts.save(&path)?;
        info!(accounts = saved, path = %path.display(), "Saved account snapshot");
        Ok(())
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "mlmeter listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.clone().into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.save_accounts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_app, create_test_config, signup, signup_and_login};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_banner_and_health() {
        let (server, _dir) = create_test_app(|_| {}).await;

        let response = server.get("/health").await;
        response.assert_status(StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body, json!({"status": "healthy"}));

        let response = server.get("/").await;
        response.assert_status(StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["docs"], "/docs");
    }

    #[tokio::test]
    async fn test_openapi_document_is_served() {
        let (server, _dir) = create_test_app(|_| {}).await;

        let response = server.get("/api-docs/openapi.json").await;
        response.assert_status(StatusCode::OK);
        let body: Value = response.json();
        assert!(body["paths"]["/train"].is_object());

        server.get("/docs").await.assert_status(StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_only_when_enabled() {
        let (server, _dir) = create_test_app(|_| {}).await;
        server.get("/internal/metrics").await.assert_status(StatusCode::NOT_FOUND);

        let (server, _dir) = create_test_app(|config| config.enable_metrics = true).await;
        let token = signup_and_login(&server, "alice").await;
        crate::test_utils::fund(&server, &token, 5).await;

        let response = server.get("/internal/metrics").await;
        response.assert_status(StatusCode::OK);
        assert!(response.text().contains("mlmeter_tokens_credited_total"));
    }

    #[test_log::test(tokio::test)]
    async fn test_accounts_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = create_test_config(dir.path());

        let app = Application::new(config.clone()).await.unwrap();
        app.app_state.accounts.signup("alice", "secret").unwrap();
        app.app_state.accounts.purchase("alice", 7).unwrap();
        app.save_accounts().unwrap();
        drop(app);

        let restarted = Application::new(config).await.unwrap();
        assert_eq!(restarted.app_state.accounts.ledger().balance("alice").unwrap(), 7);

        // The restored account can log in and is not taken twice
        let server = restarted.into_test_server();
        crate::test_utils::login(&server, "alice", "secret").await;
        let response = server
            .post("/signup")
            .json(&json!({"username": "alice", "password": "secret"}))
            .await;
        response.assert_status(StatusCode::CONFLICT);
        signup(&server, "bob", "secret").await;
    }

    #[test_log::test(tokio::test)]
    async fn test_accounts_survive_restart_without_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = create_test_config(dir.path());

        let server = Application::new(config.clone()).await.unwrap().into_test_server();
        let token = signup_and_login(&server, "alice").await;
        crate::test_utils::fund(&server, &token, 12).await;
        signup(&server, "bob", "secret").await;
        server
            .delete("/remove_user")
            .json(&json!({"username": "bob", "password": "secret"}))
            .await
            .assert_status(StatusCode::OK);
        // Dropped without serving, so nothing saves on shutdown
        drop(server);

        let restarted = Application::new(config).await.unwrap();
        assert_eq!(restarted.app_state.accounts.ledger().balance("alice").unwrap(), 12);
        assert!(!restarted.app_state.accounts.contains("bob"));

        // Sessions issued before the restart stay valid
        let server = restarted.into_test_server();
        let response = server.get("/tokens").add_header("authorization", format!("Bearer {token}")).await;
        response.assert_status(StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["tokens"], 12);
    }

    #[test]
    fn test_cors_origins() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = create_test_config(dir.path());
        assert!(create_cors_layer(&config).is_ok());

        config.cors.allowed_origins = vec!["https://app.example.com".to_string()];
        assert!(create_cors_layer(&config).is_ok());

        config.cors.allowed_origins = vec!["bad\norigin".to_string()];
        assert!(create_cors_layer(&config).is_err());
    }
}
