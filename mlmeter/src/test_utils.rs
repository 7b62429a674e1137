//! Helpers for HTTP-level tests.

use std::path::Path;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::{Application, config::Config};

/// A valid configuration rooted at `data_dir`, with cheap password hashing.
pub fn create_test_config(data_dir: &Path) -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        secret_key: Some("test-secret-key-for-testing-only".to_string()),
        data_dir: data_dir.to_path_buf(),
        ..Default::default()
    };
    config.auth.password.argon2_memory_kib = 1024;
    config.auth.password.argon2_iterations = 1;
    config
}

/// Start an application on a fresh data directory. The directory lives as long as the
/// returned guard.
pub async fn create_test_app(configure: impl FnOnce(&mut Config)) -> (TestServer, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut config = create_test_config(dir.path());
    configure(&mut config);
    config.validate().expect("Test configuration should be valid");

    let app = Application::new(config).await.expect("Failed to create application");
    (app.into_test_server(), dir)
}

pub async fn signup(server: &TestServer, username: &str, password: &str) {
    server
        .post("/signup")
        .json(&json!({"username": username, "password": password}))
        .await
        .assert_status(StatusCode::CREATED);
}

/// Log in and return the session token.
pub async fn login(server: &TestServer, username: &str, password: &str) -> String {
    let response = server
        .post("/login")
        .json(&json!({"username": username, "password": password}))
        .await;
    response.assert_status(StatusCode::OK);
    let body: Value = response.json();
    body["access_token"].as_str().expect("access_token").to_string()
}

pub async fn signup_and_login(server: &TestServer, username: &str) -> String {
    signup(server, username, "password").await;
    login(server, username, "password").await
}

/// Buy `amount` tokens for the session's account.
pub async fn fund(server: &TestServer, token: &str, amount: u64) {
    server
        .post("/add_tokens")
        .add_header("authorization", format!("Bearer {token}"))
        .json(&json!({"credit_card": "4242-4242-4242-4242", "amount": amount}))
        .await
        .assert_status(StatusCode::OK);
}
