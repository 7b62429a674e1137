//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `config.yaml` and can be changed with the `-f` flag or the `MLMETER_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `MLMETER_` override YAML values
//!
//! Nested values use double underscores, e.g. `MLMETER_RATE_LIMIT__MAX_REQUESTS=50` sets
//! `rate_limit.max_requests`.
//!
//! ## Configuration Structure
//!
//! - **Server**: `host`, `port`, `data_dir`
//! - **Security**: `secret_key`, `auth.jwt_expiry`, `cors.allowed_origins`
//! - **Metering**: `credits.initial_tokens`, `pricing`, `rate_limit`
//! - **Training**: `training.default_test_size`, `training.max_upload_bytes`
//! - **Observability**: `enable_metrics`, `log_format`
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! MLMETER_PORT=8080
//! MLMETER_SECRET_KEY="change-me"
//! MLMETER_PRICING__PREDICT=10
//! MLMETER_AUTH__JWT_EXPIRY=2h
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::admission::OperationPolicy;
use crate::errors::Error;
use crate::types::Operation;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "MLMETER_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults, so an empty file (or no file at all) plus `MLMETER_SECRET_KEY` is
/// a working configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Secret key used to sign session tokens (required)
    pub secret_key: Option<String>,
    /// Directory holding the account snapshot and the trained models
    pub data_dir: PathBuf,
    /// Enable Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
    /// Log output format
    pub log_format: LogFormat,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Token allocation for new accounts
    pub credits: CreditsConfig,
    /// Token cost of each metered operation
    pub pricing: PricingConfig,
    /// Sliding-window rate limit applied to rate-limited operations
    pub rate_limit: RateLimitConfig,
    /// Model training settings
    pub training: TrainingConfig,
    /// CORS configuration for browser clients
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per event
    Json,
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Lifetime of issued session tokens
    #[serde(with = "humantime_serde")]
    pub jwt_expiry: Duration,
    pub username: UsernameConfig,
    pub password: PasswordConfig,
}

/// Username validation rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UsernameConfig {
    pub min_length: usize,
    pub max_length: usize,
}

/// Password validation and hashing rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PasswordConfig {
    /// Minimum password length
    pub min_length: usize,
    /// Maximum password length
    pub max_length: usize,
    /// Argon2 memory cost in KiB (default: 19456 KiB = 19 MB)
    pub argon2_memory_kib: u32,
    /// Argon2 iterations
    pub argon2_iterations: u32,
    /// Argon2 parallelism
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
/// Token allocation configuration.
pub struct CreditsConfig {
    /// Tokens granted to an account when it is opened (default: 0)
    pub initial_tokens: u64,
}

/// Per-operation token costs.
///
/// ```yaml
/// pricing:
///   list_models: 1
///   model_metrics: 1
///   train: 1
///   predict: 5
///   rate_limited: [predict]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PricingConfig {
    pub list_models: u64,
    pub model_metrics: u64,
    pub train: u64,
    pub predict: u64,
    /// Operations that must pass the rate limiter before they are charged
    pub rate_limited: Vec<Operation>,
}

impl PricingConfig {
    pub fn cost(&self, operation: Operation) -> u64 {
        match operation {
            Operation::ListModels => self.list_models,
            Operation::ModelMetrics => self.model_metrics,
            Operation::Train => self.train,
            Operation::Predict => self.predict,
        }
    }

    /// The admission policy for `operation`.
    pub fn policy(&self, operation: Operation) -> OperationPolicy {
        OperationPolicy {
            operation,
            cost: self.cost(operation),
            rate_limited: self.rate_limited.contains(&operation),
        }
    }
}

/// Sliding-window rate limit configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Requests admitted per identity within one window
    pub max_requests: u32,
    /// Window length in seconds
    pub window_seconds: u64,
}

/// Model training configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    /// Fraction of rows held out for evaluation when the request does not specify one
    pub default_test_size: f64,
    /// Largest accepted training upload, in bytes
    pub max_upload_bytes: usize,
}

/// CORS (Cross-Origin Resource Sharing) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests; `*` allows any origin
    pub allowed_origins: Vec<String>,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
}

impl CorsConfig {
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|origin| origin == "*")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            secret_key: None,
            data_dir: PathBuf::from("data"),
            enable_metrics: false,
            log_format: LogFormat::Text,
            auth: AuthConfig::default(),
            credits: CreditsConfig::default(),
            pricing: PricingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            training: TrainingConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_expiry: Duration::from_secs(30 * 60), // 30 minutes
            username: UsernameConfig::default(),
            password: PasswordConfig::default(),
        }
    }
}

impl Default for UsernameConfig {
    fn default() -> Self {
        Self {
            min_length: 3,
            max_length: 50,
        }
    }
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            min_length: 4,
            max_length: 128,
            argon2_memory_kib: 19456,
            argon2_iterations: 2,
            argon2_parallelism: 1,
        }
    }
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self { initial_tokens: 0 }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            list_models: 1,
            model_metrics: 1,
            train: 1,
            predict: 5,
            rate_limited: vec![Operation::Predict],
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            window_seconds: 60,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            default_test_size: 0.2,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            max_age: Some(3600),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // MLMETER_CONFIG names the file itself, it is not a config key
            .merge(Env::prefixed("MLMETER_").ignore(&["config"]).split("__"))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.secret_key.as_deref().is_none_or(str::is_empty) {
            return Err(Error::Internal {
                operation: "Config validation: secret_key is not configured. \
                     Please set MLMETER_SECRET_KEY environment variable or add secret_key to config file."
                    .to_string(),
            });
        }

        let password = &self.auth.password;
        if password.min_length > password.max_length {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: Invalid password configuration: min_length ({}) cannot be greater than max_length ({})",
                    password.min_length, password.max_length
                ),
            });
        }

        let username = &self.auth.username;
        if username.min_length < 1 || username.min_length > username.max_length {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: Invalid username configuration: expected 1 <= min_length ({}) <= max_length ({})",
                    username.min_length, username.max_length
                ),
            });
        }

        if self.auth.jwt_expiry.as_secs() < 300 {
            return Err(Error::Internal {
                operation: "Config validation: JWT expiry duration is too short (minimum 5 minutes)".to_string(),
            });
        }

        if self.auth.jwt_expiry.as_secs() > 86400 * 30 {
            return Err(Error::Internal {
                operation: "Config validation: JWT expiry duration is too long (maximum 30 days)".to_string(),
            });
        }

        for operation in [Operation::ListModels, Operation::ModelMetrics, Operation::Train, Operation::Predict] {
            if self.pricing.cost(operation) == 0 {
                return Err(Error::Internal {
                    operation: format!("Config validation: pricing.{operation} must be a positive token cost"),
                });
            }
        }

        if self.rate_limit.max_requests == 0 || self.rate_limit.window_seconds == 0 {
            return Err(Error::Internal {
                operation: "Config validation: rate_limit.max_requests and rate_limit.window_seconds must both be positive".to_string(),
            });
        }

        let test_size = self.training.default_test_size;
        if !(test_size > 0.0 && test_size < 1.0) {
            return Err(Error::Internal {
                operation: format!("Config validation: training.default_test_size ({test_size}) must lie strictly between 0 and 1"),
            });
        }

        if self.cors.allowed_origins.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: CORS allowed_origins cannot be empty. Add at least one allowed origin.".to_string(),
            });
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn accounts_path(&self) -> PathBuf {
        self.data_dir.join("accounts.json")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args() -> Args {
        Args {
            config: "test.yaml".to_string(),
            validate: false,
        }
    }

    #[test]
    fn test_defaults_from_minimal_file() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "secret_key: hello\n")?;

            let config = Config::load(&args())?;

            assert_eq!(config.bind_address(), "0.0.0.0:8000");
            assert_eq!(config.rate_limit.max_requests, 20);
            assert_eq!(config.rate_limit.window_seconds, 60);
            assert_eq!(config.auth.jwt_expiry, Duration::from_secs(1800));
            assert_eq!(config.credits.initial_tokens, 0);
            assert_eq!(config.log_format, LogFormat::Text);

            let predict = config.pricing.policy(Operation::Predict);
            assert_eq!(predict.cost, 5);
            assert!(predict.rate_limited);

            let train = config.pricing.policy(Operation::Train);
            assert_eq!(train.cost, 1);
            assert!(!train.rate_limited);

            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
secret_key: hello
port: 9000
rate_limit:
  max_requests: 3
"#,
            )?;

            jail.set_env("MLMETER_PORT", "8080");
            jail.set_env("MLMETER_RATE_LIMIT__WINDOW_SECONDS", "10");
            jail.set_env("MLMETER_PRICING__PREDICT", "7");
            jail.set_env("MLMETER_AUTH__JWT_EXPIRY", "2h");
            jail.set_env("MLMETER_CONFIG", "test.yaml");

            let config = Config::load(&args())?;

            assert_eq!(config.port, 8080);
            assert_eq!(config.rate_limit.max_requests, 3);
            assert_eq!(config.rate_limit.window_seconds, 10);
            assert_eq!(config.pricing.predict, 7);
            assert_eq!(config.auth.jwt_expiry, Duration::from_secs(7200));

            Ok(())
        });
    }

    #[test]
    fn test_full_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
host: 127.0.0.1
port: 3000
secret_key: hello
data_dir: /var/lib/mlmeter
enable_metrics: true
log_format: json
auth:
  jwt_expiry: 1h
  username:
    min_length: 5
    max_length: 20
  password:
    min_length: 8
credits:
  initial_tokens: 25
pricing:
  train: 3
  rate_limited: [predict, train]
training:
  default_test_size: 0.3
cors:
  allowed_origins:
    - https://app.example.com
"#,
            )?;

            let config = Config::load(&args())?;

            assert_eq!(config.data_dir, PathBuf::from("/var/lib/mlmeter"));
            assert_eq!(config.accounts_path(), PathBuf::from("/var/lib/mlmeter/accounts.json"));
            assert_eq!(config.models_dir(), PathBuf::from("/var/lib/mlmeter/models"));
            assert!(config.enable_metrics);
            assert_eq!(config.log_format, LogFormat::Json);
            assert_eq!(config.auth.username.min_length, 5);
            assert_eq!(config.auth.password.min_length, 8);
            assert_eq!(config.auth.password.max_length, 128);
            assert_eq!(config.credits.initial_tokens, 25);
            assert_eq!(config.pricing.policy(Operation::Train).cost, 3);
            assert!(config.pricing.policy(Operation::Train).rate_limited);
            assert_eq!(config.pricing.predict, 5);
            assert_eq!(config.training.default_test_size, 0.3);
            assert!(!config.cors.allows_any_origin());

            Ok(())
        });
    }

    #[test]
    fn test_unknown_field_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "secret_key: hello\nrate_limits: {}\n")?;
            assert!(Config::load(&args()).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_missing_secret_key_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "port: 8000\n")?;

            let err = Config::load(&args()).unwrap_err();
            assert!(err.to_string().contains("secret_key"));
            Ok(())
        });
    }

    #[test]
    fn test_validation_rules() {
        let valid = Config {
            secret_key: Some("hello".to_string()),
            ..Default::default()
        };
        assert!(valid.validate().is_ok());

        let mut config = valid.clone();
        config.pricing.predict = 0;
        assert!(config.validate().is_err());

        let mut config = valid.clone();
        config.rate_limit.max_requests = 0;
        assert!(config.validate().is_err());

        let mut config = valid.clone();
        config.rate_limit.window_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = valid.clone();
        config.auth.password.min_length = 200;
        assert!(config.validate().is_err());

        let mut config = valid.clone();
        config.auth.jwt_expiry = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = valid.clone();
        config.auth.jwt_expiry = Duration::from_secs(86400 * 31);
        assert!(config.validate().is_err());

        for test_size in [0.0, 1.0, -0.5, f64::NAN] {
            let mut config = valid.clone();
            config.training.default_test_size = test_size;
            assert!(config.validate().is_err(), "test_size {test_size} should be rejected");
        }

        let mut config = valid.clone();
        config.cors.allowed_origins.clear();
        assert!(config.validate().is_err());
    }
}
