//! HTTP request handlers.
//!
//! - [`auth`]: signup, login and account removal
//! - [`tokens`]: balance, purchases and rate limit state (free)
//! - [`ml`]: training, prediction and model listing (metered)
//!
//! Metered handlers run their work through the [`AdmissionGate`](crate::admission::AdmissionGate)
//! with the policy configured for the operation, and return a
//! [`Metered`](crate::admission::Metered) response carrying the billing headers.

pub mod auth;
pub mod ml;
pub mod tokens;

use crate::errors::{Error, Result};

/// Run CPU-bound work (password hashing, model fitting) on the blocking pool.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| Error::Internal {
        operation: format!("join blocking task: {e}"),
    })?
}
