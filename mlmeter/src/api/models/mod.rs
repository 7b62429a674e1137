//! API request and response data models.
//!
//! These structures define the public HTTP contract and are annotated with `utoipa` for the
//! generated OpenAPI document. They are kept apart from the service types so either side can
//! change without breaking the other.
//!
//! - [`users`]: signup, login and account removal payloads
//! - [`tokens`]: balance, purchase and rate limit payloads
//! - [`ml`]: training, prediction and model listing payloads

pub mod ml;
pub mod tokens;
pub mod users;
