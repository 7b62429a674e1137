//! Admission control for metered operations.
//!
//! [`AdmissionGate`] composes the [`Ledger`] and the [`RateLimiter`] in front of an operation:
//!
//! 1. rate-limited operations must pass [`RateLimiter::check_and_record`]
//! 2. the operation's cost is deducted from the caller's balance
//! 3. the operation runs
//!
//! A rejection in step 1 charges nothing. A rejection in step 2 does not give back the rate
//! limit slot taken in step 1. Once step 2 succeeds the tokens are spent: a failure in step 3
//! is returned as [`Error::Charged`] so the caller can tell it was billed.
//!
//! The gate holds no lock of its own. Two concurrent calls for one identity may both pass the
//! rate check and then race on the balance, which the ledger resolves.

use std::{future::Future, sync::Arc};

use axum::{
    http::HeaderValue,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::errors::{
    Error, RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER, RATE_LIMIT_RESET_HEADER, Result, TOKENS_CHARGED_HEADER,
};
use crate::ledger::{Ledger, LedgerError};
use crate::limits::{RateLimitStatus, RateLimiter};
use crate::metrics;
use crate::types::Operation;

/// Header carrying the caller's balance after an admitted operation.
pub const TOKENS_REMAINING_HEADER: axum::http::HeaderName = axum::http::HeaderName::from_static("x-tokens-remaining");

/// What an operation costs and whether it is rate limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationPolicy {
    pub operation: Operation,
    pub cost: u64,
    pub rate_limited: bool,
}

/// The result of an admitted operation, with its billing receipt.
#[derive(Debug, Clone)]
pub struct Metered<T> {
    pub value: T,
    /// Tokens deducted for this call
    pub charged: u64,
    /// Balance right after the deduction
    pub balance: u64,
    /// Window state after this call was recorded, for rate-limited operations
    pub rate_limit: Option<RateLimitStatus>,
}

impl<T> Metered<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Metered<U> {
        Metered {
            value: f(self.value),
            charged: self.charged,
            balance: self.balance,
            rate_limit: self.rate_limit,
        }
    }
}

impl<T: IntoResponse> IntoResponse for Metered<T> {
    fn into_response(self) -> Response {
        let mut response = self.value.into_response();
        let headers = response.headers_mut();
        headers.insert(TOKENS_CHARGED_HEADER, HeaderValue::from(self.charged));
        headers.insert(TOKENS_REMAINING_HEADER, HeaderValue::from(self.balance));

        if let Some(status) = self.rate_limit {
            headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(status.limit));
            headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(status.remaining));
            if let Some(reset_at) = status.reset_at {
                headers.insert(RATE_LIMIT_RESET_HEADER, HeaderValue::from(reset_at.timestamp()));
            }
        }

        response
    }
}

/// Rate limiter and ledger checks in front of metered operations.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    ledger: Arc<Ledger>,
    limiter: Arc<RateLimiter>,
}

impl AdmissionGate {
    pub fn new(ledger: Arc<Ledger>, limiter: Arc<RateLimiter>) -> Self {
        Self { ledger, limiter }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Admit, charge and run `body` for `identity`.
    pub async fn perform<T, F, Fut>(&self, identity: &str, policy: &OperationPolicy, body: F) -> Result<Metered<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.perform_at(identity, policy, Utc::now(), body).await
    }

    /// [`perform`](Self::perform) with an explicit clock reading for the rate limiter.
    #[instrument(skip(self, policy, now, body), fields(operation = %policy.operation, cost = policy.cost))]
    pub async fn perform_at<T, F, Fut>(
        &self,
        identity: &str,
        policy: &OperationPolicy,
        now: DateTime<Utc>,
        body: F,
    ) -> Result<Metered<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let rate_limit = if policy.rate_limited {
            match self.limiter.check_and_record(identity, now) {
                Ok(status) => Some(status),
                Err(e) => {
                    metrics::record_admission_rejection(policy.operation, "rate_limited");
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let balance = match self.ledger.deduct(identity, policy.cost) {
            Ok(balance) => balance,
            Err(e) => {
                if matches!(e, LedgerError::InsufficientFunds { .. }) {
                    metrics::record_admission_rejection(policy.operation, "insufficient_funds");
                }
                return Err(e.into());
            }
        };
        metrics::record_tokens_deducted(policy.operation, policy.cost);
        debug!(balance, "Operation admitted");

        match body().await {
            Ok(value) => Ok(Metered {
                value,
                charged: policy.cost,
                balance,
                rate_limit,
            }),
            Err(source) => {
                // No refund: the attempt itself is what the caller paid for
                debug!(charged = policy.cost, "Operation failed after admission: {}", source);
                Err(Error::Charged {
                    charged: policy.cost,
                    source: Box::new(source),
                })
            }
        }
    }
}
