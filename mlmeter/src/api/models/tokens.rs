//! API request/response models for token balances and purchases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::Error;
use crate::limits::RateLimitStatus;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokensResponse {
    pub tokens: u64,
}

/// Simulated token purchase
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AddTokensRequest {
    /// Card number in the form `XXXX-XXXX-XXXX-XXXX`; spaces are ignored
    #[schema(example = "4242-4242-4242-4242")]
    pub credit_card: String,
    /// Number of tokens to buy, must be positive
    pub amount: i64,
}

impl AddTokensRequest {
    /// Check the request shape, returning the normalized card number and the amount.
    ///
    /// Only the format of the card number is checked; nothing is charged to it.
    pub fn validate(&self) -> Result<(String, u64), Error> {
        let card: String = self.credit_card.chars().filter(|c| *c != ' ').collect();
        if !is_card_shaped(&card) {
            return Err(Error::BadRequest {
                message: "Credit card must be in format: XXXX-XXXX-XXXX-XXXX".to_string(),
            });
        }

        let amount = u64::try_from(self.amount)
            .ok()
            .filter(|a| *a > 0)
            .ok_or_else(|| Error::BadRequest {
                message: "Amount must be a positive number of tokens".to_string(),
            })?;

        Ok((card, amount))
    }
}

/// Four groups of four ASCII digits separated by dashes
fn is_card_shaped(card: &str) -> bool {
    let groups: Vec<&str> = card.split('-').collect();
    groups.len() == 4 && groups.iter().all(|g| g.len() == 4 && g.bytes().all(|b| b.is_ascii_digit()))
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AddTokensResponse {
    pub message: String,
    pub username: String,
    pub tokens_added: u64,
    pub new_balance: u64,
}

/// Current state of the caller's rate limit window
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateLimitResponse {
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    pub window_seconds: u64,
    /// When the oldest request in the window expires, if any are recorded
    pub reset_at: Option<DateTime<Utc>>,
}

impl From<RateLimitStatus> for RateLimitResponse {
    fn from(status: RateLimitStatus) -> Self {
        Self {
            limit: status.limit,
            used: status.used,
            remaining: status.remaining,
            window_seconds: status.window_seconds,
            reset_at: status.reset_at,
        }
    }
}
