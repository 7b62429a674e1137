//! Token accounting.
//!
//! The [`Ledger`] owns one non-negative balance per identity. Every mutation runs while holding
//! the write lock of the `DashMap` shard that owns the identity, so the read-check-write of a
//! deduction is indivisible and a balance can never be observed below zero. The lock is released
//! as soon as the mutation returns; nothing here awaits.

use std::collections::BTreeMap;

use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error as ThisError;
use tracing::{debug, instrument, trace};

use crate::types::Identity;

/// Errors raised by ledger operations. All of them are business outcomes, not transient faults.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The balance does not cover the requested amount; nothing was deducted
    #[error("Insufficient tokens. Required: {required}, Available: {available}")]
    InsufficientFunds { required: u64, available: u64 },

    /// No account is open for this identity
    #[error("Account '{identity}' not found")]
    NotFound { identity: Identity },

    /// An account is already open for this identity
    #[error("Account '{identity}' already exists")]
    AlreadyExists { identity: Identity },

    /// Deductions and credits must move at least one token
    #[error("Token amount must be greater than zero")]
    InvalidAmount,

    /// The credit would push the balance past `u64::MAX`
    #[error("Crediting {amount} tokens would overflow the balance of '{identity}'")]
    Overflow { identity: Identity, amount: u64 },
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// In-process token ledger keyed by identity.
#[derive(Debug, Default)]
pub struct Ledger {
    balances: DashMap<Identity, u64>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from a previously taken [`snapshot`](Ledger::snapshot).
    pub fn restore(entries: impl IntoIterator<Item = (Identity, u64)>) -> Self {
        Self {
            balances: entries.into_iter().collect(),
        }
    }

    /// Open an account with a zero balance.
    #[instrument(skip(self))]
    pub fn open(&self, identity: &str) -> Result<()> {
        match self.balances.entry(identity.to_string()) {
            Entry::Occupied(_) => Err(LedgerError::AlreadyExists {
                identity: identity.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(0);
                debug!("Opened account");
                Ok(())
            }
        }
    }

    /// Close an account, returning the balance it held.
    #[instrument(skip(self))]
    pub fn close(&self, identity: &str) -> Result<u64> {
        let (_, balance) = self.balances.remove(identity).ok_or_else(|| not_found(identity))?;
        debug!(balance, "Closed account");
        Ok(balance)
    }

    pub fn balance(&self, identity: &str) -> Result<u64> {
        self.balances.get(identity).map(|b| *b).ok_or_else(|| not_found(identity))
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.balances.contains_key(identity)
    }

    /// Atomically take `amount` tokens from the account and return the new balance.
    ///
    /// Fails with [`LedgerError::InsufficientFunds`] without touching the balance when it does not
    /// cover `amount`.
    #[instrument(skip(self))]
    pub fn deduct(&self, identity: &str, amount: u64) -> Result<u64> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        // get_mut holds the shard write lock until `balance` is dropped
        let mut balance = self.balances.get_mut(identity).ok_or_else(|| not_found(identity))?;
        if *balance < amount {
            trace!(available = *balance, "Deduction rejected");
            return Err(LedgerError::InsufficientFunds {
                required: amount,
                available: *balance,
            });
        }

        *balance -= amount;
        debug!(new_balance = *balance, "Tokens deducted");
        Ok(*balance)
    }

    /// Add `amount` tokens to the account and return the new balance.
    #[instrument(skip(self))]
    pub fn credit(&self, identity: &str, amount: u64) -> Result<u64> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }

        let mut balance = self.balances.get_mut(identity).ok_or_else(|| not_found(identity))?;
        *balance = balance.checked_add(amount).ok_or_else(|| LedgerError::Overflow {
            identity: identity.to_string(),
            amount,
        })?;
        debug!(new_balance = *balance, "Tokens credited");
        Ok(*balance)
    }

    /// Point-in-time copy of every balance, ordered by identity.
    ///
    /// Each entry is read under its shard lock, but the copy as a whole is not a single atomic
    /// cut across identities.
    pub fn snapshot(&self) -> BTreeMap<Identity, u64> {
        self.balances.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }
}

fn not_found(identity: &str) -> LedgerError {
    LedgerError::NotFound {
        identity: identity.to_string(),
    }
}
