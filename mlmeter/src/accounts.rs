//! User accounts: credentials plus the token ledger they own.
//!
//! Credentials live in memory next to the [`Ledger`]. A username is taken once its ledger
//! account is opened, so concurrent signups for the same name resolve to exactly one winner.
//! The whole set can be written to and restored from a JSON snapshot, which is how accounts
//! survive a restart. Accounts created with [`Accounts::open`] rewrite that snapshot after every
//! signup, purchase and removal.
//!
//! Every account carries a random id that session tokens are bound to, so a token issued before
//! a removal never authenticates a later account that reuses the username.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Context;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::{
    auth::password::{self, Argon2Params},
    config::Config,
    errors::{Error, Result},
    ledger::Ledger,
    metrics,
    types::Identity,
};

/// One account as written to the snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub username: Identity,
    /// Snapshots without ids get fresh ones, which logs out tokens issued before the upgrade
    #[serde(default = "new_account_id")]
    pub account_id: u64,
    pub password_hash: String,
    pub tokens: u64,
}

fn new_account_id() -> u64 {
    rand::random()
}

#[derive(Debug, Clone)]
struct Credential {
    account_id: u64,
    password_hash: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotFile {
    accounts: Vec<AccountRecord>,
}

#[derive(Debug, Clone)]
struct AccountRules {
    username_length: (usize, usize),
    password_length: (usize, usize),
    argon2: Argon2Params,
    initial_tokens: u64,
}

impl AccountRules {
    fn from_config(config: &Config) -> Self {
        Self {
            username_length: (config.auth.username.min_length, config.auth.username.max_length),
            password_length: (config.auth.password.min_length, config.auth.password.max_length),
            argon2: Argon2Params::from(&config.auth.password),
            initial_tokens: config.credits.initial_tokens,
        }
    }
}

#[derive(Debug)]
pub struct Accounts {
    credentials: DashMap<Identity, Credential>,
    ledger: Arc<Ledger>,
    rules: AccountRules,
    snapshot_path: Option<PathBuf>,
    // Serializes snapshot writes so the file never goes back to an older state
    save_lock: Mutex<()>,
}

fn check_length(field: &str, value: &str, (min, max): (usize, usize)) -> Result<()> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(Error::BadRequest {
            message: format!("{field} must be between {min} and {max} characters"),
        });
    }
    Ok(())
}

fn invalid_credentials() -> Error {
    Error::Unauthenticated {
        message: Some("Invalid username or password".to_string()),
    }
}

impl Accounts {
    /// In-memory accounts that are never written to disk.
    pub fn new(config: &Config) -> Self {
        Self::restore(Vec::new(), config)
    }

    /// Rebuild accounts and their balances from snapshot records.
    pub fn restore(records: Vec<AccountRecord>, config: &Config) -> Self {
        let ledger = Ledger::restore(records.iter().map(|r| (r.username.clone(), r.tokens)));
        let credentials = records
            .into_iter()
            .map(|r| {
                let credential = Credential {
                    account_id: r.account_id,
                    password_hash: r.password_hash,
                };
                (r.username, credential)
            })
            .collect();

        Self {
            credentials,
            ledger: Arc::new(ledger),
            rules: AccountRules::from_config(config),
            snapshot_path: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Restore accounts from the snapshot at `config.accounts_path()` and keep it up to date.
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        let path = config.accounts_path();
        let mut accounts = Self::restore(Self::load(&path)?, config);
        accounts.snapshot_path = Some(path);
        Ok(accounts)
    }

    /// The ledger holding every account's balance.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn contains(&self, username: &str) -> bool {
        self.credentials.contains_key(username)
    }

    /// The id of the account currently holding `username`.
    pub fn account_id(&self, username: &str) -> Option<u64> {
        self.credentials.get(username).map(|entry| entry.account_id)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Register a new account and return its starting balance.
    ///
    /// Hashes the password, so call it off the async executor.
    #[instrument(skip(self, password))]
    pub fn signup(&self, username: &str, password: &str) -> Result<u64> {
        check_length("Username", username, self.rules.username_length)?;
        check_length("Password", password, self.rules.password_length)?;

        let password_hash = password::hash_password(password, self.rules.argon2)?;
        self.ledger.open(username)?;
        let credential = Credential {
            account_id: new_account_id(),
            password_hash,
        };
        self.credentials.insert(username.to_string(), credential);

        let balance = if self.rules.initial_tokens > 0 {
            let balance = self.ledger.credit(username, self.rules.initial_tokens)?;
            metrics::record_tokens_credited(self.rules.initial_tokens);
            balance
        } else {
            0
        };

        info!(balance, "Account created");
        self.persist();
        Ok(balance)
    }

    /// Check a username and password pair and return the account id.
    ///
    /// Unknown users and wrong passwords fail the same way.
    #[instrument(skip(self, password))]
    pub fn authenticate(&self, username: &str, password: &str) -> Result<u64> {
        let credential = self
            .credentials
            .get(username)
            .map(|entry| entry.value().clone())
            .ok_or_else(invalid_credentials)?;

        if !password::verify_password(password, &credential.password_hash)? {
            debug!("Password mismatch");
            return Err(invalid_credentials());
        }
        Ok(credential.account_id)
    }

    /// Verify the credentials, then delete the account. Returns the balance that was forfeited.
    #[instrument(skip(self, password))]
    pub fn remove(&self, username: &str, password: &str) -> Result<u64> {
        let account_id = self.authenticate(username, password)?;

        // Only the account that was verified; a removal and re-signup may have raced in between
        if self
            .credentials
            .remove_if(username, |_, credential| credential.account_id == account_id)
            .is_none()
        {
            return Err(invalid_credentials());
        }
        let forfeited = self.ledger.close(username)?;

        info!(forfeited, "Account removed");
        self.persist();
        Ok(forfeited)
    }

    /// Credit purchased tokens and return the new balance.
    ///
    /// Rewrites the snapshot, so call it off the async executor.
    #[instrument(skip(self))]
    pub fn purchase(&self, username: &str, amount: u64) -> Result<u64> {
        let balance = self.ledger.credit(username, amount)?;
        metrics::record_tokens_credited(amount);
        self.persist();
        Ok(balance)
    }

    /// Every account with its current balance, ordered by username.
    pub fn snapshot(&self) -> Vec<AccountRecord> {
        let mut records: Vec<AccountRecord> = self
            .credentials
            .iter()
            .filter_map(|entry| {
                // Skip accounts removed mid-iteration
                let tokens = self.ledger.balance(entry.key()).ok()?;
                Some(AccountRecord {
                    username: entry.key().clone(),
                    account_id: entry.account_id,
                    password_hash: entry.password_hash.clone(),
                    tokens,
                })
            })
            .collect();
        records.sort_by(|a, b| a.username.cmp(&b.username));
        records
    }

    /// Write the snapshot to `path`, replacing the previous one. Returns the number of accounts.
    pub fn save(&self, path: &Path) -> anyhow::Result<usize> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

        // Taken before the snapshot so that the last writer also holds the newest state
        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let file = SnapshotFile {
            accounts: self.snapshot(),
        };

        let mut tmp = NamedTempFile::new_in(dir).with_context(|| format!("failed to create a file in {}", dir.display()))?;
        tmp.write_all(&serde_json::to_vec_pretty(&file)?)
            .and_then(|()| tmp.as_file().sync_all())
            .with_context(|| format!("failed to write {}", tmp.path().display()))?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to replace {}", path.display()))?;

        Ok(file.accounts.len())
    }

    /// Rewrite the snapshot after a mutation. The mutation already happened, so a failed
    /// write is logged and retried by the next one.
    fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        match self.save(path) {
            Ok(saved) => debug!(accounts = saved, "Account snapshot written"),
            Err(error) => warn!(path = %path.display(), error = format!("{error:#}"), "Failed to write account snapshot"),
        }
    }

    /// Read a snapshot written by [`save`](Accounts::save). A missing file is an empty snapshot.
    pub fn load(path: &Path) -> anyhow::Result<Vec<AccountRecord>> {
        if !path.exists() {
            warn!(path = %path.display(), "No account snapshot found, starting empty");
            return Ok(Vec::new());
        }

        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let file: SnapshotFile =
            serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(file.accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerError;
    use serde_json::json;

    fn test_config(initial_tokens: u64) -> Config {
        let mut config = Config::default();
        config.credits.initial_tokens = initial_tokens;
        config.auth.password.argon2_memory_kib = 1024;
        config.auth.password.argon2_iterations = 1;
        config
    }

    #[test]
    fn test_signup_opens_ledger_account() {
        let accounts = Accounts::new(&test_config(0));

        assert_eq!(accounts.signup("alice", "secret").unwrap(), 0);
        assert!(accounts.contains("alice"));
        assert_eq!(accounts.ledger().balance("alice").unwrap(), 0);
    }

    #[test]
    fn test_signup_grants_initial_tokens() {
        let accounts = Accounts::new(&test_config(25));
        assert_eq!(accounts.signup("alice", "secret").unwrap(), 25);
        assert_eq!(accounts.ledger().balance("alice").unwrap(), 25);
    }

    #[test]
    fn test_signup_duplicate_and_length_rules() {
        let accounts = Accounts::new(&test_config(0));
        accounts.signup("alice", "secret").unwrap();

        let err = accounts.signup("alice", "other").unwrap_err();
        assert!(matches!(err, Error::Ledger(LedgerError::AlreadyExists { .. })));

        assert!(matches!(accounts.signup("al", "secret"), Err(Error::BadRequest { .. })));
        assert!(matches!(accounts.signup(&"a".repeat(51), "secret"), Err(Error::BadRequest { .. })));
        assert!(matches!(accounts.signup("bob", "abc"), Err(Error::BadRequest { .. })));
        assert!(!accounts.contains("bob"));
    }

    #[test]
    fn test_authenticate() {
        let accounts = Accounts::new(&test_config(0));
        accounts.signup("alice", "secret").unwrap();

        assert!(accounts.authenticate("alice", "secret").is_ok());
        assert!(matches!(accounts.authenticate("alice", "wrong"), Err(Error::Unauthenticated { .. })));
        assert!(matches!(accounts.authenticate("nobody", "secret"), Err(Error::Unauthenticated { .. })));
    }

    #[test]
    fn test_remove_closes_ledger_account() {
        let accounts = Accounts::new(&test_config(0));
        accounts.signup("alice", "secret").unwrap();
        accounts.purchase("alice", 12).unwrap();

        assert!(accounts.remove("alice", "wrong").is_err());
        assert!(accounts.contains("alice"));

        assert_eq!(accounts.remove("alice", "secret").unwrap(), 12);
        assert!(!accounts.contains("alice"));
        assert!(matches!(accounts.ledger().balance("alice"), Err(LedgerError::NotFound { .. })));

        // The name can be reused afterwards
        assert_eq!(accounts.signup("alice", "secret").unwrap(), 0);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("accounts.json");
        let config = test_config(0);

        let accounts = Accounts::new(&config);
        accounts.signup("bob", "password").unwrap();
        accounts.signup("alice", "secret").unwrap();
        accounts.purchase("alice", 40).unwrap();
        accounts.ledger().deduct("alice", 5).unwrap();

        assert_eq!(accounts.save(&path).unwrap(), 2);

        let restored = Accounts::restore(Accounts::load(&path).unwrap(), &config);
        assert_eq!(restored.snapshot(), accounts.snapshot());
        assert_eq!(restored.ledger().balance("alice").unwrap(), 35);
        assert!(restored.authenticate("alice", "secret").is_ok());
    }

    #[test]
    fn test_reused_username_gets_a_new_account_id() {
        let accounts = Accounts::new(&test_config(0));
        accounts.signup("alice", "secret").unwrap();
        let first = accounts.authenticate("alice", "secret").unwrap();
        assert_eq!(accounts.account_id("alice"), Some(first));

        accounts.remove("alice", "secret").unwrap();
        assert_eq!(accounts.account_id("alice"), None);

        accounts.signup("alice", "secret").unwrap();
        let second = accounts.authenticate("alice", "secret").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_open_writes_snapshot_after_each_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(0);
        config.data_dir = dir.path().join("data");
        let path = config.accounts_path();

        let accounts = Accounts::open(&config).unwrap();
        assert!(!path.exists());

        accounts.signup("alice", "secret").unwrap();
        accounts.signup("bob", "password").unwrap();
        assert_eq!(Accounts::load(&path).unwrap().len(), 2);

        accounts.purchase("alice", 30).unwrap();
        let records = Accounts::load(&path).unwrap();
        assert_eq!(records[0].username, "alice");
        assert_eq!(records[0].tokens, 30);

        accounts.remove("bob", "password").unwrap();
        assert_eq!(Accounts::load(&path).unwrap(), accounts.snapshot());

        // Nothing was saved explicitly
        let reopened = Accounts::open(&config).unwrap();
        assert_eq!(reopened.ledger().balance("alice").unwrap(), 30);
        assert!(!reopened.contains("bob"));
        assert_eq!(reopened.account_id("alice"), accounts.account_id("alice"));
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_concurrent_purchases_leave_newest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(0);
        config.data_dir = dir.path().to_path_buf();

        let accounts = Accounts::open(&config).unwrap();
        accounts.signup("alice", "secret").unwrap();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        accounts.purchase("alice", 1).unwrap();
                    }
                });
            }
        });

        let records = Accounts::load(&config.accounts_path()).unwrap();
        assert_eq!(records[0].tokens, 80);
    }

    #[test]
    fn test_snapshot_without_account_ids_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let hash = password::hash_password("secret", Argon2Params::from(&test_config(0).auth.password)).unwrap();
        let legacy = json!({"accounts": [{"username": "alice", "password_hash": hash, "tokens": 3}]});
        fs::write(&path, serde_json::to_vec(&legacy).unwrap()).unwrap();

        let restored = Accounts::restore(Accounts::load(&path).unwrap(), &test_config(0));
        assert_eq!(restored.ledger().balance("alice").unwrap(), 3);
        let id = restored.authenticate("alice", "secret").unwrap();
        assert_eq!(restored.account_id("alice"), Some(id));
    }

    #[test]
    fn test_load_missing_and_corrupt_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        assert!(Accounts::load(&path).unwrap().is_empty());

        fs::write(&path, b"[not json").unwrap();
        assert!(Accounts::load(&path).is_err());
    }
}
