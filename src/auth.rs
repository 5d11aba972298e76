//! Credential verification for the CLI gate.
//!
//! Secrets are stored as `sha256$<iterations>$<salt hex>$<digest hex>`; the
//! plaintext is never written anywhere. Attempts are rate limited per user
//! twice: in process by the verifier, and across runs by an
//! [`AttemptLedger`] kept in the store.

use crate::config::{AuthConfig, UserEntry};
use crate::error::{AuthError, StoreResult};
use chrono::{DateTime, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use tracing::{debug, warn};

/// Hash rounds used by [`hash_secret`].
pub const DEFAULT_ITERATIONS: u32 = 100_000;

const SCHEME: &str = "sha256";
const SALT_LEN: usize = 16;

/// Result of a login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Granted,
    Denied,
    /// Too many attempts for this user; the secret was not checked.
    RateLimited,
}

/// Checks a username and password.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> AuthOutcome;
}

/// Login attempt counts that outlive a single process.
pub trait AttemptLedger: Send + Sync {
    /// Count one attempt in the one-minute window starting at
    /// `window_start` (unix seconds) and return the window's total.
    /// Older windows may be discarded.
    fn record_attempt(
        &self,
        username: &str,
        window_start: i64,
    ) -> impl Future<Output = StoreResult<u32>> + Send;
}

/// Start of the one-minute window containing `now`, in unix seconds.
pub fn attempt_window(now: DateTime<Utc>) -> i64 {
    let secs = now.timestamp();
    secs - secs.rem_euclid(60)
}

/// Record the attempt, then verify unless the user is over the limit.
pub async fn check_login<V, L>(
    verifier: &V,
    ledger: &L,
    username: &str,
    password: &str,
    max_attempts_per_minute: u32,
    now: DateTime<Utc>,
) -> StoreResult<AuthOutcome>
where
    V: CredentialVerifier + ?Sized,
    L: AttemptLedger,
{
    let attempts = ledger
        .record_attempt(username, attempt_window(now))
        .await?;
    if attempts > max_attempts_per_minute {
        warn!(user = username, attempts, "Login rate limited");
        return Ok(AuthOutcome::RateLimited);
    }
    Ok(verifier.verify(username, password))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredSecret {
    iterations: u32,
    salt: Vec<u8>,
    digest: Vec<u8>,
}

impl StoredSecret {
    fn parse(encoded: &str) -> Option<Self> {
        let mut parts = encoded.trim().split('$');
        if parts.next()? != SCHEME {
            return None;
        }
        let iterations: u32 = parts.next()?.parse().ok().filter(|n| *n > 0)?;
        let salt = from_hex(parts.next()?)?;
        let digest = from_hex(parts.next()?)?;
        if parts.next().is_some() || digest.len() != 32 {
            return None;
        }
        Some(Self {
            iterations,
            salt,
            digest,
        })
    }

    fn matches(&self, password: &str) -> bool {
        let candidate = derive(password, &self.salt, self.iterations);
        constant_time_eq(&candidate, &self.digest)
    }
}

/// Users from configuration with hashed secrets.
pub struct HashedCredentials {
    users: HashMap<String, StoredSecret>,
    limiter: DefaultKeyedRateLimiter<String>,
}

impl HashedCredentials {
    pub fn new(users: &[UserEntry], max_attempts_per_minute: u32) -> Result<Self, AuthError> {
        let per_minute = NonZeroU32::new(max_attempts_per_minute).ok_or_else(|| {
            AuthError::Config("max_attempts_per_minute must be at least 1".to_string())
        })?;

        let mut parsed = HashMap::with_capacity(users.len());
        for user in users {
            let secret = StoredSecret::parse(&user.password_hash).ok_or_else(|| {
                AuthError::MalformedSecret {
                    username: user.username.clone(),
                }
            })?;
            parsed.insert(user.username.clone(), secret);
        }

        debug!("Loaded {} credential entries", parsed.len());

        Ok(Self {
            users: parsed,
            limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
        })
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        Self::new(&config.users, config.max_attempts_per_minute)
    }
}

impl CredentialVerifier for HashedCredentials {
    fn verify(&self, username: &str, password: &str) -> AuthOutcome {
        if self.limiter.check_key(&username.to_string()).is_err() {
            warn!(user = username, "Login rate limited");
            return AuthOutcome::RateLimited;
        }

        match self.users.get(username) {
            Some(secret) if secret.matches(password) => AuthOutcome::Granted,
            _ => {
                warn!(user = username, "Login failed");
                AuthOutcome::Denied
            }
        }
    }
}

/// Hash a password with a fresh random salt.
pub fn hash_secret(password: &str) -> String {
    hash_secret_with(password, DEFAULT_ITERATIONS)
}

/// Hash a password with an explicit round count.
pub fn hash_secret_with(password: &str, iterations: u32) -> String {
    let iterations = iterations.max(1);
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill(&mut salt[..]);

    let digest = derive(password, &salt, iterations);
    format!("{}${}${}${}", SCHEME, iterations, to_hex(&salt), to_hex(&digest))
}

fn derive(password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    let mut digest = hasher.finalize();

    for _ in 1..iterations {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(&digest);
        digest = hasher.finalize();
    }

    digest.to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.is_empty() || text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::{BucketStore, MemoryStore, SqliteStore};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn user(name: &str, password: &str) -> UserEntry {
        UserEntry {
            username: name.to_string(),
            password_hash: hash_secret_with(password, 1_000),
        }
    }

    #[test]
    fn test_hash_secret_format() {
        let encoded = hash_secret_with("correct horse", 1_000);
        let parts: Vec<&str> = encoded.split('$').collect();

        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "sha256");
        assert_eq!(parts[1], "1000");
        assert_eq!(parts[2].len(), SALT_LEN * 2);
        assert_eq!(parts[3].len(), 64);
        assert!(!encoded.contains("correct horse"));
    }

    #[test]
    fn test_hashes_are_salted() {
        let a = hash_secret_with("same", 10);
        let b = hash_secret_with("same", 10);
        assert_ne!(a, b);
        assert!(StoredSecret::parse(&a).unwrap().matches("same"));
        assert!(StoredSecret::parse(&b).unwrap().matches("same"));
    }

    #[test]
    fn test_verify() {
        let creds = HashedCredentials::new(&[user("analyst", "s3cret")], 10).unwrap();

        assert_eq!(creds.verify("analyst", "s3cret"), AuthOutcome::Granted);
        assert_eq!(creds.verify("analyst", "wrong"), AuthOutcome::Denied);
        assert_eq!(creds.verify("nobody", "s3cret"), AuthOutcome::Denied);
    }

    #[test]
    fn test_rate_limit_per_user() {
        let creds =
            HashedCredentials::new(&[user("analyst", "s3cret"), user("billing", "pw")], 2).unwrap();

        assert_eq!(creds.verify("analyst", "guess1"), AuthOutcome::Denied);
        assert_eq!(creds.verify("analyst", "guess2"), AuthOutcome::Denied);
        assert_eq!(creds.verify("analyst", "s3cret"), AuthOutcome::RateLimited);

        assert_eq!(creds.verify("billing", "pw"), AuthOutcome::Granted);
    }

    #[test]
    fn test_attempt_window() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 10, 15, 42).unwrap();
        let window = attempt_window(now);
        assert_eq!(window % 60, 0);
        assert_eq!(now.timestamp() - window, 42);
    }

    #[tokio::test]
    async fn test_check_login_limits_within_window() {
        let ledger = MemoryStore::new();
        let creds = HashedCredentials::new(&[user("analyst", "s3cret")], 100).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 10, 15, 0).unwrap();

        let first = check_login(&creds, &ledger, "analyst", "wrong", 2, now).await.unwrap();
        let second = check_login(&creds, &ledger, "analyst", "s3cret", 2, now).await.unwrap();
        let third = check_login(&creds, &ledger, "analyst", "s3cret", 2, now).await.unwrap();
        assert_eq!(first, AuthOutcome::Denied);
        assert_eq!(second, AuthOutcome::Granted);
        assert_eq!(third, AuthOutcome::RateLimited);

        let later = now + chrono::Duration::minutes(1);
        let next = check_login(&creds, &ledger, "analyst", "s3cret", 2, later).await.unwrap();
        assert_eq!(next, AuthOutcome::Granted);
    }

    #[tokio::test]
    async fn test_attempts_are_limited_across_runs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.db");
        let entries = [user("analyst", "s3cret")];
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 10, 15, 0).unwrap();

        // each run opens the store and builds its own verifier
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let store = SqliteStore::open(&path, &StoreConfig::default()).await.unwrap();
            store.init().await.unwrap();
            let creds = HashedCredentials::new(&entries, 2).unwrap();
            outcomes.push(
                check_login(&creds, &store, "analyst", "s3cret", 2, now)
                    .await
                    .unwrap(),
            );
            store.close().await;
        }

        assert_eq!(
            outcomes,
            vec![AuthOutcome::Granted, AuthOutcome::Granted, AuthOutcome::RateLimited]
        );
    }

    #[test]
    fn test_malformed_secret_is_rejected() {
        let entries = [UserEntry {
            username: "analyst".to_string(),
            password_hash: "plaintext".to_string(),
        }];
        let err = HashedCredentials::new(&entries, 5).err().unwrap();
        assert_eq!(
            err,
            AuthError::MalformedSecret {
                username: "analyst".to_string()
            }
        );

        assert!(StoredSecret::parse("sha256$0$00ff$abcd").is_none());
        assert!(StoredSecret::parse("md5$10$00ff$abcd").is_none());
    }

    #[test]
    fn test_zero_rate_is_config_error() {
        assert!(matches!(
            HashedCredentials::new(&[], 0),
            Err(AuthError::Config(_))
        ));
    }

    #[test]
    fn test_hex_round_trip() {
        assert_eq!(to_hex(&[0x00, 0xab, 0x10]), "00ab10");
        assert_eq!(from_hex("00ab10"), Some(vec![0x00, 0xab, 0x10]));
        assert_eq!(from_hex("abc"), None);
        assert_eq!(from_hex("zz"), None);
    }
}
