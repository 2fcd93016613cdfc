//! Cross-process mutual exclusion through PostgreSQL advisory locks.
//!
//! A lock is identified by a name. The name is hashed to the 64-bit key
//! PostgreSQL advisory locks use, and the lock is held at session level on a
//! dedicated connection to the target database. Closing that connection
//! releases the lock even if the explicit unlock never runs.

use std::fmt;
use std::time::{Duration, Instant};

use postgres::error::SqlState;
use postgres::{Client, NoTls};
use sha2::{Digest, Sha256};

use crate::error::DbError;
use crate::pool;

/// The 64-bit advisory lock key derived from a lock name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvisoryLockKey(i64);

impl AdvisoryLockKey {
    /// First eight bytes of the name's SHA-256 digest, big-endian.
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(i64::from_be_bytes(bytes))
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for AdvisoryLockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named advisory lock against one database.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    name: String,
    key: AdvisoryLockKey,
    config: postgres::Config,
    timeout: Option<Duration>,
}

impl DistributedLock {
    pub fn new(name: impl Into<String>, config: &postgres::Config) -> Self {
        let name = name.into();
        Self {
            key: AdvisoryLockKey::from_name(&name),
            name,
            config: config.clone(),
            timeout: None,
        }
    }

    /// Bounds how long [`acquire`](Self::acquire) waits. `None` waits
    /// indefinitely; a zero duration tries exactly once.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> AdvisoryLockKey {
        self.key
    }

    /// Opens a dedicated connection and blocks until the lock is granted.
    /// Call it from a blocking context.
    ///
    /// # Errors
    ///
    /// Returns `DbError::LockTimeout` if the configured wait elapses and
    /// `DbError::Backend` if the connection or lock call fails.
    pub fn acquire(&self) -> Result<DistributedLockGuard, DbError> {
        let started = Instant::now();
        let mut client = self.config.connect(NoTls)?;
        let key = self.key.value();

        match self.timeout {
            None => {
                client.execute("SELECT pg_advisory_lock($1)", &[&key])?;
            }
            Some(timeout) if timeout.as_millis() == 0 => {
                let granted: bool = client
                    .query_one("SELECT pg_try_advisory_lock($1)", &[&key])?
                    .try_get(0)?;
                if !granted {
                    return Err(self.timed_out(started));
                }
            }
            Some(timeout) => {
                let millis = timeout.as_millis().min(i32::MAX as u128);
                client.batch_execute(&format!("SET lock_timeout = {millis}"))?;
                if let Err(e) = client.execute("SELECT pg_advisory_lock($1)", &[&key]) {
                    if e.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) {
                        return Err(self.timed_out(started));
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::debug!(
            lock = %self.name,
            key = %self.key,
            waited_ms = started.elapsed().as_millis() as u64,
            "acquired advisory lock"
        );
        Ok(DistributedLockGuard {
            client: Some(client),
            name: self.name.clone(),
            key: self.key,
        })
    }

    fn timed_out(&self, started: Instant) -> DbError {
        DbError::LockTimeout {
            name: self.name.clone(),
            waited: started.elapsed(),
        }
    }
}

/// A held advisory lock; unlocks when released or dropped.
pub struct DistributedLockGuard {
    client: Option<Client>,
    name: String,
    key: AdvisoryLockKey,
}

impl DistributedLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases the lock and closes its connection.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Backend` if the unlock call fails. The connection
    /// is closed either way, which also releases the lock.
    pub fn release(mut self) -> Result<(), DbError> {
        self.unlock()
    }

    fn unlock(&mut self) -> Result<(), DbError> {
        match self.client.take() {
            Some(client) => unlock(client, &self.name, self.key),
            None => Ok(()),
        }
    }
}

fn unlock(mut client: Client, name: &str, key: AdvisoryLockKey) -> Result<(), DbError> {
    let released: bool = client
        .query_one("SELECT pg_advisory_unlock($1)", &[&key.value()])?
        .try_get(0)?;
    if !released {
        tracing::warn!(lock = %name, "advisory lock was not held at release");
    }
    tracing::debug!(lock = %name, "released advisory lock");
    Ok(())
}

impl Drop for DistributedLockGuard {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        let key = self.key;
        pool::off_runtime(move || {
            if let Err(e) = unlock(client, &name, key) {
                tracing::warn!(
                    lock = %name,
                    error = %e,
                    "advisory unlock failed; closing the session releases it"
                );
            }
        });
    }
}

impl fmt::Debug for DistributedLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLockGuard")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("held", &self.client.is_some())
            .finish()
    }
}
