//! Distributed lock contract used to serialize migrations over a stream,
//! with a no-op provider for unconfigured setups and an in-memory lease
//! provider for single-process use and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Errors returned by lock providers and handles.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The named lock could not be acquired within the given timeout.
    #[error("failed to acquire lock '{key}' within {timeout:?}")]
    AcquisitionTimeout {
        /// The contended lock key.
        key: String,
        /// How long acquisition was attempted.
        timeout: Duration,
    },

    /// The lease expired or was taken over while still in use.
    #[error("lock '{key}' was lost")]
    Lost {
        /// The lock key whose lease was lost.
        key: String,
    },

    /// Provider-specific failure.
    #[error("lock provider error: {0}")]
    Provider(#[from] anyhow::Error),
}

/// Options controlling lock acquisition and renewal for a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// How long to wait for the lock before failing the migration.
    pub lock_timeout: Duration,

    /// Lease duration handed out on acquisition and renewal.
    pub lease_duration: Duration,

    /// Interval of the background renewal loop; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            lease_duration: Duration::from_secs(60),
            heartbeat_interval: Some(Duration::from_secs(15)),
        }
    }
}

/// A held lease on a named lock.
#[async_trait]
pub trait LockHandle: Send + Sync {
    /// Unique id of this lease.
    fn lock_id(&self) -> Uuid;

    /// The key the lease was acquired for.
    fn lock_key(&self) -> &str;

    /// When the lease was acquired.
    fn acquired_at(&self) -> DateTime<Utc>;

    /// When the lease expires unless renewed.
    fn expires_at(&self) -> DateTime<Utc>;

    /// Whether the lease is still held.
    fn is_valid(&self) -> bool;

    /// Extends the lease; returns false when it could not be extended
    /// (expired or taken over).
    async fn renew(&self) -> Result<bool, LockError>;

    /// Releases the lease. Safe to call more than once.
    async fn release(&self) -> Result<(), LockError>;
}

/// Acquires named leases with renewable expiry.
#[async_trait]
pub trait DistributedLockProvider: Send + Sync {
    /// Attempts to acquire the named lock, waiting up to `timeout` on
    /// contention. Returns `None` when the lock stayed contended.
    async fn acquire(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Arc<dyn LockHandle>>, LockError>;

    /// Returns true when the named lock is currently held by anyone.
    async fn is_locked(&self, key: &str) -> Result<bool, LockError>;
}

/// Provider used when no real lock provider is configured: every acquire
/// succeeds with an everlasting lease and nothing is actually locked.
#[derive(Debug, Clone, Default)]
pub struct NoOpLockProvider;

struct NoOpHandle {
    lock_id: Uuid,
    lock_key: String,
    acquired_at: DateTime<Utc>,
}

#[async_trait]
impl LockHandle for NoOpHandle {
    fn lock_id(&self) -> Uuid {
        self.lock_id
    }

    fn lock_key(&self) -> &str {
        &self.lock_key
    }

    fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    fn expires_at(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn is_valid(&self) -> bool {
        true
    }

    async fn renew(&self) -> Result<bool, LockError> {
        Ok(true)
    }

    async fn release(&self) -> Result<(), LockError> {
        Ok(())
    }
}

#[async_trait]
impl DistributedLockProvider for NoOpLockProvider {
    async fn acquire(
        &self,
        key: &str,
        _timeout: Duration,
    ) -> Result<Option<Arc<dyn LockHandle>>, LockError> {
        Ok(Some(Arc::new(NoOpHandle {
            lock_id: Uuid::new_v4(),
            lock_key: key.to_owned(),
            acquired_at: Utc::now(),
        })))
    }

    async fn is_locked(&self, _key: &str) -> Result<bool, LockError> {
        Ok(false)
    }
}

#[derive(Debug, Clone)]
struct Lease {
    lock_id: Uuid,
    expires_at: DateTime<Utc>,
}

type LeaseMap = Arc<Mutex<HashMap<String, Lease>>>;

/// In-memory lease provider for single-process deployments and tests.
#[derive(Debug, Clone)]
pub struct InMemoryLockProvider {
    leases: LeaseMap,
    lease_duration: Duration,
}

impl InMemoryLockProvider {
    /// Creates a provider handing out leases of the given duration.
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            leases: Arc::default(),
            lease_duration,
        }
    }
}

impl Default for InMemoryLockProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

struct InMemoryHandle {
    lock_id: Uuid,
    lock_key: String,
    acquired_at: DateTime<Utc>,
    lease_duration: Duration,
    leases: LeaseMap,
    expires_at: std::sync::RwLock<DateTime<Utc>>,
    released: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl LockHandle for InMemoryHandle {
    fn lock_id(&self) -> Uuid {
        self.lock_id
    }

    fn lock_key(&self) -> &str {
        &self.lock_key
    }

    fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    fn expires_at(&self) -> DateTime<Utc> {
        *self
            .expires_at
            .read()
            .expect("acquire read lock on lease expiry")
    }

    fn is_valid(&self) -> bool {
        !self.released.load(std::sync::atomic::Ordering::SeqCst)
            && self.expires_at() > Utc::now()
    }

    async fn renew(&self) -> Result<bool, LockError> {
        if self.released.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(false);
        }

        let mut leases = self.leases.lock().await;
        match leases.get_mut(&self.lock_key) {
            Some(lease) if lease.lock_id == self.lock_id => {
                let expires_at = Utc::now()
                    + chrono::Duration::from_std(self.lease_duration)
                        .map_err(|e| LockError::Provider(anyhow::anyhow!(e)))?;
                lease.expires_at = expires_at;
                *self
                    .expires_at
                    .write()
                    .expect("acquire write lock on lease expiry") = expires_at;
                Ok(true)
            },
            // The lease expired and someone else took the key over.
            _ => Ok(false),
        }
    }

    async fn release(&self) -> Result<(), LockError> {
        if self
            .released
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return Ok(());
        }

        let mut leases = self.leases.lock().await;
        if let Some(lease) = leases.get(&self.lock_key) {
            if lease.lock_id == self.lock_id {
                leases.remove(&self.lock_key);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl DistributedLockProvider for InMemoryLockProvider {
    async fn acquire(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Arc<dyn LockHandle>>, LockError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let mut leases = self.leases.lock().await;
                let now = Utc::now();
                let free = match leases.get(key) {
                    None => true,
                    Some(lease) => lease.expires_at <= now,
                };

                if free {
                    let lock_id = Uuid::new_v4();
                    let expires_at = now
                        + chrono::Duration::from_std(self.lease_duration)
                            .map_err(|e| LockError::Provider(anyhow::anyhow!(e)))?;
                    leases.insert(
                        key.to_owned(),
                        Lease {
                            lock_id,
                            expires_at,
                        },
                    );

                    return Ok(Some(Arc::new(InMemoryHandle {
                        lock_id,
                        lock_key: key.to_owned(),
                        acquired_at: now,
                        lease_duration: self.lease_duration,
                        leases: Arc::clone(&self.leases),
                        expires_at: std::sync::RwLock::new(expires_at),
                        released: std::sync::atomic::AtomicBool::new(false),
                    })));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let leases = self.leases.lock().await;
        Ok(leases
            .get(key)
            .map(|lease| lease.expires_at > Utc::now())
            .unwrap_or(false))
    }
}
