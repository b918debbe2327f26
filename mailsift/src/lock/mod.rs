//! Durable per-tenant mutual exclusion.
//!
//! Backed by the `task_locks` table so it holds across processes sharing the
//! same database. A holder that stops refreshing for longer than the expiry
//! is considered crashed and can be taken over.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};
use crate::database::models::{LockDbModel, TenantId};
use crate::database::repositories::LockRepository;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;

/// What kind of run holds the lock.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// Manually triggered run (API).
    Stream,
    /// Background auto-sync run.
    Auto,
}

impl LockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Age after which a lock row is considered abandoned.
    pub expiry: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(300),
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(1),
        }
    }
}

/// Lock handle for one process. All locks taken through it share `owner_token`.
pub struct DistributedLock {
    repo: Arc<dyn LockRepository>,
    owner_token: String,
    config: LockConfig,
}

impl DistributedLock {
    pub fn new(repo: Arc<dyn LockRepository>, config: LockConfig) -> Self {
        Self::with_owner(repo, config, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_owner(
        repo: Arc<dyn LockRepository>,
        config: LockConfig,
        owner_token: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            owner_token: owner_token.into(),
            config,
        }
    }

    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn expiry_ms(&self) -> i64 {
        i64::try_from(self.config.expiry.as_millis()).unwrap_or(i64::MAX)
    }

    /// Try to take the lock, retrying with backoff until `timeout`.
    ///
    /// Returns `Ok(false)` when the lock stayed held by a live owner.
    pub async fn acquire(&self, tenant: TenantId, kind: LockKind, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut delay = self.config.retry_base_delay;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.try_acquire_once(tenant, kind).await? {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(tenant, kind = %kind, attempts, "lock acquisition timed out");
                return Ok(false);
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.config.retry_max_delay);
        }
    }

    async fn try_acquire_once(&self, tenant: TenantId, kind: LockKind) -> Result<bool> {
        let now = now_ms();
        let row = LockDbModel {
            tenant_id: tenant,
            kind: kind.as_str().to_string(),
            owner_token: self.owner_token.clone(),
            acquired_at: now,
        };

        if retry_on_sqlite_busy("lock_insert", || self.repo.try_insert(&row)).await? {
            info!(tenant, kind = %kind, "lock acquired");
            return Ok(true);
        }

        let Some(existing) = self.repo.get_lock(tenant).await? else {
            // Released between our insert and read; the next attempt inserts.
            return Ok(false);
        };

        if existing.owner_token == self.owner_token && existing.kind == row.kind {
            self.repo
                .refresh(tenant, &row.kind, &self.owner_token, now)
                .await?;
            debug!(tenant, kind = %kind, "lock re-entered");
            return Ok(true);
        }

        let age_ms = now - existing.acquired_at;
        if age_ms > self.expiry_ms() {
            if self.repo.take_over(&existing, &row).await? {
                warn!(
                    tenant,
                    kind = %kind,
                    previous_owner = %existing.owner_token,
                    previous_kind = %existing.kind,
                    age_secs = age_ms / 1000,
                    "took over expired lock"
                );
                return Ok(true);
            }
            debug!(tenant, "lock takeover lost to another contender");
        }

        Ok(false)
    }

    /// Delete the lock if this process holds it with `kind`.
    pub async fn release(&self, tenant: TenantId, kind: LockKind) -> Result<bool> {
        let released = retry_on_sqlite_busy("lock_release", || {
            self.repo.delete_owned(tenant, kind.as_str(), &self.owner_token)
        })
        .await?;
        if released {
            info!(tenant, kind = %kind, "lock released");
        } else {
            debug!(tenant, kind = %kind, "release skipped, lock not owned");
        }
        Ok(released)
    }

    /// Unconditionally clear the tenant's lock row.
    pub async fn force_release_all(&self, tenant: TenantId) -> Result<u64> {
        let removed =
            retry_on_sqlite_busy("lock_force_release", || self.repo.delete_all(tenant)).await?;
        if removed > 0 {
            warn!(tenant, "lock force-released");
        }
        Ok(removed)
    }

    /// Bump the lock timestamp if still owned.
    pub async fn refresh(&self, tenant: TenantId, kind: LockKind) -> Result<bool> {
        retry_on_sqlite_busy("lock_refresh", || {
            self.repo
                .refresh(tenant, kind.as_str(), &self.owner_token, now_ms())
        })
        .await
    }

    /// Current lock row, if any.
    pub async fn holder(&self, tenant: TenantId) -> Result<Option<LockDbModel>> {
        self.repo.get_lock(tenant).await
    }

    /// Lease on a lock this process just acquired, handed to the run driver.
    pub fn lease(self: &Arc<Self>, tenant: TenantId, kind: LockKind) -> LockLease {
        LockLease {
            lock: self.clone(),
            tenant,
            kind,
            lost: CancellationToken::new(),
        }
    }
}

/// A lock held by one run.
///
/// Another process may pre-empt or take over the row while the run is active.
/// Once that is noticed the lease is marked lost and stays lost; the driver
/// must not write anything after that.
#[derive(Clone)]
pub struct LockLease {
    lock: Arc<DistributedLock>,
    tenant: TenantId,
    kind: LockKind,
    lost: CancellationToken,
}

impl LockLease {
    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Resolves once the lease is known to be lost.
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }

    fn mark_lost(&self) {
        if !self.lost.is_cancelled() {
            warn!(tenant = self.tenant, kind = %self.kind, "lock no longer owned");
            self.lost.cancel();
        }
    }

    /// Refresh the row, failing with [`Error::LockLost`] if it is no longer ours.
    pub async fn ensure_held(&self) -> Result<()> {
        if !self.is_lost() && self.lock.refresh(self.tenant, self.kind).await? {
            return Ok(());
        }
        self.mark_lost();
        Err(Error::LockLost {
            tenant: self.tenant,
        })
    }

    /// Refresh the lock every `expiry / 3` until `stop` fires or the lease
    /// is lost.
    pub fn spawn_heartbeat(&self, stop: CancellationToken) -> JoinHandle<()> {
        let lease = self.clone();
        let period = (lease.lock.config.expiry / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = lease.lost.cancelled() => break,
                    _ = ticker.tick() => {
                        match lease.lock.refresh(lease.tenant, lease.kind).await {
                            Ok(true) => debug!(tenant = lease.tenant, "lock heartbeat"),
                            Ok(false) => {
                                lease.mark_lost();
                                break;
                            }
                            Err(e) => warn!(tenant = lease.tenant, error = %e, "lock heartbeat failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::database::repositories::SqlxLockRepository;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<dyn LockRepository>) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("t.db").display());
        let db = Database::open(&url).await.unwrap();
        (dir, Arc::new(SqlxLockRepository::new(db.pool.clone())))
    }

    fn fast() -> LockConfig {
        LockConfig {
            expiry: Duration::from_secs(300),
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_second_owner_is_excluded_until_release() {
        let (_dir, repo) = setup().await;
        let a = DistributedLock::with_owner(repo.clone(), fast(), "a");
        let b = DistributedLock::with_owner(repo.clone(), fast(), "b");

        assert!(a.acquire(1, LockKind::Stream, Duration::ZERO).await.unwrap());
        assert!(!b.acquire(1, LockKind::Stream, Duration::from_millis(50)).await.unwrap());

        // b cannot release a's lock.
        assert!(!b.release(1, LockKind::Stream).await.unwrap());
        assert!(a.release(1, LockKind::Stream).await.unwrap());
        assert!(b.acquire(1, LockKind::Stream, Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_reentrant_for_same_owner_and_kind() {
        let (_dir, repo) = setup().await;
        let a = DistributedLock::with_owner(repo.clone(), fast(), "a");

        assert!(a.acquire(1, LockKind::Auto, Duration::ZERO).await.unwrap());
        assert!(a.acquire(1, LockKind::Auto, Duration::ZERO).await.unwrap());
        // Same owner, other kind is not re-entrant.
        assert!(!a.acquire(1, LockKind::Stream, Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (_dir, repo) = setup().await;
        let stale = LockDbModel {
            tenant_id: 1,
            kind: "auto".to_string(),
            owner_token: "dead-process".to_string(),
            acquired_at: now_ms() - 6 * 60 * 1000,
        };
        assert!(repo.try_insert(&stale).await.unwrap());

        let lock = DistributedLock::with_owner(repo.clone(), fast(), "live");
        assert!(lock.acquire(1, LockKind::Stream, Duration::ZERO).await.unwrap());

        let holder = lock.holder(1).await.unwrap().unwrap();
        assert_eq!(holder.owner_token, "live");
        assert_eq!(holder.kind, "stream");
    }

    #[tokio::test]
    async fn test_force_release_all_clears_foreign_lock() {
        let (_dir, repo) = setup().await;
        let a = DistributedLock::with_owner(repo.clone(), fast(), "a");
        let b = DistributedLock::with_owner(repo.clone(), fast(), "b");

        assert!(a.acquire(1, LockKind::Auto, Duration::ZERO).await.unwrap());
        assert_eq!(b.force_release_all(1).await.unwrap(), 1);
        assert!(b.acquire(1, LockKind::Stream, Duration::ZERO).await.unwrap());
        assert!(!a.refresh(1, LockKind::Auto).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_is_lost_after_pre_emption() {
        let (_dir, repo) = setup().await;
        let a = Arc::new(DistributedLock::with_owner(repo.clone(), fast(), "a"));
        let b = DistributedLock::with_owner(repo.clone(), fast(), "b");

        assert!(a.acquire(1, LockKind::Auto, Duration::ZERO).await.unwrap());
        let lease = a.lease(1, LockKind::Auto);
        lease.ensure_held().await.unwrap();

        b.force_release_all(1).await.unwrap();
        assert!(b.acquire(1, LockKind::Stream, Duration::ZERO).await.unwrap());

        let err = lease.ensure_held().await.unwrap_err();
        assert!(matches!(err, Error::LockLost { tenant: 1 }));
        assert!(lease.is_lost());
        // b's row is untouched.
        assert_eq!(a.holder(1).await.unwrap().unwrap().owner_token, "b");
    }

    #[tokio::test]
    async fn test_heartbeat_marks_lease_lost() {
        let (_dir, repo) = setup().await;
        let config = LockConfig {
            expiry: Duration::from_millis(90),
            ..fast()
        };
        let a = Arc::new(DistributedLock::with_owner(repo.clone(), config, "a"));
        assert!(a.acquire(1, LockKind::Auto, Duration::ZERO).await.unwrap());
        let lease = a.lease(1, LockKind::Auto);
        let heartbeat = lease.spawn_heartbeat(CancellationToken::new());

        a.force_release_all(1).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), lease.lost())
            .await
            .expect("heartbeat did not notice the lost lock");
        heartbeat.await.unwrap();
    }
}
