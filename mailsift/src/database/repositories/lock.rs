//! Task lock repository.
//!
//! Raw row operations only. Ownership rules (re-entrancy, expiry takeover,
//! backoff) live in [`crate::lock::DistributedLock`].

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{LockDbModel, TenantId};
use crate::database::retry::is_unique_violation;

/// Lock repository trait.
#[async_trait]
pub trait LockRepository: Send + Sync {
    /// Insert a lock row. Returns `false` if the tenant already has one.
    async fn try_insert(&self, row: &LockDbModel) -> Result<bool>;
    async fn get_lock(&self, tenant: TenantId) -> Result<Option<LockDbModel>>;
    /// Bump `acquired_at` if the row is owned by `owner_token` with `kind`.
    async fn refresh(&self, tenant: TenantId, kind: &str, owner_token: &str, now: i64)
    -> Result<bool>;
    /// Replace `expected` with `replacement` only if the row is unchanged.
    async fn take_over(&self, expected: &LockDbModel, replacement: &LockDbModel) -> Result<bool>;
    async fn delete_owned(&self, tenant: TenantId, kind: &str, owner_token: &str) -> Result<bool>;
    async fn delete_all(&self, tenant: TenantId) -> Result<u64>;
}

/// SQLx implementation of LockRepository.
pub struct SqlxLockRepository {
    pool: SqlitePool,
}

impl SqlxLockRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockRepository for SqlxLockRepository {
    async fn try_insert(&self, row: &LockDbModel) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO task_locks (tenant_id, kind, owner_token, acquired_at) VALUES (?, ?, ?, ?)",
        )
        .bind(row.tenant_id)
        .bind(&row.kind)
        .bind(&row.owner_token)
        .bind(row.acquired_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_lock(&self, tenant: TenantId) -> Result<Option<LockDbModel>> {
        let row = sqlx::query_as::<_, LockDbModel>("SELECT * FROM task_locks WHERE tenant_id = ?")
            .bind(tenant)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn refresh(
        &self,
        tenant: TenantId,
        kind: &str,
        owner_token: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE task_locks SET acquired_at = ? WHERE tenant_id = ? AND kind = ? AND owner_token = ?",
        )
        .bind(now)
        .bind(tenant)
        .bind(kind)
        .bind(owner_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn take_over(&self, expected: &LockDbModel, replacement: &LockDbModel) -> Result<bool> {
        // Compare-and-swap on (owner_token, acquired_at): if the holder refreshed
        // or another process took over first, nothing is updated.
        let result = sqlx::query(
            r#"
            UPDATE task_locks
            SET kind = ?, owner_token = ?, acquired_at = ?
            WHERE tenant_id = ? AND owner_token = ? AND acquired_at = ?
            "#,
        )
        .bind(&replacement.kind)
        .bind(&replacement.owner_token)
        .bind(replacement.acquired_at)
        .bind(expected.tenant_id)
        .bind(&expected.owner_token)
        .bind(expected.acquired_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_owned(&self, tenant: TenantId, kind: &str, owner_token: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM task_locks WHERE tenant_id = ? AND kind = ? AND owner_token = ?",
        )
        .bind(tenant)
        .bind(kind)
        .bind(owner_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_all(&self, tenant: TenantId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM task_locks WHERE tenant_id = ?")
            .bind(tenant)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
