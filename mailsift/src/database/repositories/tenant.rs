//! Tenant repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{TenantDbModel, TenantId};

/// Tenant repository trait.
#[async_trait]
pub trait TenantRepository: Send + Sync {
    /// Active tenants with auto-sync enabled.
    async fn list_auto_sync(&self) -> Result<Vec<TenantDbModel>>;
    async fn upsert_tenant(&self, tenant: &TenantDbModel) -> Result<()>;
    async fn touch_last_sync(&self, tenant: TenantId, at: i64) -> Result<()>;
}

/// SQLx implementation of TenantRepository.
pub struct SqlxTenantRepository {
    pool: SqlitePool,
}

impl SqlxTenantRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantRepository for SqlxTenantRepository {
    async fn list_auto_sync(&self) -> Result<Vec<TenantDbModel>> {
        let tenants = sqlx::query_as::<_, TenantDbModel>(
            "SELECT * FROM tenants WHERE is_active = 1 AND auto_sync = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tenants)
    }

    async fn upsert_tenant(&self, tenant: &TenantDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, is_active, auto_sync, sync_interval_secs, last_sync_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                is_active = excluded.is_active,
                auto_sync = excluded.auto_sync,
                sync_interval_secs = excluded.sync_interval_secs
            "#,
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(tenant.is_active)
        .bind(tenant.auto_sync)
        .bind(tenant.sync_interval_secs)
        .bind(tenant.last_sync_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_last_sync(&self, tenant: TenantId, at: i64) -> Result<()> {
        sqlx::query("UPDATE tenants SET last_sync_at = ? WHERE id = ?")
            .bind(at)
            .bind(tenant)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
