//! Cursor (watermark) repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::TenantId;
use crate::database::time::now_ms;

/// Cursor repository trait.
#[async_trait]
pub trait CursorRepository: Send + Sync {
    /// Stored watermark, or `None` when the tenant has never committed one.
    async fn get_watermark(&self, tenant: TenantId) -> Result<Option<i64>>;
    /// Persist `max(current, candidate)` and return the stored value.
    async fn advance_watermark(&self, tenant: TenantId, candidate: i64) -> Result<i64>;
}

/// SQLx implementation of CursorRepository.
pub struct SqlxCursorRepository {
    pool: SqlitePool,
}

impl SqlxCursorRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorRepository for SqlxCursorRepository {
    async fn get_watermark(&self, tenant: TenantId) -> Result<Option<i64>> {
        let watermark: Option<i64> =
            sqlx::query_scalar("SELECT watermark FROM sync_cursors WHERE tenant_id = ?")
                .bind(tenant)
                .fetch_optional(&self.pool)
                .await?;
        Ok(watermark)
    }

    async fn advance_watermark(&self, tenant: TenantId, candidate: i64) -> Result<i64> {
        // The MAX() keeps the watermark monotonic even if two writers race.
        let stored: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sync_cursors (tenant_id, watermark, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (tenant_id) DO UPDATE SET
                updated_at = CASE WHEN excluded.watermark > sync_cursors.watermark
                    THEN excluded.updated_at ELSE sync_cursors.updated_at END,
                watermark = MAX(sync_cursors.watermark, excluded.watermark)
            RETURNING watermark
            "#,
        )
        .bind(tenant)
        .bind(candidate)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(stored)
    }
}
