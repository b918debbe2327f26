//! Record repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{
    AnalysisResultDbModel, NewRecord, RecordCounts, RecordDbModel, RecordId, RecordStatus,
    TenantId,
};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Outcome of an insert keyed by identity.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// A new row was created.
    Inserted(RecordDbModel),
    /// A row with the same identity key already existed; nothing was written.
    Existing(RecordDbModel),
}

impl InsertOutcome {
    pub fn record(&self) -> &RecordDbModel {
        match self {
            Self::Inserted(r) | Self::Existing(r) => r,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Record repository trait.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn get_record(&self, id: RecordId) -> Result<RecordDbModel>;
    async fn find_by_identity(
        &self,
        tenant: TenantId,
        identity_key: &str,
    ) -> Result<Option<RecordDbModel>>;
    /// Insert unless the identity key exists. Never creates duplicates.
    async fn insert_record(&self, record: &NewRecord) -> Result<InsertOutcome>;
    async fn count_records(&self, tenant: TenantId) -> Result<u64>;
    async fn count_by_status(&self, tenant: TenantId) -> Result<RecordCounts>;
    /// Records in `unanalyzed` or `failed`, oldest source id first.
    async fn list_backlog(&self, tenant: TenantId, limit: i64) -> Result<Vec<RecordDbModel>>;
    /// unanalyzed|failed -> analyzing. Returns false if the record was in another state.
    async fn mark_analyzing(&self, id: RecordId) -> Result<bool>;
    /// analyzing -> unanalyzed, for work that was submitted but never started.
    async fn release_analyzing(&self, id: RecordId) -> Result<bool>;
    /// Reset every `analyzing` row of a tenant (left behind by a crashed run).
    async fn reset_stale_analyzing(&self, tenant: TenantId) -> Result<u64>;
    async fn get_analysis(&self, record_id: RecordId) -> Result<Option<AnalysisResultDbModel>>;
}

/// SQLx implementation of RecordRepository.
pub struct SqlxRecordRepository {
    pool: SqlitePool,
}

impl SqlxRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordRepository for SqlxRecordRepository {
    async fn get_record(&self, id: RecordId) -> Result<RecordDbModel> {
        sqlx::query_as::<_, RecordDbModel>("SELECT * FROM records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Record", id.to_string()))
    }

    async fn find_by_identity(
        &self,
        tenant: TenantId,
        identity_key: &str,
    ) -> Result<Option<RecordDbModel>> {
        let record = sqlx::query_as::<_, RecordDbModel>(
            "SELECT * FROM records WHERE tenant_id = ? AND identity_key = ?",
        )
        .bind(tenant)
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn insert_record(&self, record: &NewRecord) -> Result<InsertOutcome> {
        let now = now_ms();
        let inserted = sqlx::query_as::<_, RecordDbModel>(
            r#"
            INSERT INTO records (
                tenant_id, identity_key, source_id, subject, sender, body, html_body,
                received_at, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'unanalyzed', ?, ?)
            ON CONFLICT (tenant_id, identity_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(record.tenant_id)
        .bind(&record.identity_key)
        .bind(record.source_id)
        .bind(&record.subject)
        .bind(&record.sender)
        .bind(&record.body)
        .bind(&record.html_body)
        .bind(record.received_at)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Inserted(row));
        }

        self.find_by_identity(record.tenant_id, &record.identity_key)
            .await?
            .map(InsertOutcome::Existing)
            .ok_or_else(|| Error::not_found("Record", record.identity_key.clone()))
    }

    async fn count_records(&self, tenant: TenantId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE tenant_id = ?")
            .bind(tenant)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn count_by_status(&self, tenant: TenantId) -> Result<RecordCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM records WHERE tenant_id = ? GROUP BY status",
        )
        .bind(tenant)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = RecordCounts::default();
        for (status, count) in rows {
            let count = count as u64;
            match RecordStatus::parse(&status) {
                Some(RecordStatus::Unanalyzed) | None => counts.unanalyzed += count,
                Some(RecordStatus::Analyzing) => counts.analyzing += count,
                Some(RecordStatus::Analyzed) => counts.analyzed += count,
                Some(RecordStatus::Failed) => counts.failed += count,
            }
        }
        Ok(counts)
    }

    async fn list_backlog(&self, tenant: TenantId, limit: i64) -> Result<Vec<RecordDbModel>> {
        let records = sqlx::query_as::<_, RecordDbModel>(
            r#"
            SELECT * FROM records
            WHERE tenant_id = ? AND status IN ('unanalyzed', 'failed')
            ORDER BY source_id ASC
            LIMIT ?
            "#,
        )
        .bind(tenant)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn mark_analyzing(&self, id: RecordId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE records SET status = 'analyzing', updated_at = ?
            WHERE id = ? AND status IN ('unanalyzed', 'failed')
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_analyzing(&self, id: RecordId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE records SET status = 'unanalyzed', updated_at = ? WHERE id = ? AND status = 'analyzing'",
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_stale_analyzing(&self, tenant: TenantId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE records SET status = 'unanalyzed', updated_at = ? WHERE tenant_id = ? AND status = 'analyzing'",
        )
        .bind(now_ms())
        .bind(tenant)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_analysis(&self, record_id: RecordId) -> Result<Option<AnalysisResultDbModel>> {
        let result = sqlx::query_as::<_, AnalysisResultDbModel>(
            "SELECT * FROM analysis_results WHERE record_id = ?",
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(result)
    }
}
