//! Transactional operations for analysis write-back.
//!
//! Used by the result sink inside a single `BEGIN IMMEDIATE` transaction so a
//! record's result and status always change together.

use sqlx::SqliteConnection;

use crate::Result;
use crate::database::models::{RecordId, RecordStatus, TenantId};
use crate::database::time::now_ms;

/// Row fields for a new analysis result.
#[derive(Debug, Clone)]
pub struct NewAnalysisResult {
    pub summary: String,
    pub importance_score: i64,
    pub importance_reason: String,
    pub entries_json: String,
    pub model_tag: String,
    pub produced_at: i64,
}

/// Transactional operations for analysis results.
///
/// These methods operate within an existing transaction and do NOT commit.
/// The caller is responsible for committing or rolling back the transaction.
pub struct AnalysisTxOps;

impl AnalysisTxOps {
    /// Delete the stored result of a record, if any.
    pub async fn delete_result(tx: &mut SqliteConnection, record_id: RecordId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM analysis_results WHERE record_id = ?")
            .bind(record_id)
            .execute(tx)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_result(
        tx: &mut SqliteConnection,
        tenant: TenantId,
        record_id: RecordId,
        result: &NewAnalysisResult,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO analysis_results (
                tenant_id, record_id, summary, importance_score, importance_reason,
                entries_json, model_tag, produced_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(tenant)
        .bind(record_id)
        .bind(&result.summary)
        .bind(result.importance_score)
        .bind(&result.importance_reason)
        .bind(&result.entries_json)
        .bind(&result.model_tag)
        .bind(result.produced_at)
        .fetch_one(tx)
        .await?;
        Ok(id)
    }

    /// Set a record's final status. `last_error` is cleared on success.
    pub async fn set_record_status(
        tx: &mut SqliteConnection,
        record_id: RecordId,
        status: RecordStatus,
        last_error: Option<&str>,
    ) -> Result<u64> {
        let result =
            sqlx::query("UPDATE records SET status = ?, last_error = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(last_error)
                .bind(now_ms())
                .bind(record_id)
                .execute(tx)
                .await?;
        Ok(result.rows_affected())
    }
}
