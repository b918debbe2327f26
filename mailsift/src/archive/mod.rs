//! Archival collaborator.
//!
//! Called after a result is committed. Best-effort: failures are logged by
//! the caller and never fail the item.

use async_trait::async_trait;

use crate::Result;
use crate::analysis::AnalysisResult;
use crate::database::models::{RecordDbModel, TenantId};

#[async_trait]
pub trait Archiver: Send + Sync {
    async fn archive(
        &self,
        tenant: TenantId,
        record: &RecordDbModel,
        result: &AnalysisResult,
    ) -> Result<()>;
}

/// Archiver that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopArchiver;

#[async_trait]
impl Archiver for NoopArchiver {
    async fn archive(
        &self,
        _tenant: TenantId,
        _record: &RecordDbModel,
        _result: &AnalysisResult,
    ) -> Result<()> {
        Ok(())
    }
}
