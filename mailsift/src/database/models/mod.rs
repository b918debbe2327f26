//! Database models.
//!
//! Plain row structs mapped with `sqlx::FromRow`. Timestamps are epoch millis.

pub mod analysis;
pub mod record;
pub mod schedule;
pub mod sync;

pub use analysis::*;
pub use record::*;
pub use schedule::*;
pub use sync::*;

/// Opaque tenant identifier; every other entity is scoped by it.
pub type TenantId = i64;

/// Record row id.
pub type RecordId = i64;
