//! Repository layer for database access.
//!
//! Each table family is reached through a trait with one sqlx implementation,
//! so services depend on the trait and tests can swap the backing pool.

pub mod analysis_tx;
pub mod cursor;
pub mod lock;
pub mod record;
pub mod schedule;
pub mod tenant;

pub use analysis_tx::*;
pub use cursor::*;
pub use lock::*;
pub use record::*;
pub use schedule::*;
pub use tenant::*;
