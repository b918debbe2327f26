//! mailsift library crate.
//!
//! Incremental mailbox ingestion with concurrent content analysis, durable
//! per-tenant locking and live progress streaming.

pub mod analysis;
pub mod api;
pub mod archive;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod lock;
pub mod logging;
pub mod notification;
pub mod pipeline;
pub mod schedule;
pub mod source;
pub mod task;
pub mod testing;
pub mod utils;
pub mod worker;

pub use error::{Error, Result};
