//! Per-tenant progress event bus.

mod bus;
mod kind;

pub use bus::{EventBus, EventBusConfig, EventStream};
pub use kind::{Counters, EventKind, ProgressEvent};
