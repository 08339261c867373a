//! Records and live counter state for the nudge engine
//!
//! - `types.rs`: events, sessions, baselines and the write-once records
//!   (diagnosis, nudge, escalation) produced by a trigger cycle.
//! - `store.rs`: atomic per-key counter storage backing the nudge counters.

pub mod store;
pub mod types;

pub use store::{
    CounterStore, InMemoryCounterStore, SharedCounterStore, StoreError, StoreResult,
    DEFAULT_COUNTER_TTL_SECS,
};
pub use types::*;
