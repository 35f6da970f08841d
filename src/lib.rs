//! clickflow - write-behind click aggregation
//!
//! Per-banner click events are admitted through a bounded queue, accumulated
//! as per-minute counters in a cache store, and periodically claimed, summed
//! and upserted into a durable SQLite store.
//!
//! See [`pipeline`] for the component breakdown.

pub mod pipeline;
pub mod sqlite_pragma;
