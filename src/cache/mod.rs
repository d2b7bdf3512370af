//! Response backup cache for the failover proxy.
//!
//! Provides a [`Store`] that keeps the last successful upstream response per
//! cache key so the gateway can answer from it when the upstream fails.

pub mod store;

pub use store::{run_sweeper, Store, StoredResponse};
