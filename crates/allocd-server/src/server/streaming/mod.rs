//! Batched streaming engine behind `TaskLogs` and `TaskLogsFields`.
//!
//! ## Structure
//!
//! - [`batch`] - Paging parameters and limit reconciliation.
//! - [`filter`] - Request to filter translation.
//! - [`fetcher`] - Backend fetchers, re-authorization and termination checks.
//! - [`processor`] - The fetch/emit/wait loop with follow semantics.
//! - [`aggregator`] - Draining and zipping of producer channels.
//! - [`coordinator`] - Wiring of a processor to a gRPC response stream.

pub mod aggregator;
pub mod batch;
pub mod coordinator;
pub mod fetcher;
pub mod filter;
pub mod processor;
