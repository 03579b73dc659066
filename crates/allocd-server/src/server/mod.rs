//! Server-side building blocks of the `allocd` control plane.
//!
//! ## Structure
//!
//! - [`allocation`] - Allocation registry and per-allocation coordination
//!   tasks (readiness, proxy address, all-gather rendezvous).
//! - [`authz`] - Ownership resolution and capability checks.
//! - [`backend`] - Task store, log backend and task kind interfaces, plus an
//!   in-memory implementation.
//! - [`streaming`] - The batched streaming engine behind the log RPCs.
//! - [`service`] - The gRPC service.
//! - [`config`] - CLI and environment configuration.
//! - [`telemetry`] - Logging, tracing and metrics setup.

pub mod allocation;
pub mod authz;
pub mod backend;
pub mod config;
pub mod service;
pub mod streaming;
pub mod telemetry;
