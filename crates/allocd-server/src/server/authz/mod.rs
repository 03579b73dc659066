//! Authorization of allocation and task operations.
//!
//! - [`provider`] - The pluggable policy interface.
//! - [`basic`] - Default policy used by the binary.
//! - [`gateway`] - Ownership resolution and the capability-check chain.
//! - [`recheck`] - Periodic re-authorization of long-lived streams.

pub mod basic;
pub mod gateway;
pub mod provider;
pub mod recheck;

pub use basic::BasicAuthz;
pub use gateway::{AuthzGateway, Ownership};
pub use provider::{AuthzProvider, ExperimentAction};
pub use recheck::AuthRecheck;
