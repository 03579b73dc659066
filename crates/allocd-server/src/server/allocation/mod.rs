//! Per-allocation coordination.
//!
//! - [`registry`] - Live allocations and their ownership facts.
//! - [`handle`] - Request/acknowledge interface to a coordination task.
//! - [`worker`] - The coordination task itself.
//! - [`rendezvous`] - All-gather round bookkeeping.

pub mod handle;
pub mod registry;
pub mod rendezvous;
pub mod request;
pub mod worker;

pub use handle::{AllGatherWatch, AllocationHandle};
pub use registry::{AllocationEntry, AllocationRegistry};
pub use request::AllocationState;
