//! Definitions shared by the `allocd` server and its clients.
//!
//! - [`error`] - The service-wide [`Error`] type and its gRPC status mapping.
//! - [`types`] - Domain types for allocations, tasks, experiments and logs.
//! - [`proto`] - Generated protobuf messages and the `Allocd` service.

pub mod error;
pub mod types;

pub use error::{Error, Result};

/// gRPC service and message definitions generated from `proto/allocd.proto`.
pub mod proto {
    tonic::include_proto!("allocd.v1");

    /// Encoded descriptor set, registered with the reflection service.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("allocd_descriptor");
}
