//! gRPC service implementation.
//!
//! ## Structure
//!
//! - [`handler`] - gRPC service entry point ([`AllocdService`]).
//! - [`convert`] - Protobuf to domain conversions.
//!
//! [`AllocdService`]: handler::AllocdService

pub mod convert;
pub mod handler;
