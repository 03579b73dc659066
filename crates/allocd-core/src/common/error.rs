//! Error types for the allocation control plane.
//!
//! This module defines the central `Error` enum shared by the authorization
//! gateway, the rendezvous barrier and the streaming engine. It implements
//! `From<Error>` for `tonic::Status` so handlers can propagate failures with
//! `?` and clients observe a stable status code.
//!
//! ## Error Cases
//! - `NotFound`: unknown allocation/task/round, or a view-level authorization
//!   denial that must not confirm the resource exists.
//! - `PermissionDenied`: the caller can see the resource but lacks the
//!   capability for the requested action.
//! - `InvalidRequest`: malformed request (identifiers, filters, peer counts,
//!   follow/limit combinations).
//! - `Unauthenticated`: no acting user could be resolved for the request.
//! - `Backend`: storage or coordination component failure.
//! - `ChannelError`: an internal channel between tasks closed unexpectedly.
//! - `RoundAbandoned`: a rendezvous peer gave up before the round sealed.
//! - `ServiceShutdown`: the server is shutting down.
//! - `Aggregate`: several independent upstream failures collected while a
//!   stream was drained.

use core::fmt::Write as _;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the allocation control plane.
///
/// `Clone` so that a single failure can be broadcast to every peer waiting on
/// a rendezvous round.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The resource does not exist, or the caller may not know that it does.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The caller is not allowed to perform the action.
    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// The client request was malformed.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// No user could be resolved for the request.
    #[error("Unauthenticated: {reason}")]
    Unauthenticated { reason: String },

    /// A storage or coordination backend failed.
    #[error("Backend error: {context}")]
    Backend { context: String },

    /// Internal channel send/receive failure (e.g., closed channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// A peer deregistered from a rendezvous round before it sealed.
    #[error("Rendezvous round '{round}' was abandoned by watcher {watcher}")]
    RoundAbandoned { round: String, watcher: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// Upstream failures accumulated while draining a stream.
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn backend(context: impl Into<String>) -> Self {
        Self::Backend {
            context: context.into(),
        }
    }

    /// Wraps accumulated upstream errors: `None` when nothing failed.
    pub fn aggregate(errors: Vec<Error>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self::Aggregate(errors))
        }
    }
}

fn format_aggregate(errors: &[Error]) -> String {
    let mut out = format!("{} errors occurred:", errors.len());
    for err in errors {
        let _ = write!(out, "\n\t* {err}");
    }
    out
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound { .. } => Status::not_found(err.to_string()),
            Error::PermissionDenied { reason } => Status::permission_denied(reason),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::Unauthenticated { reason } => Status::unauthenticated(reason),
            Error::Backend { context } => Status::internal(format!("Backend error: {context}")),
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {context}"))
            }
            Error::RoundAbandoned { .. } => Status::aborted(err.to_string()),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
            Error::Aggregate(mut errors) => {
                if errors.len() == 1 {
                    if let Some(only) = errors.pop() {
                        return only.into();
                    }
                }
                Status::internal(format_aggregate(&errors))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn maps_taxonomy_to_status_codes() {
        let cases = [
            (Error::not_found("task", "t1"), Code::NotFound),
            (
                Error::PermissionDenied {
                    reason: "no".into(),
                },
                Code::PermissionDenied,
            ),
            (Error::invalid("bad"), Code::InvalidArgument),
            (Error::backend("db down"), Code::Internal),
            (Error::ServiceShutdown, Code::Unavailable),
            (
                Error::RoundAbandoned {
                    round: "r".into(),
                    watcher: "w".into(),
                },
                Code::Aborted,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn not_found_message_names_the_resource() {
        let status = Status::from(Error::not_found("allocation", "a.1"));
        assert_eq!(status.message(), "allocation not found: a.1");
    }

    #[test]
    fn aggregate_is_none_without_errors() {
        assert_eq!(Error::aggregate(vec![]), None);
        let one = Error::aggregate(vec![Error::backend("x")]);
        assert_eq!(one, Some(Error::Aggregate(vec![Error::backend("x")])));
    }

    #[test]
    fn aggregate_status_uses_single_member_code() {
        let status = Status::from(Error::Aggregate(vec![Error::PermissionDenied {
            reason: "revoked".into(),
        }]));
        assert_eq!(status.code(), Code::PermissionDenied);

        let status = Status::from(Error::Aggregate(vec![
            Error::backend("a"),
            Error::backend("b"),
        ]));
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().starts_with("2 errors occurred:"));
    }
}
