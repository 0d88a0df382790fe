//! Error types for the compile server.
//!
//! This module defines the central `Error` enum shared by the stream pool, the
//! dispatch loop and the compilation engine. It implements `From<Error>` for
//! `tonic::Status` so failures that reach the RPC boundary carry a sensible
//! gRPC status code.
//!
//! Compile outcomes (resolution failures, methods already cached, queue
//! rejections) are *not* errors: they travel to the client as a
//! `CompilationCode` in a normal response. The variants here describe the
//! plumbing itself failing.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the compile server.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// A pending stream operation reported a transport-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The client closed its half of the stream before sending a request.
    #[error("Stream closed by client")]
    StreamClosed,

    /// A notification tag that does not name a slot in the pool.
    #[error("Unknown slot tag {tag} (pool size {pool_size})")]
    UnknownTag { tag: usize, pool_size: usize },

    /// The compilation backend failed to produce an artifact.
    #[error("Backend error: {reason}")]
    Backend { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Transport(format!("{:?}: {}", status.code(), status.message()))
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {}", context))
            }
            Error::Transport(reason) => Status::unavailable(reason),
            Error::StreamClosed => Status::cancelled("Stream closed by client"),
            Error::UnknownTag { tag, pool_size } => {
                Status::internal(format!("Unknown slot tag {tag} (pool size {pool_size})"))
            }
            Error::Backend { reason } => Status::internal(reason),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn maps_errors_to_grpc_codes() {
        assert_eq!(Status::from(Error::ServiceShutdown).code(), Code::Unavailable);
        assert_eq!(Status::from(Error::StreamClosed).code(), Code::Cancelled);
        assert_eq!(
            Status::from(Error::Backend {
                reason: "bad".into()
            })
            .code(),
            Code::Internal
        );
        assert_eq!(
            Status::from(Error::UnknownTag {
                tag: 9,
                pool_size: 7
            })
            .code(),
            Code::Internal
        );
    }

    #[test]
    fn status_becomes_transport_error() {
        let err = Error::from(Status::aborted("peer reset"));
        match err {
            Error::Transport(reason) => assert!(reason.contains("peer reset")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
