//! Shared protocol definitions, error types, and wire-level helpers.
//!
//! - [`proto`] - Generated protobuf messages with the `Compiler` client and
//!   server bindings.
//! - [`error`] - The [`Error`] enum shared by every layer of the server.
//! - [`types`] - Request identity and protocol constants.

pub mod error;
pub mod types;

pub use error::{Error, Result};

/// gRPC service and message definitions generated from
/// `proto/aotserve.proto`.
///
/// ## Service
///
/// - `Compiler.Compile` - bidirectional stream carrying one
///   [`CompileRequest`](proto::CompileRequest) and one
///   [`CompileResponse`](proto::CompileResponse) per conversation.
///
/// [`FILE_DESCRIPTOR_SET`](proto::FILE_DESCRIPTOR_SET) is the encoded schema
/// used to serve gRPC reflection.
pub mod proto {
    #![allow(clippy::enum_variant_names)]
    tonic::include_proto!("aotserve");
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("aotserve_descriptor");
}
