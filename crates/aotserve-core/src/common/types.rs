//! # Request identity and protocol constants
//!
//! A compile request names its target only through four offsets into the
//! persistent shared class cache. [`MethodOffsets`] is the owned, hashable
//! form of those offsets that the server passes to its symbol resolver.

use crate::proto::{CompilationCode, CompileRequest, CompileResponse};
use core::fmt;

/// Default number of concurrently open `Compile` streams per server.
pub const DEFAULT_POOL_SIZE: usize = 7;

/// Default TCP listen address.
pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:38400";

/// The four shared-cache offsets that identify a compile target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MethodOffsets {
    pub class: u64,
    pub method: u64,
    pub class_chain: u64,
    pub class_chain_loader: u64,
}

impl From<&CompileRequest> for MethodOffsets {
    fn from(req: &CompileRequest) -> Self {
        Self {
            class: req.class_offset,
            method: req.method_offset,
            class_chain: req.class_chain_offset,
            class_chain_loader: req.class_chain_loader_offset,
        }
    }
}

impl From<MethodOffsets> for CompileRequest {
    fn from(offsets: MethodOffsets) -> Self {
        Self {
            class_offset: offsets.class,
            method_offset: offsets.method,
            class_chain_offset: offsets.class_chain,
            class_chain_loader_offset: offsets.class_chain_loader,
        }
    }
}

impl fmt::Display for MethodOffsets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "class={:#x} method={:#x} chain={:#x} loader={:#x}",
            self.class, self.method, self.class_chain, self.class_chain_loader
        )
    }
}

impl CompileResponse {
    /// Clears the response so it can be reused for the next conversation.
    pub fn reset(&mut self) {
        self.code = CompilationCode::Unspecified as i32;
        self.artifact.clear();
    }
}
