//! Interfaces to the collaborators the compile handler consults.
//!
//! The server itself neither understands the shared class cache nor
//! generates code. It talks to two collaborators:
//!
//! - a [`SharedCache`], which maps request offsets to method identities and
//!   knows which methods already have a cached artifact, and
//! - a [`CompilationEngine`], which plans and runs compilations.
//!
//! Cache lookups are only reachable through a [`CacheAccess`] value obtained
//! from [`SharedCache::enter`]. The access value is the exclusive-access
//! guard: it is held for the whole lookup sequence and released when dropped,
//! on every exit path.
//!
//! A compilation that outlives the handler receives the conversation as a
//! [`CompletionHandle`]. Holding the handle is holding the obligation to
//! answer the client.

use crate::rpc::{Conversation, SlotTag};
use aotserve_core::{Result, proto::CompilationCode, types::MethodOffsets};
use bytes::Bytes;
use core::fmt;

/// A method as known to the shared class cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MethodIdentity {
    pub offsets: MethodOffsets,
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
}

impl fmt::Display for MethodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class_name, self.method_name, self.signature)
    }
}

/// An executable method, resolved from its identity through the loaded class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodHandle {
    pub identity: MethodIdentity,
    /// Position of the method in its class's method table.
    pub index: u32,
}

/// Scoped access to the shared class cache.
pub trait CacheAccess {
    /// Maps request offsets to a method identity, or `None` if the class is
    /// not in the shared cache.
    fn resolve_symbol(&self, offsets: &MethodOffsets) -> Option<MethodIdentity>;

    /// Whether a compiled artifact for `method` is already in the cache.
    fn has_cached_artifact(&self, method: &MethodIdentity) -> bool;

    /// Finds the executable method for `method` in its loaded class.
    fn resolve_method(&self, method: &MethodIdentity) -> Option<MethodHandle>;
}

/// The persistent shared class cache.
pub trait SharedCache: Send + Sync + 'static {
    type Access<'a>: CacheAccess
    where
        Self: 'a;

    /// Acquires exclusive access. Access is released when the returned value
    /// is dropped.
    fn enter(&self) -> Self::Access<'_>;
}

/// A compilation engine that can defer its answer.
pub trait CompilationEngine: Send + Sync + 'static {
    type Plan: Send;

    /// Creates a compilation plan for `method`, or `None` if the engine has
    /// no capacity to plan right now.
    fn create_plan(&self, method: &MethodHandle) -> Option<Self::Plan>;

    /// Submits a planned compilation.
    ///
    /// On `Ok(())` the engine owns `completion` and must eventually call
    /// [`CompletionHandle::respond_and_close`]. On rejection the handle is
    /// returned together with the code to report.
    fn submit_compile(
        &self,
        plan: Self::Plan,
        completion: CompletionHandle,
    ) -> core::result::Result<(), Rejected>;
}

/// A submission the engine could not enqueue.
#[derive(Debug)]
pub struct Rejected {
    pub code: CompilationCode,
    pub completion: CompletionHandle,
}

/// The right and the obligation to answer one deferred conversation.
///
/// Dropping the handle without responding abandons the conversation; the
/// slot is still re-armed.
#[derive(Debug)]
pub struct CompletionHandle {
    conversation: Conversation,
}

impl CompletionHandle {
    pub(crate) fn new(conversation: Conversation) -> Self {
        Self { conversation }
    }

    pub fn tag(&self) -> SlotTag {
        self.conversation.tag()
    }

    /// Writes the final outcome to the client and closes the conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is no longer listening. The slot is
    /// re-armed either way.
    pub async fn respond_and_close(self, code: CompilationCode, artifact: Option<Bytes>) -> Result<()> {
        self.conversation.respond_and_close(code, artifact).await
    }
}
