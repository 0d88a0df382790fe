//! The compile decision protocol.
//!
//! [`CompileHandler::compile`] reads one request from a conversation and
//! decides what to do with it:
//!
//! 1. Offsets that do not resolve in the shared cache fail fast.
//! 2. Methods with a cached artifact are answered `COMPILATION_NOT_NEEDED`.
//! 3. Methods with no executable form fail.
//! 4. If the engine cannot plan the compilation, the request fails.
//! 5. Otherwise the plan is submitted together with a [`CompletionHandle`].
//!    A rejected submission fails; an accepted one leaves the conversation
//!    open and the engine answers later.
//!
//! Steps 1-4 run under a single shared-cache access scope.

use crate::{
    collab::{CacheAccess, CompilationEngine, CompletionHandle, MethodIdentity, Rejected, SharedCache},
    rpc::Conversation,
    telemetry::{increment_transport_errors, record_decision},
};
use aotserve_core::{Result, proto::CompilationCode, types::MethodOffsets};
use core::fmt;
use std::sync::Arc;
use tonic::Status;

/// Why a request was answered with `COMPILATION_FAILURE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    /// The offsets do not name a class/method in the shared cache.
    ResolutionFailed,
    /// The class resolved but the method has no executable form.
    MethodNotFound,
    /// The engine could not create a compilation plan.
    PlanCreationFailed,
    /// The engine refused to enqueue the plan.
    QueueFailed,
}

impl Failure {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResolutionFailed => "resolution_failed",
            Self::MethodNotFound => "method_not_found",
            Self::PlanCreationFailed => "plan_creation_failed",
            Self::QueueFailed => "queue_failed",
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of handling one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Answered immediately with `COMPILATION_FAILURE`.
    Fail(Failure),
    /// Answered immediately with `COMPILATION_NOT_NEEDED`.
    NotNeeded,
    /// Handed to the engine, which answers later.
    Queued,
}

impl Decision {
    /// The code this decision reports to the client.
    pub const fn code(self) -> CompilationCode {
        match self {
            Self::Fail(_) => CompilationCode::CompilationFailure,
            Self::NotNeeded => CompilationCode::CompilationNotNeeded,
            Self::Queued => CompilationCode::CompilationInProgress,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fail(failure) => failure.as_str(),
            Self::NotNeeded => "not_needed",
            Self::Queued => "queued",
        }
    }
}

/// Decides, per request, whether to fail, skip, or compile.
pub struct CompileHandler<C, E> {
    cache: Arc<C>,
    engine: Arc<E>,
}

impl<C, E> Clone for CompileHandler<C, E> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<C: SharedCache, E: CompilationEngine> CompileHandler<C, E> {
    pub fn new(cache: Arc<C>, engine: Arc<E>) -> Self {
        Self { cache, engine }
    }

    /// Handles one conversation from read to decision.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the request could not be read. The
    /// conversation is abandoned and its slot re-armed; no response is sent.
    pub async fn compile(&self, mut conversation: Conversation) -> Result<Decision> {
        let offsets = match conversation.read().await {
            Ok(request) => MethodOffsets::from(request),
            Err(e) => {
                tracing::warn!("Failed to read compile request: {e}");
                increment_transport_errors();
                conversation.abandon(Status::from(e.clone()));
                return Err(e);
            }
        };

        let decision = match self.plan(&offsets) {
            Err(decision) => {
                self.respond(conversation, decision.code()).await;
                decision
            }
            Ok((method, plan)) => {
                match self
                    .engine
                    .submit_compile(plan, CompletionHandle::new(conversation))
                {
                    Ok(()) => {
                        tracing::info!(%method, "Queued compilation");
                        Decision::Queued
                    }
                    Err(Rejected { code, completion }) => {
                        tracing::info!(%method, ?code, "Failed to queue compilation");
                        if let Err(e) = completion.respond_and_close(code, None).await {
                            tracing::debug!("Failed to respond: {e}");
                        }
                        Decision::Fail(Failure::QueueFailed)
                    }
                }
            }
        };

        record_decision(decision.as_str());
        Ok(decision)
    }

    /// Resolves and plans the request while holding shared-cache access.
    fn plan(&self, offsets: &MethodOffsets) -> core::result::Result<(MethodIdentity, E::Plan), Decision> {
        let access = self.cache.enter();

        let Some(method) = access.resolve_symbol(offsets) else {
            tracing::info!(%offsets, "Class is not in the shared cache, cannot compile");
            return Err(Decision::Fail(Failure::ResolutionFailed));
        };

        if access.has_cached_artifact(&method) {
            tracing::info!(%method, "Method already exists in the shared cache");
            return Err(Decision::NotNeeded);
        }

        let Some(handle) = access.resolve_method(&method) else {
            tracing::info!(%method, "No executable method found");
            return Err(Decision::Fail(Failure::MethodNotFound));
        };

        let Some(plan) = self.engine.create_plan(&handle) else {
            tracing::info!(%method, "Compilation plan could not be created");
            return Err(Decision::Fail(Failure::PlanCreationFailed));
        };

        Ok((method, plan))
    }

    async fn respond(&self, conversation: Conversation, code: CompilationCode) {
        if let Err(e) = conversation.respond_and_close(code, None).await {
            tracing::debug!("Failed to respond: {e}");
        }
    }
}
