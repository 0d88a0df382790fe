//! gRPC entry point for compile conversations.
//!
//! [`CompileService`] implements the generated [`Compiler`] trait. It does not
//! look at requests at all: each incoming `Compile` call is an accept. The
//! service claims a free slot from the [`StreamPool`], binds the call's
//! inbound stream and a fresh outbound channel to it, and returns the
//! receiving end as the response stream. Everything after that is driven by
//! the dispatch loop.

use super::pool::StreamPool;
use crate::telemetry::{increment_requests, increment_stream_errors};
use aotserve_core::proto::{CompileRequest, CompileResponse, compiler_server::Compiler};
use core::pin::Pin;
use futures::TryStreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tonic::{Request, Response, Status, Streaming};

/// Feeds `Compile` RPCs into a shared [`StreamPool`].
#[derive(Clone)]
pub struct CompileService {
    pool: Arc<StreamPool>,
    stream_buffer_size: usize,
}

impl CompileService {
    pub fn new(pool: Arc<StreamPool>, stream_buffer_size: usize) -> Self {
        Self {
            pool,
            stream_buffer_size: stream_buffer_size.max(1),
        }
    }
}

#[tonic::async_trait]
impl Compiler for CompileService {
    type CompileStream = Pin<Box<dyn Stream<Item = Result<CompileResponse, Status>> + Send>>;

    /// Accepts a compile conversation.
    ///
    /// Waits for a free slot when the pool is saturated; the client's stream
    /// stays open meanwhile. Fails with `UNAVAILABLE` once the server is
    /// shutting down.
    #[tracing::instrument(skip_all, fields(remote = ?req.remote_addr()))]
    async fn compile(
        &self,
        req: Request<Streaming<CompileRequest>>,
    ) -> Result<Response<Self::CompileStream>, Status> {
        increment_requests();

        let inbound = Box::pin(req.into_inner());
        let (resp_tx, resp_rx) = mpsc::channel(self.stream_buffer_size);

        if let Err(e) = self.pool.accept(inbound, resp_tx).await {
            tracing::warn!("Failed to accept conversation: {e}");
            return Err(e.into());
        }

        let stream = ReceiverStream::new(resp_rx).inspect_err(|_status| {
            increment_stream_errors();
        });

        Ok(Response::new(Box::pin(stream)))
    }
}
