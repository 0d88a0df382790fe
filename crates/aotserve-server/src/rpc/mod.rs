//! Streaming-RPC multiplexing engine.
//!
//! - [`slot`] - Stream slots, their lifecycle states and the [`Conversation`]
//!   handle that owns an active request/response cycle.
//! - [`pool`] - The fixed-size [`StreamPool`] and its accept queue.
//! - [`dispatch`] - The [`DispatchLoop`], sole consumer of the notification
//!   channel.
//! - [`service`] - The tonic `Compiler` service that feeds accepted RPCs into
//!   the pool.

pub mod dispatch;
pub mod pool;
pub mod service;
pub mod slot;

pub use dispatch::DispatchLoop;
pub use pool::{Notifications, StreamPool};
pub use service::CompileService;
pub use slot::{Conversation, Inbound, Outbound, SlotState, SlotTag, StreamSlot};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Creates a pool of `size` slots and the dispatch loop that consumes its
/// notifications.
///
/// # Panics
///
/// Panics if `size` is zero.
pub fn bind(size: usize, shutdown: CancellationToken) -> (Arc<StreamPool>, DispatchLoop) {
    let (pool, notifications) = StreamPool::initialize(size, shutdown.clone());
    let dispatch = DispatchLoop::new(Arc::clone(&pool), notifications, shutdown);
    (pool, dispatch)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{Inbound, Outbound};
    use aotserve_core::proto::{CompileRequest, CompileResponse};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;
    use tonic::Status;

    pub type RequestTx = mpsc::Sender<Result<CompileRequest, Status>>;
    pub type ResponseRx = mpsc::Receiver<Result<CompileResponse, Status>>;

    /// Both halves of an in-memory client stream.
    pub fn client() -> (Inbound, Outbound, RequestTx, ResponseRx) {
        let (request_tx, request_rx) = mpsc::channel(4);
        let (response_tx, response_rx) = mpsc::channel(4);
        (
            Box::pin(ReceiverStream::new(request_rx)),
            response_tx,
            request_tx,
            response_rx,
        )
    }

    pub fn request(class_offset: u64, method_offset: u64) -> CompileRequest {
        CompileRequest {
            class_offset,
            method_offset,
            class_chain_offset: 0,
            class_chain_loader_offset: 0,
        }
    }
}
