//! Stream slots and the conversations they host.
//!
//! A [`StreamSlot`] is one of the pool's fixed positions. It lives for the
//! whole process and cycles through [`SlotState`] once per conversation:
//!
//! ```text
//! Accepting -> Reading -> Dispatched -> Writing -> Finishing -> Accepting
//! ```
//!
//! While a conversation is active, the slot's context and buffers are owned
//! by a single [`Conversation`] value. Every operation on it takes `&mut self`
//! or `self`, so two operations can never be outstanding on the same slot at
//! once. Whoever holds the `Conversation` (the dispatch loop's handler or a
//! compilation worker) is the only party that can finish it.

use crate::telemetry::{decrement_conversations_inflight, record_conversation_duration};
use aotserve_core::{
    Error, Result,
    proto::{CompilationCode, CompileRequest, CompileResponse},
};
use bytes::Bytes;
use core::{fmt, mem, pin::Pin};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use portable_atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tonic::Status;

/// Inbound half of a conversation: the client's request messages.
pub type Inbound = Pin<Box<dyn Stream<Item = core::result::Result<CompileRequest, Status>> + Send>>;

/// Outbound half of a conversation: responses forwarded to the client's
/// stream. Dropping the last sender ends the RPC with an OK status.
pub type Outbound = mpsc::Sender<core::result::Result<CompileResponse, Status>>;

/// Identifies one slot of the pool. Tags are what travel through the
/// notification channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotTag(usize);

impl SlotTag {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Lifecycle position of a [`StreamSlot`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Waiting for a client to open a new conversation.
    Accepting = 0,
    /// A read of the client's request is pending.
    Reading = 1,
    /// The request is with the compile handler or the compilation engine.
    Dispatched = 2,
    /// A response write is pending.
    Writing = 3,
    /// The conversation is being closed.
    Finishing = 4,
}

impl SlotState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Accepting,
            1 => Self::Reading,
            2 => Self::Dispatched,
            3 => Self::Writing,
            _ => Self::Finishing,
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// Any active state may jump to `Finishing` so a conversation can be
    /// abandoned after a transport failure.
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Accepting, Self::Reading)
                | (Self::Reading, Self::Dispatched)
                | (Self::Dispatched, Self::Reading)
                | (Self::Dispatched, Self::Writing)
                | (Self::Writing, Self::Writing)
                | (Self::Accepting, Self::Finishing)
                | (Self::Reading, Self::Finishing)
                | (Self::Dispatched, Self::Finishing)
                | (Self::Writing, Self::Finishing)
                | (Self::Finishing, Self::Accepting)
        )
    }
}

/// Reusable request/response buffers owned by a slot.
#[derive(Default)]
struct Buffers {
    request: CompileRequest,
    response: CompileResponse,
}

impl Buffers {
    fn clear(&mut self) {
        self.request = CompileRequest::default();
        self.response.reset();
    }
}

/// Per-conversation state bound to a slot when a client's RPC is accepted.
pub(crate) struct ConversationContext {
    inbound: Inbound,
    outbound: Outbound,
    accepted_at: Instant,
}

impl ConversationContext {
    pub(crate) fn new(inbound: Inbound, outbound: Outbound) -> Self {
        Self {
            inbound,
            outbound,
            accepted_at: Instant::now(),
        }
    }
}

/// Queue of slots ready to accept a conversation.
///
/// Every slot in `Accepting` has exactly one tag in the queue; the queue's
/// capacity equals the pool size so posting never blocks.
pub(crate) struct AcceptQueue {
    tx: mpsc::Sender<SlotTag>,
    rx: tokio::sync::Mutex<mpsc::Receiver<SlotTag>>,
    pending: AtomicUsize,
}

impl AcceptQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            pending: AtomicUsize::new(0),
        }
    }

    /// Posts an accept for `tag`.
    pub(crate) fn post(&self, tag: SlotTag) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(tag).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            Error::ChannelError {
                context: format!("Failed to re-arm {tag}: {e}"),
            }
        })
    }

    /// Waits for the next slot to become available. Waiting callers are
    /// served in arrival order.
    pub(crate) async fn claim(&self) -> Result<SlotTag> {
        let mut rx = self.rx.lock().await;
        let tag = rx.recv().await.ok_or_else(|| Error::ChannelError {
            context: "Accept queue closed".to_string(),
        })?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Ok(tag)
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// One fixed position in the stream pool.
pub struct StreamSlot {
    tag: SlotTag,
    state: AtomicU8,
    context: Mutex<Option<ConversationContext>>,
    buffers: Mutex<Buffers>,
    completed: AtomicU64,
    accepts: Arc<AcceptQueue>,
}

impl StreamSlot {
    pub(crate) fn new(tag: SlotTag, accepts: Arc<AcceptQueue>) -> Self {
        Self {
            tag,
            state: AtomicU8::new(SlotState::Accepting as u8),
            context: Mutex::new(None),
            buffers: Mutex::new(Buffers::default()),
            completed: AtomicU64::new(0),
            accepts,
        }
    }

    pub const fn tag(&self) -> SlotTag {
        self.tag
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of conversations this slot has closed since startup.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    fn transition(&self, next: SlotState) {
        let prev = SlotState::from_u8(self.state.swap(next as u8, Ordering::AcqRel));
        debug_assert!(
            prev.can_advance_to(next),
            "{}: illegal transition {prev:?} -> {next:?}",
            self.tag
        );
        tracing::trace!(slot = self.tag.index(), ?prev, ?next, "slot transition");
    }

    /// Posts this slot's first accept.
    pub(crate) fn arm(&self) -> Result<()> {
        self.accepts.post(self.tag)
    }

    /// Binds an accepted RPC to the slot.
    pub(crate) fn install(&self, context: ConversationContext) {
        let prev = self.context.lock().replace(context);
        debug_assert!(prev.is_none(), "{}: accepted while occupied", self.tag);
    }

    /// Hands the accepted conversation to its new owner.
    ///
    /// Returns `None` if no conversation is waiting on this slot.
    pub fn take_conversation(self: &Arc<Self>) -> Option<Conversation> {
        let context = self.context.lock().take()?;
        let buffers = mem::take(&mut *self.buffers.lock());
        Some(Conversation {
            slot: Arc::clone(self),
            context: Some(context),
            buffers,
        })
    }

    /// Returns cleared buffers to the slot and posts the next accept.
    fn rearm(&self, mut buffers: Buffers) {
        buffers.clear();
        *self.buffers.lock() = buffers;
        self.completed.fetch_add(1, Ordering::AcqRel);
        self.transition(SlotState::Accepting);

        if let Err(e) = self.accepts.post(self.tag) {
            tracing::error!(slot = self.tag.index(), "{e}");
        }
    }
}

impl fmt::Debug for StreamSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSlot")
            .field("tag", &self.tag)
            .field("state", &self.state())
            .field("completed", &self.completed())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to one active conversation.
///
/// Dropping a `Conversation` that has not been finished abandons it: the
/// client receives an `ABORTED` status and the slot is re-armed.
pub struct Conversation {
    slot: Arc<StreamSlot>,
    context: Option<ConversationContext>,
    buffers: Buffers,
}

impl Conversation {
    pub fn tag(&self) -> SlotTag {
        self.slot.tag
    }

    /// Reads the client's next request into the slot's request buffer.
    ///
    /// # Errors
    ///
    /// - [`Error::StreamClosed`] if the client half-closed without sending.
    /// - [`Error::Transport`] if the stream failed.
    pub async fn read(&mut self) -> Result<&CompileRequest> {
        self.slot.transition(SlotState::Reading);
        let context = self.context.as_mut().ok_or(Error::StreamClosed)?;

        match context.inbound.next().await {
            Some(Ok(request)) => {
                self.buffers.request = request;
                self.slot.transition(SlotState::Dispatched);
                Ok(&self.buffers.request)
            }
            Some(Err(status)) => Err(status.into()),
            None => Err(Error::StreamClosed),
        }
    }

    /// The most recently read request.
    pub fn request(&self) -> &CompileRequest {
        &self.buffers.request
    }

    /// The response that the next [`write`](Self::write) will send.
    pub fn response(&self) -> &CompileResponse {
        &self.buffers.response
    }

    pub fn response_mut(&mut self) -> &mut CompileResponse {
        &mut self.buffers.response
    }

    /// Sends the response buffer to the client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the client's stream is gone.
    pub async fn write(&mut self) -> Result<()> {
        self.slot.transition(SlotState::Writing);
        let outbound = &self.context.as_ref().ok_or(Error::StreamClosed)?.outbound;

        outbound
            .send(Ok(self.buffers.response.clone()))
            .await
            .map_err(|e| Error::ChannelError {
                context: format!("Failed to write response on {}: {e}", self.slot.tag),
            })
    }

    /// Closes the conversation with an OK status and re-arms the slot.
    pub fn finish(mut self) {
        self.close(None);
    }

    /// Closes the conversation without a response, reporting `status` to the
    /// client if it is still listening, and re-arms the slot.
    pub fn abandon(mut self, status: Status) {
        self.close(Some(status));
    }

    /// Sets the response code (and artifact), writes it once and finishes.
    ///
    /// The slot is finished even if the write fails.
    ///
    /// # Errors
    ///
    /// Returns the write error, if any.
    pub async fn respond_and_close(
        mut self,
        code: CompilationCode,
        artifact: Option<Bytes>,
    ) -> Result<()> {
        let response = self.response_mut();
        response.set_code(code);
        if let Some(artifact) = artifact {
            response.artifact = artifact;
        }

        let written = self.write().await;
        self.finish();
        written
    }

    fn close(&mut self, status: Option<Status>) {
        let Some(context) = self.context.take() else {
            return;
        };
        self.slot.transition(SlotState::Finishing);

        if let Some(status) = status {
            // Best effort: the client may already be gone.
            let _ = context.outbound.try_send(Err(status));
        }

        let elapsed = context.accepted_at.elapsed();
        drop(context);

        self.slot.rearm(mem::take(&mut self.buffers));
        decrement_conversations_inflight();
        record_conversation_duration(elapsed.as_secs_f64() * 1000.0);
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        if self.context.is_some() {
            tracing::warn!(
                slot = self.slot.tag.index(),
                "conversation dropped without finishing"
            );
            self.close(Some(Status::aborted("Conversation abandoned by server")));
        }
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("slot", &self.slot.tag)
            .field("request", &self.buffers.request)
            .finish_non_exhaustive()
    }
}
