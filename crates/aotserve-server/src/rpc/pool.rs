//! Fixed-size pool of stream slots.
//!
//! The pool owns `N` [`StreamSlot`]s for the lifetime of the process and
//! never grows or shrinks. At startup every slot posts one accept, so a fresh
//! pool has exactly `N` pending accepts. An incoming RPC claims one of them in
//! [`StreamPool::accept`], binds its streams to the slot, and posts the slot's
//! tag on the notification channel for the dispatch loop.

use super::slot::{AcceptQueue, ConversationContext, Inbound, Outbound, SlotState, SlotTag, StreamSlot};
use crate::telemetry::increment_conversations_inflight;
use aotserve_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Receiving end of the notification channel.
///
/// There is exactly one of these per pool and it is owned by the dispatch
/// loop.
pub type Notifications = mpsc::UnboundedReceiver<SlotTag>;

/// A fixed collection of [`StreamSlot`]s addressed by [`SlotTag`].
pub struct StreamPool {
    slots: Vec<Arc<StreamSlot>>,
    accepts: Arc<AcceptQueue>,
    notify: mpsc::UnboundedSender<SlotTag>,
    shutdown: CancellationToken,
}

impl StreamPool {
    /// Creates `size` slots and posts one accept for each.
    ///
    /// Returns the pool together with the receiving end of its notification
    /// channel. The channel is unbounded in type only: each slot posts at most
    /// one notification per conversation, so it never holds more than `size`
    /// tags.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn initialize(size: usize, shutdown: CancellationToken) -> (Arc<Self>, Notifications) {
        assert!(size > 0, "stream pool size must be greater than 0");

        let accepts = Arc::new(AcceptQueue::new(size));
        let (notify, notifications) = mpsc::unbounded_channel();

        let slots: Vec<_> = (0..size)
            .map(|index| Arc::new(StreamSlot::new(SlotTag::new(index), Arc::clone(&accepts))))
            .collect();

        for slot in &slots {
            // The queue has room for every slot, so the first post cannot fail.
            if let Err(e) = slot.arm() {
                tracing::error!(slot = slot.tag().index(), "{e}");
            }
        }

        tracing::debug!(size, "stream pool initialized");

        let pool = Self {
            slots,
            accepts,
            notify,
            shutdown,
        };
        (Arc::new(pool), notifications)
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently waiting for a client.
    pub fn pending_accepts(&self) -> usize {
        self.accepts.pending()
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        self.slots.iter().map(|slot| slot.state()).collect()
    }

    /// Resolves a notification tag to its slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTag`] if the tag is out of range.
    pub fn resolve(&self, tag: SlotTag) -> Result<&Arc<StreamSlot>> {
        self.slots.get(tag.index()).ok_or(Error::UnknownTag {
            tag: tag.index(),
            pool_size: self.slots.len(),
        })
    }

    /// Binds a newly opened RPC to the next free slot and notifies the
    /// dispatch loop.
    ///
    /// Waits while every slot is busy. Everything after the slot is claimed
    /// runs without suspending, so dropping this future never strands a slot.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once the pool's shutdown token is
    ///   cancelled.
    /// - [`Error::ChannelError`] if the dispatch loop is gone.
    pub async fn accept(&self, inbound: Inbound, outbound: Outbound) -> Result<SlotTag> {
        let tag = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Err(Error::ServiceShutdown),
            tag = self.accepts.claim() => tag?,
        };

        if self.shutdown.is_cancelled() {
            self.accepts.post(tag)?;
            return Err(Error::ServiceShutdown);
        }

        let slot = self.resolve(tag)?;
        slot.install(ConversationContext::new(inbound, outbound));
        increment_conversations_inflight();

        if let Err(e) = self.notify.send(tag) {
            // Dropping the conversation closes it and re-arms the slot.
            drop(slot.take_conversation());
            return Err(Error::ChannelError {
                context: format!("Failed to notify dispatch loop: {e}"),
            });
        }

        // The loop may have drained the pool between the check above and the
        // install; if so nobody else will take this conversation.
        if self.shutdown.is_cancelled() {
            if let Some(conversation) = slot.take_conversation() {
                conversation.abandon(Error::ServiceShutdown.into());
                return Err(Error::ServiceShutdown);
            }
        }

        tracing::debug!(slot = tag.index(), "conversation accepted");
        Ok(tag)
    }

    /// Abandons every accepted conversation that has not been dispatched.
    ///
    /// Called by the dispatch loop when it stops, so clients waiting on an
    /// accepted stream see `UNAVAILABLE` rather than hanging.
    pub(crate) fn drain_undispatched(&self) -> usize {
        let mut drained = 0;
        for slot in &self.slots {
            if let Some(conversation) = slot.take_conversation() {
                conversation.abandon(Error::ServiceShutdown.into());
                drained += 1;
            }
        }
        drained
    }
}
