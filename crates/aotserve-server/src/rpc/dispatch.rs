//! The single consumer of the notification channel.
//!
//! [`DispatchLoop::run`] pulls one slot tag at a time, resolves it to its
//! slot, takes the accepted [`Conversation`] and awaits the handler before
//! pulling the next tag. Handlers that need long-running work hand the
//! conversation to the compilation engine and return; the loop never finishes
//! or re-arms a slot on the handler's behalf.

use super::{
    pool::{Notifications, StreamPool},
    slot::Conversation,
};
use core::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub struct DispatchLoop {
    pool: Arc<StreamPool>,
    notifications: Notifications,
    shutdown: CancellationToken,
}

impl DispatchLoop {
    pub fn new(pool: Arc<StreamPool>, notifications: Notifications, shutdown: CancellationToken) -> Self {
        Self {
            pool,
            notifications,
            shutdown,
        }
    }

    /// Drives conversations until the channel closes or shutdown is
    /// requested.
    ///
    /// `handler` is invoked exactly once per accepted conversation, strictly
    /// serially. A handler still running when shutdown is requested is
    /// dropped, which abandons its conversation.
    pub async fn run<F, Fut>(mut self, mut handler: F)
    where
        F: FnMut(Conversation) -> Fut,
        Fut: Future<Output = ()>,
    {
        tracing::debug!(slots = self.pool.size(), "dispatch loop started");

        loop {
            let tag = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                tag = self.notifications.recv() => match tag {
                    Some(tag) => tag,
                    None => break,
                },
            };

            let slot = match self.pool.resolve(tag) {
                Ok(slot) => slot,
                Err(e) => {
                    tracing::error!("{e}");
                    continue;
                }
            };

            let Some(conversation) = slot.take_conversation() else {
                tracing::warn!(slot = tag.index(), "notification without a pending conversation");
                continue;
            };

            let span = tracing::info_span!("conversation", slot = tag.index());
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = handler(conversation).instrument(span) => {}
            }
        }

        let drained = self.pool.drain_undispatched();
        tracing::debug!(drained, "dispatch loop stopped");
    }
}
