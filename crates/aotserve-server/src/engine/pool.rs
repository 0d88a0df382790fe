//! Asynchronous worker pool for queued compilations.
//!
//! This module defines the [`WorkerPool`] struct, which owns the bounded
//! queues of the engine's worker tasks. Plans are assigned to workers
//! round-robin when they are created, and submissions never wait: a full
//! queue is reported back immediately so the dispatch loop is not blocked.
//! Shutdown is coordinated through a shared [`CancellationToken`].

use super::request::{CompilePlan, WorkRequest};
use crate::collab::CompletionHandle;
use aotserve_core::Error;
use core::time::Duration;
use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// A cooperative pool of asynchronous workers that process [`WorkRequest`]s.
pub struct WorkerPool {
    workers: Vec<mpsc::Sender<WorkRequest>>,
    next_worker: AtomicUsize,
    jobs_inflight: Arc<AtomicUsize>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Constructs a new [`WorkerPool`] from initialized worker channels and a
    /// shared cancellation token.
    ///
    /// `jobs_inflight` is shared with the workers, which decrement it once a
    /// compilation has been answered.
    pub const fn new(
        workers: Vec<mpsc::Sender<WorkRequest>>,
        jobs_inflight: Arc<AtomicUsize>,
        shutdown_token: CancellationToken,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            workers,
            next_worker: AtomicUsize::new(0),
            jobs_inflight,
            shutdown_token,
            shutdown_timeout,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Returns the index of the next worker to receive work (round-robin).
    ///
    /// Uses a relaxed atomic increment to minimize contention.
    pub fn next_worker_index(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Compilations submitted and not yet answered.
    pub fn jobs_inflight(&self) -> usize {
        self.jobs_inflight.load(Ordering::Acquire)
    }

    /// Enqueues a compilation on the worker chosen by its plan, without
    /// waiting.
    ///
    /// # Errors
    ///
    /// Hands the completion back if the pool is shutting down or the worker's
    /// queue is full or closed.
    pub fn try_submit(
        &self,
        plan: CompilePlan,
        completion: CompletionHandle,
    ) -> Result<(), CompletionHandle> {
        if self.shutdown_token.is_cancelled() {
            return Err(completion);
        }

        let worker_idx = plan.worker % self.workers.len();
        self.jobs_inflight.fetch_add(1, Ordering::AcqRel);

        let request = WorkRequest::Compile { plan, completion };
        match self.workers[worker_idx].try_send(request) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.jobs_inflight.fetch_sub(1, Ordering::AcqRel);
                let request = match e {
                    mpsc::error::TrySendError::Full(request) => {
                        tracing::debug!("Worker {worker_idx} queue is full");
                        request
                    }
                    mpsc::error::TrySendError::Closed(request) => {
                        tracing::warn!("Worker {worker_idx} channel closed");
                        request
                    }
                };
                match request {
                    WorkRequest::Compile { completion, .. } => Err(completion),
                    WorkRequest::Shutdown { .. } => {
                        unreachable!("only compile requests are submitted")
                    }
                }
            }
        }
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Cancels the shared [`CancellationToken`] so no new plans are created.
    /// - Waits up to the shutdown timeout for queued compilations to answer.
    /// - Sends a [`WorkRequest::Shutdown`] to each worker and waits (up to 3
    ///   seconds per worker) for acknowledgements. A worker whose queue is
    ///   still full after the shutdown timeout is left to finish on its own.
    ///
    /// Compilations still queued when a worker stops are dropped, which
    /// abandons their conversations.
    pub async fn shutdown(&self) -> Result<(), Error> {
        // === Phase 0: Stop accepting new compilations ===
        tracing::info!("Refusing new compilations");
        self.shutdown_token.cancel();

        // === Phase 1: Wait for queued compilations to drain ===
        tracing::info!("Draining queued compilations ({} active)", self.jobs_inflight());
        let drain_result = timeout(self.shutdown_timeout, async {
            while self.jobs_inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drain_result {
            Ok(()) => {
                tracing::debug!("All queued compilations drained successfully");
            }
            Err(_) => {
                tracing::warn!(
                    "Graceful drain timed out ({} compilations still active)",
                    self.jobs_inflight()
                );
            }
        }

        // === Phase 2: Notify workers to shut down ===
        tracing::debug!("Notifying all workers to shut down");
        let mut shutdown_handles = Vec::with_capacity(self.workers.len());

        for (i, worker) in self.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            let request = WorkRequest::Shutdown { response: tx };
            match timeout(self.shutdown_timeout, worker.send(request)).await {
                Ok(Ok(())) => shutdown_handles.push((i, rx)),
                Ok(Err(e)) => {
                    tracing::error!("Failed to send shutdown to worker {i}: {e}");
                }
                Err(_) => {
                    tracing::warn!("Worker {i} queue still full, not waiting for it to stop");
                }
            }
        }

        tracing::debug!("Waiting for up to 3s per worker for shutdown acknowledgements");

        let timeout_futures = shutdown_handles.into_iter().map(|(i, rx)| async move {
            match timeout(Duration::from_secs(3), rx).await {
                Ok(Ok(())) => {
                    tracing::trace!("Worker {i} shutdown acknowledged");
                }
                Ok(Err(e)) => {
                    tracing::error!("Worker {i} returned error: {e}");
                }
                Err(_) => {
                    tracing::warn!("Worker {i} shutdown timed out");
                }
            }
        });

        futures::future::join_all(timeout_futures).await;

        tracing::info!("Worker pool shutdown complete");

        Ok(())
    }
}
