use super::{backend::CompileBackend, request::WorkRequest};
use crate::telemetry::record_compile_duration;
use aotserve_core::proto::CompilationCode;
use core::time::Duration;
use portable_atomic::{AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio::{sync::mpsc, time::timeout};

/// Worker task responsible for processing [`WorkRequest`] messages.
///
/// The worker listens on an MPSC channel and compiles one method at a time
/// until a shutdown signal is received. Every compilation is answered through
/// its completion handle: `COMPILATION_SUCCESS` with the artifact, or
/// `COMPILATION_FAILURE` if the backend fails or exceeds `compile_timeout`.
///
/// # Arguments
///
/// - `worker_id`: Index of this worker (used for logs/tracing).
/// - `rx`: Receiver through which [`WorkRequest`]s are received.
/// - `backend`: The code generator shared by all workers.
/// - `compile_timeout`: Upper bound on a single backend invocation.
/// - `jobs_inflight`: Decremented after each compilation is answered.
pub async fn worker_loop<B: CompileBackend>(
    worker_id: usize,
    mut rx: mpsc::Receiver<WorkRequest>,
    backend: Arc<B>,
    compile_timeout: Duration,
    jobs_inflight: Arc<AtomicUsize>,
) {
    tracing::trace!("Worker {worker_id} started");

    while let Some(work) = rx.recv().await {
        match work {
            WorkRequest::Compile { plan, completion } => {
                let method = &plan.method.identity;
                let tag = completion.tag();
                let start = Instant::now();

                let (code, artifact) =
                    match timeout(compile_timeout, backend.compile(&plan.method)).await {
                        Ok(Ok(artifact)) => {
                            tracing::debug!(
                                "Worker {worker_id} compiled {method} for {tag} ({} bytes)",
                                artifact.len()
                            );
                            (CompilationCode::CompilationSuccess, Some(artifact))
                        }
                        Ok(Err(e)) => {
                            tracing::warn!("Worker {worker_id} failed to compile {method}: {e}");
                            (CompilationCode::CompilationFailure, None)
                        }
                        Err(_) => {
                            tracing::warn!(
                                "Worker {worker_id} timed out compiling {method} after {compile_timeout:?}"
                            );
                            (CompilationCode::CompilationFailure, None)
                        }
                    };
                record_compile_duration(start.elapsed().as_secs_f64() * 1000.0);

                if let Err(e) = completion.respond_and_close(code, artifact).await {
                    tracing::debug!("Worker {worker_id} could not answer {tag}: {e}");
                }
                jobs_inflight.fetch_sub(1, Ordering::AcqRel);
            }
            WorkRequest::Shutdown { response } => {
                tracing::debug!("Worker {worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    tracing::trace!("Worker {worker_id} stopped");
}
