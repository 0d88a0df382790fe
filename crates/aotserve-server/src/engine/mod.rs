//! A reference [`CompilationEngine`] backed by a pool of tokio workers.
//!
//! Plans are spread round-robin over the workers. Each worker owns a bounded
//! queue; a submission that finds its worker's queue full is rejected with
//! `COMPILATION_FAILURE` rather than waited on, so the dispatch loop never
//! blocks on the engine.

pub mod backend;
pub mod pool;
pub mod request;
pub mod worker;

pub use backend::{CommandBackend, CompileBackend};
pub use pool::WorkerPool;
pub use request::{CompilePlan, WorkRequest};

use crate::collab::{CompilationEngine, CompletionHandle, MethodHandle, Rejected};
use aotserve_core::{Error, proto::CompilationCode};
use core::time::Duration;
use portable_atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use worker::worker_loop;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub num_workers: usize,
    /// Compilations a single worker may have queued.
    pub queue_depth: usize,
    pub compile_timeout: Duration,
    /// How long shutdown waits for queued compilations.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            queue_depth: 16,
            compile_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

pub struct WorkerEngine {
    pool: WorkerPool,
}

impl WorkerEngine {
    /// Spawns `config.num_workers` workers sharing `backend`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if `num_workers` or `queue_depth` is zero.
    pub fn spawn<B: CompileBackend>(config: &EngineConfig, backend: B) -> Self {
        assert!(config.num_workers > 0, "engine needs at least one worker");

        let backend = Arc::new(backend);
        let jobs_inflight = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(config.num_workers);

        for worker_id in 0..config.num_workers {
            let (tx, rx) = mpsc::channel(config.queue_depth);
            workers.push(tx);

            tokio::spawn(worker_loop(
                worker_id,
                rx,
                Arc::clone(&backend),
                config.compile_timeout,
                Arc::clone(&jobs_inflight),
            ));
        }

        Self {
            pool: WorkerPool::new(
                workers,
                jobs_inflight,
                CancellationToken::new(),
                config.shutdown_timeout,
            ),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Stops planning, waits for queued compilations and stops the workers.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.pool.shutdown().await
    }
}

impl CompilationEngine for WorkerEngine {
    type Plan = CompilePlan;

    fn create_plan(&self, method: &MethodHandle) -> Option<CompilePlan> {
        if self.pool.is_shutting_down() {
            return None;
        }
        Some(CompilePlan {
            method: method.clone(),
            worker: self.pool.next_worker_index(),
        })
    }

    fn submit_compile(
        &self,
        plan: CompilePlan,
        completion: CompletionHandle,
    ) -> Result<(), Rejected> {
        self.pool
            .try_submit(plan, completion)
            .map_err(|completion| Rejected {
                code: CompilationCode::CompilationFailure,
                completion,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collab::MethodIdentity,
        rpc::{
            self,
            testing::{ResponseRx, client, request},
        },
    };
    use aotserve_core::{Result, proto::CompileResponse, types::MethodOffsets};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Semaphore;

    /// Answers with the method index, optionally waiting on a gate first.
    struct ScriptedBackend {
        gate: Option<Arc<Semaphore>>,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedBackend {
        fn immediate() -> Self {
            Self {
                gate: None,
                calls: Arc::default(),
            }
        }

        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                calls: Arc::default(),
            }
        }
    }

    impl CompileBackend for ScriptedBackend {
        async fn compile(&self, method: &MethodHandle) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.map_err(|_| Error::ServiceShutdown)?;
            }
            match method.identity.method_name.as_str() {
                "broken" => Err(Error::Backend {
                    reason: "unsupported bytecode".into(),
                }),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Bytes::new())
                }
                _ => Ok(Bytes::from(method.index.to_be_bytes().to_vec())),
            }
        }
    }

    fn method(name: &str, index: u32) -> MethodHandle {
        MethodHandle {
            identity: MethodIdentity {
                offsets: MethodOffsets::default(),
                class_name: "demo/Widget".into(),
                method_name: name.into(),
                signature: "()V".into(),
            },
            index,
        }
    }

    /// Accepts one conversation, reads its request and hands it over as a
    /// completion handle.
    async fn completion() -> (CompletionHandle, ResponseRx, rpc::pool::Notifications, Arc<rpc::StreamPool>) {
        let (pool, mut notifications) = rpc::StreamPool::initialize(1, CancellationToken::new());
        let (inbound, outbound, requests, responses) = client();
        requests.send(Ok(request(1, 2))).await.unwrap();
        let tag = pool.accept(inbound, outbound).await.unwrap();
        assert_eq!(notifications.recv().await, Some(tag));
        let mut conversation = pool.resolve(tag).unwrap().take_conversation().unwrap();
        conversation.read().await.unwrap();
        (CompletionHandle::new(conversation), responses, notifications, pool)
    }

    async fn answer(responses: &mut ResponseRx) -> CompileResponse {
        responses.recv().await.unwrap().unwrap()
    }

    fn config(num_workers: usize, queue_depth: usize) -> EngineConfig {
        EngineConfig {
            num_workers,
            queue_depth,
            compile_timeout: Duration::from_millis(200),
            shutdown_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn plans_rotate_over_workers() {
        let engine = WorkerEngine::spawn(&config(3, 1), ScriptedBackend::immediate());
        let workers: Vec<_> = (0..6)
            .map(|i| engine.create_plan(&method("spin", i)).unwrap().worker)
            .collect();
        assert_eq!(workers, vec![0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test]
    async fn successful_compile_returns_artifact() {
        let engine = WorkerEngine::spawn(&config(1, 1), ScriptedBackend::immediate());
        let (handle, mut responses, _n, pool) = completion().await;

        let plan = engine.create_plan(&method("spin", 9)).unwrap();
        engine.submit_compile(plan, handle).unwrap();

        let response = answer(&mut responses).await;
        assert_eq!(response.code(), CompilationCode::CompilationSuccess);
        assert_eq!(&response.artifact[..], &9_u32.to_be_bytes());
        assert!(responses.recv().await.is_none());

        engine.shutdown().await.unwrap();
        assert_eq!(engine.pool().jobs_inflight(), 0);
        assert_eq!(pool.pending_accepts(), 1);
    }

    #[tokio::test]
    async fn backend_error_is_a_failure() {
        let engine = WorkerEngine::spawn(&config(1, 1), ScriptedBackend::immediate());
        let (handle, mut responses, _n, _pool) = completion().await;

        let plan = engine.create_plan(&method("broken", 0)).unwrap();
        engine.submit_compile(plan, handle).unwrap();

        let response = answer(&mut responses).await;
        assert_eq!(response.code(), CompilationCode::CompilationFailure);
        assert!(response.artifact.is_empty());
    }

    #[tokio::test]
    async fn compile_timeout_is_a_failure() {
        let engine = WorkerEngine::spawn(&config(1, 1), ScriptedBackend::immediate());
        let (handle, mut responses, _n, _pool) = completion().await;

        let plan = engine.create_plan(&method("slow", 0)).unwrap();
        engine.submit_compile(plan, handle).unwrap();

        assert_eq!(
            answer(&mut responses).await.code(),
            CompilationCode::CompilationFailure
        );
    }

    #[tokio::test]
    async fn full_queue_rejects_and_returns_handle() {
        let gate = Arc::new(Semaphore::new(0));
        let backend = ScriptedBackend::gated(Arc::clone(&gate));
        let calls = Arc::clone(&backend.calls);
        let engine = WorkerEngine::spawn(&config(1, 1), backend);

        // First job occupies the worker, second fills the queue.
        let (first, mut first_rx, _n1, _p1) = completion().await;
        engine
            .submit_compile(engine.create_plan(&method("spin", 1)).unwrap(), first)
            .unwrap();
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let (second, mut second_rx, _n2, _p2) = completion().await;
        engine
            .submit_compile(engine.create_plan(&method("spin", 2)).unwrap(), second)
            .unwrap();

        let (third, mut third_rx, _n3, _p3) = completion().await;
        let rejected = engine
            .submit_compile(engine.create_plan(&method("spin", 3)).unwrap(), third)
            .unwrap_err();
        assert_eq!(rejected.code, CompilationCode::CompilationFailure);
        rejected
            .completion
            .respond_and_close(rejected.code, None)
            .await
            .unwrap();
        assert_eq!(
            answer(&mut third_rx).await.code(),
            CompilationCode::CompilationFailure
        );

        gate.add_permits(2);
        assert_eq!(
            answer(&mut first_rx).await.code(),
            CompilationCode::CompilationSuccess
        );
        assert_eq!(
            answer(&mut second_rx).await.code(),
            CompilationCode::CompilationSuccess
        );
    }

    #[tokio::test]
    async fn no_plans_after_shutdown() {
        let engine = WorkerEngine::spawn(&config(2, 1), ScriptedBackend::immediate());
        assert!(engine.create_plan(&method("spin", 0)).is_some());

        engine.shutdown().await.unwrap();
        assert!(engine.pool().is_shutting_down());
        assert!(engine.create_plan(&method("spin", 0)).is_none());
    }

    #[tokio::test]
    async fn shutdown_is_bounded_when_a_stuck_worker_has_a_full_queue() {
        let gate = Arc::new(Semaphore::new(0));
        let backend = ScriptedBackend::gated(Arc::clone(&gate));
        let calls = Arc::clone(&backend.calls);
        let engine = WorkerEngine::spawn(
            &EngineConfig {
                num_workers: 1,
                queue_depth: 1,
                compile_timeout: Duration::from_secs(3600),
                shutdown_timeout: Duration::from_millis(100),
            },
            backend,
        );

        let (running, _running_rx, _n1, _p1) = completion().await;
        engine
            .submit_compile(engine.create_plan(&method("spin", 1)).unwrap(), running)
            .unwrap();
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let (queued, _queued_rx, _n2, _p2) = completion().await;
        engine
            .submit_compile(engine.create_plan(&method("spin", 2)).unwrap(), queued)
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), engine.shutdown())
            .await
            .expect("shutdown waited on a full worker queue")
            .unwrap();
        gate.close();
    }

    #[tokio::test]
    async fn shutdown_waits_for_queued_compiles() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = Arc::new(WorkerEngine::spawn(
            &config(1, 2),
            ScriptedBackend::gated(Arc::clone(&gate)),
        ));
        let (handle, mut responses, _n, _pool) = completion().await;
        engine
            .submit_compile(engine.create_plan(&method("spin", 4)).unwrap(), handle)
            .unwrap();

        let shutdown = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.shutdown().await }
        });
        gate.add_permits(1);

        assert_eq!(
            answer(&mut responses).await.code(),
            CompilationCode::CompilationSuccess
        );
        shutdown.await.unwrap().unwrap();
        assert_eq!(engine.pool().jobs_inflight(), 0);
    }
}
