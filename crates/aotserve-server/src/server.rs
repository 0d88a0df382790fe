//! Wires the stream pool, dispatch loop and compile handler into a tonic
//! server.
//!
//! Shutdown runs in this order once `signal` resolves:
//!
//! 1. the health service reports `NOT_SERVING`;
//! 2. the pool stops accepting and the dispatch loop stops, abandoning
//!    conversations that were accepted but never dispatched;
//! 3. tonic waits for the remaining streams, so compilations already handed
//!    to the engine still answer their clients.
//!
//! Stopping the engine and flushing telemetry is left to the caller, after
//! [`serve_with_incoming`] returns.

use crate::{
    collab::{CompilationEngine, SharedCache},
    config::ServerConfig,
    handler::CompileHandler,
    rpc::{self, CompileService},
};
use aotserve_core::proto::{FILE_DESCRIPTOR_SET, compiler_server::CompilerServer};
use core::future::Future;
use futures::Stream;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tonic::{
    codec::CompressionEncoding,
    transport::{Server, server::Connected},
};
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;

pub fn build_compile_service(service: CompileService) -> CompilerServer<CompileService> {
    CompilerServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

/// Serves compile conversations on `incoming` until `signal` resolves and all
/// streams have closed.
///
/// # Errors
///
/// Returns an error if reflection cannot be built or the transport fails.
pub async fn serve_with_incoming<C, E, I, IO, IE, S>(
    config: &ServerConfig,
    cache: Arc<C>,
    engine: Arc<E>,
    incoming: I,
    signal: S,
) -> anyhow::Result<()>
where
    C: SharedCache,
    E: CompilationEngine,
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
    S: Future<Output = ()>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<CompilerServer<CompileService>>()
        .await;

    let shutdown = CancellationToken::new();
    let (pool, dispatch) = rpc::bind(config.pool_size, shutdown.clone());

    let handler = CompileHandler::new(cache, engine);
    let dispatch_task = tokio::spawn(dispatch.run(move |conversation| {
        let handler = handler.clone();
        async move {
            if let Err(e) = handler.compile(conversation).await {
                tracing::debug!("Conversation ended early: {e}");
            }
        }
    }));

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let service = CompileService::new(pool, config.stream_buffer_size);

    Server::builder()
        .http2_adaptive_window(Some(true))
        .add_service(health_service)
        .add_service(reflection)
        .add_service(build_compile_service(service))
        .serve_with_incoming_shutdown(
            incoming,
            shutdown_signal(signal, health_reporter, shutdown.clone()),
        )
        .await?;

    // The transport can also stop on its own; make sure the loop follows.
    shutdown.cancel();
    if let Err(e) = dispatch_task.await {
        tracing::error!("Dispatch loop panicked: {e}");
    }

    tracing::info!("Compile service stopped");
    Ok(())
}

async fn shutdown_signal<S: Future<Output = ()>>(
    signal: S,
    health_reporter: HealthReporter,
    shutdown: CancellationToken,
) {
    signal.await;
    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Publish the status
    health_reporter
        .set_not_serving::<CompilerServer<CompileService>>()
        .await;

    // 2. Stop accepting and dispatching
    shutdown.cancel();
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
///
/// If a signal handler cannot be installed the error is logged and that
/// signal is ignored.
pub async fn termination_signal() {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                core::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = core::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            core::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
