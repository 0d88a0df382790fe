use aotserve_server::{
    cache::ManifestCache,
    config::{CliArgs, ServerConfig},
    engine::{CommandBackend, WorkerEngine},
    server::{serve_with_incoming, termination_signal},
    telemetry::{TelemetryProviders, init_telemetry},
};
use clap::Parser;
use futures::Stream;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Connected;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    if config.uds {
        #[cfg(unix)]
        {
            use tokio::net::UnixListener;
            use tokio_stream::wrappers::UnixListenerStream;
            let uds_path = config.server_addr.clone();
            let uds = UnixListener::bind(&uds_path)?;
            let incoming = UnixListenerStream::new(uds);
            log_startup_info(&uds_path, &config);
            let res = run_server_with_incoming(providers, incoming, config).await;
            let _ = std::fs::remove_file(&uds_path);
            res
        }
        #[cfg(not(unix))]
        {
            anyhow::bail!("Unix domain sockets are not supported on this platform");
        }
    } else {
        let tcp_path = config.server_addr.clone();
        let tcp = TcpListener::bind(&tcp_path).await?;
        let incoming = TcpListenerStream::new(tcp);
        log_startup_info(&tcp_path, &config);
        run_server_with_incoming(providers, incoming, config).await
    }
}

async fn run_server_with_incoming<I, IO, IE>(
    providers: TelemetryProviders,
    incoming: I,
    config: ServerConfig,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    let cache = match &config.cache_manifest {
        Some(path) => {
            let cache = ManifestCache::from_path(path)?;
            tracing::info!(
                "Loaded cache manifest {} ({} classes, {} methods)",
                path.display(),
                cache.class_count(),
                cache.method_count()
            );
            cache
        }
        None => {
            tracing::warn!("No CACHE_MANIFEST configured; every request will fail to resolve");
            ManifestCache::empty()
        }
    };

    let backend = CommandBackend::new(&config.compiler_cmd, config.compiler_args.clone());
    let engine = Arc::new(WorkerEngine::spawn(&config.engine, backend));

    let served = serve_with_incoming(
        &config,
        Arc::new(cache),
        Arc::clone(&engine),
        incoming,
        termination_signal(),
    )
    .await;

    if let Err(e) = engine.shutdown().await {
        tracing::error!("Error during engine shutdown: {e:?}");
    }
    providers.shutdown();

    served?;
    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(addr: &str, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting compile service on {} with full config: {:#?}",
            addr,
            config
        );
    } else {
        tracing::info!(
            "Starting compile service on {} with {} slots and {} workers",
            addr,
            config.pool_size,
            config.engine.num_workers
        );
    }
}
