use crate::engine::EngineConfig;
use anyhow::bail;
use aotserve_core::types::{DEFAULT_POOL_SIZE, DEFAULT_SERVER_ADDR};
use clap::Parser;
use core::time::Duration;
use std::path::PathBuf;

/// Runtime configuration for the `aotserve-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is honored), with defaults suitable for a single JVM host.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "aotserve-server",
    version,
    about = "A gRPC server for remote ahead-of-time compile requests"
)]
pub struct CliArgs {
    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:38400" or "/tmp/aotserve.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from(DEFAULT_SERVER_ADDR))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Number of stream slots, i.e. conversations the server accepts at once.
    ///
    /// Further clients are queued by the transport until a slot is re-armed.
    ///
    /// Environment variable: `POOL_SIZE`
    #[arg(long, env = "POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE)]
    pub pool_size: usize,

    /// Number of compilation worker tasks.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 2)]
    pub num_workers: usize,

    /// Compilations each worker may have queued before new submissions are
    /// rejected with `COMPILATION_FAILURE`.
    ///
    /// Environment variable: `QUEUE_DEPTH`
    #[arg(long, env = "QUEUE_DEPTH", default_value_t = 16)]
    pub queue_depth: usize,

    /// Capacity of the response buffer of each client stream.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 4)]
    pub stream_buffer_size: usize,

    /// JSON manifest describing the shared class cache. Without one, every
    /// request fails to resolve.
    ///
    /// Environment variable: `CACHE_MANIFEST`
    #[arg(long, env = "CACHE_MANIFEST")]
    pub cache_manifest: Option<PathBuf>,

    /// External compiler program. It receives the class name, method name,
    /// signature and method index as arguments and writes the artifact to
    /// stdout.
    ///
    /// Environment variable: `COMPILER_CMD`
    #[arg(long, env = "COMPILER_CMD", default_value = "aot-compile")]
    pub compiler_cmd: PathBuf,

    /// Extra arguments passed to the compiler before the method identity.
    ///
    /// Environment variable: `COMPILER_ARGS` (space separated)
    #[arg(
        long,
        env = "COMPILER_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub compiler_args: Vec<String>,

    /// Upper bound, in seconds, on a single compilation.
    ///
    /// Environment variable: `COMPILE_TIMEOUT_SECS`
    #[arg(long, env = "COMPILE_TIMEOUT_SECS", default_value_t = 60)]
    pub compile_timeout_secs: u64,

    /// Seconds to wait for queued compilations on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub uds: bool,
    pub pool_size: usize,
    pub stream_buffer_size: usize,
    pub cache_manifest: Option<PathBuf>,
    pub compiler_cmd: PathBuf,
    pub compiler_args: Vec<String>,
    pub engine: EngineConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.pool_size == 0 {
            bail!("POOL_SIZE must be greater than 0");
        }

        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.queue_depth == 0 {
            bail!("QUEUE_DEPTH must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        if args.compile_timeout_secs == 0 {
            bail!("COMPILE_TIMEOUT_SECS must be greater than 0");
        }

        Ok(Self {
            server_addr: args.server_addr,
            uds: args.uds,
            pool_size: args.pool_size,
            stream_buffer_size: args.stream_buffer_size,
            cache_manifest: args.cache_manifest,
            compiler_cmd: args.compiler_cmd,
            compiler_args: args.compiler_args,
            engine: EngineConfig {
                num_workers: args.num_workers,
                queue_depth: args.queue_depth,
                compile_timeout: Duration::from_secs(args.compile_timeout_secs),
                shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            },
        })
    }
}
