use aotserve_core::{
    Error, Result,
    proto::{CompilationCode, CompileRequest, CompileResponse, compiler_client::CompilerClient},
};
use aotserve_server::{
    cache::ManifestCache,
    collab::MethodHandle,
    config::ServerConfig,
    engine::{CompileBackend, EngineConfig, WorkerEngine},
    server::serve_with_incoming,
};
use bytes::Bytes;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Code, transport::Channel};

const MANIFEST: &str = r#"{
    "classes": [
        {
            "name": "demo/Widget",
            "offset": 4096,
            "chain_offset": 8192,
            "loader_chain_offset": 12288,
            "methods": [
                { "name": "spin", "signature": "(I)V", "offset": 4160 },
                { "name": "size", "signature": "()I", "offset": 4224, "cached": true },
                { "name": "hash", "signature": "()I", "offset": 4288, "native": true },
                { "name": "fail", "signature": "()V", "offset": 4352 },
                { "name": "m0", "signature": "()V", "offset": 5000 },
                { "name": "m1", "signature": "()V", "offset": 5001 },
                { "name": "m2", "signature": "()V", "offset": 5002 },
                { "name": "m3", "signature": "()V", "offset": 5003 },
                { "name": "m4", "signature": "()V", "offset": 5004 },
                { "name": "m5", "signature": "()V", "offset": 5005 },
                { "name": "m6", "signature": "()V", "offset": 5006 },
                { "name": "m7", "signature": "()V", "offset": 5007 }
            ]
        }
    ]
}"#;

/// Produces the method's printable identity as its artifact.
struct NameBackend;

impl CompileBackend for NameBackend {
    async fn compile(&self, method: &MethodHandle) -> Result<Bytes> {
        if method.identity.method_name == "fail" {
            return Err(Error::Backend {
                reason: "code generation failed".into(),
            });
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(Bytes::from(method.identity.to_string()))
    }
}

struct TestServer {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
    engine: Arc<WorkerEngine>,
}

impl TestServer {
    async fn start(pool_size: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let incoming = TcpListenerStream::new(listener);

        let engine_config = EngineConfig {
            num_workers: 2,
            queue_depth: 32,
            compile_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(1),
        };
        let config = ServerConfig {
            server_addr: addr.to_string(),
            uds: false,
            pool_size,
            stream_buffer_size: 4,
            cache_manifest: None,
            compiler_cmd: PathBuf::from("unused"),
            compiler_args: Vec::new(),
            engine: engine_config.clone(),
        };

        let cache = Arc::new(ManifestCache::from_json(MANIFEST).unwrap());
        let engine = Arc::new(WorkerEngine::spawn(&engine_config, NameBackend));
        let (stop, stopped) = oneshot::channel::<()>();

        let handle = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move {
                serve_with_incoming(&config, cache, engine, incoming, async {
                    let _ = stopped.await;
                })
                .await
            }
        });

        Self {
            addr,
            stop,
            handle,
            engine,
        }
    }

    async fn client(&self) -> CompilerClient<Channel> {
        CompilerClient::connect(format!("http://{}", self.addr))
            .await
            .unwrap()
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap().unwrap();
        self.engine.shutdown().await.unwrap();
    }
}

fn request(method_offset: u64) -> CompileRequest {
    CompileRequest {
        class_offset: 4096,
        method_offset,
        class_chain_offset: 8192,
        class_chain_loader_offset: 12288,
    }
}

/// Sends one request and returns the single response, checking that the
/// stream then ends with an OK status.
async fn compile_once(client: &mut CompilerClient<Channel>, request: CompileRequest) -> CompileResponse {
    let mut responses = client
        .compile(tokio_stream::once(request))
        .await
        .unwrap()
        .into_inner();
    let response = responses.message().await.unwrap().unwrap();
    assert!(responses.message().await.unwrap().is_none());
    response
}

#[tokio::test]
async fn unknown_class_fails() {
    let server = TestServer::start(2).await;
    let mut client = server.client().await;

    let mut unknown = request(4160);
    unknown.class_offset = 1;
    let response = compile_once(&mut client, unknown).await;
    assert_eq!(response.code(), CompilationCode::CompilationFailure);
    assert!(response.artifact.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn cached_method_is_not_needed() {
    let server = TestServer::start(2).await;
    let mut client = server.client().await;

    let response = compile_once(&mut client, request(4224)).await;
    assert_eq!(response.code(), CompilationCode::CompilationNotNeeded);

    server.stop().await;
}

#[tokio::test]
async fn cached_method_ignores_chain_offsets() {
    let server = TestServer::start(2).await;
    let mut client = server.client().await;

    let mut stale_chain = request(4224);
    stale_chain.class_chain_offset = 1;
    let response = compile_once(&mut client, stale_chain).await;
    assert_eq!(response.code(), CompilationCode::CompilationNotNeeded);

    server.stop().await;
}

#[tokio::test]
async fn mismatched_chain_fails_uncached_method() {
    let server = TestServer::start(2).await;
    let mut client = server.client().await;

    let mut stale_loader = request(4160);
    stale_loader.class_chain_loader_offset = 1;
    let response = compile_once(&mut client, stale_loader).await;
    assert_eq!(response.code(), CompilationCode::CompilationFailure);

    server.stop().await;
}

#[tokio::test]
async fn native_method_fails() {
    let server = TestServer::start(2).await;
    let mut client = server.client().await;

    let response = compile_once(&mut client, request(4288)).await;
    assert_eq!(response.code(), CompilationCode::CompilationFailure);

    server.stop().await;
}

#[tokio::test]
async fn queued_compile_returns_artifact() {
    let server = TestServer::start(2).await;
    let mut client = server.client().await;

    let response = compile_once(&mut client, request(4160)).await;
    assert_eq!(response.code(), CompilationCode::CompilationSuccess);
    assert_eq!(&response.artifact[..], b"demo/Widget.spin(I)V");

    server.stop().await;
}

#[tokio::test]
async fn backend_failure_is_reported() {
    let server = TestServer::start(2).await;
    let mut client = server.client().await;

    let response = compile_once(&mut client, request(4352)).await;
    assert_eq!(response.code(), CompilationCode::CompilationFailure);

    server.stop().await;
}

#[tokio::test]
async fn more_clients_than_slots_are_all_answered() {
    let server = TestServer::start(2).await;

    let mut tasks = Vec::new();
    for i in 0..24_u64 {
        let mut client = server.client().await;
        tasks.push(tokio::spawn(async move {
            let method = i % 8;
            let response = compile_once(&mut client, request(5000 + method)).await;
            (method, response)
        }));
    }

    for task in tasks {
        let (method, response) = task.await.unwrap();
        assert_eq!(response.code(), CompilationCode::CompilationSuccess);
        assert_eq!(
            response.artifact,
            Bytes::from(format!("demo/Widget.m{method}()V"))
        );
    }

    server.stop().await;
}

#[tokio::test]
async fn client_closing_without_a_request_is_cancelled() {
    let server = TestServer::start(1).await;
    let mut client = server.client().await;

    let mut responses = client
        .compile(tokio_stream::empty::<CompileRequest>())
        .await
        .unwrap()
        .into_inner();
    let status = responses.message().await.unwrap_err();
    assert_eq!(status.code(), Code::Cancelled);

    // The only slot was re-armed.
    let response = compile_once(&mut client, request(4224)).await;
    assert_eq!(response.code(), CompilationCode::CompilationNotNeeded);

    server.stop().await;
}
