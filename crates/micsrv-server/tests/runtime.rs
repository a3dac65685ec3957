use axum::{Json, Router, routing::post};
use core::{convert::Infallible, time::Duration};
use micsrv_core::{
    micsrv_id::SnowflakeId,
    proto::{
        AllocateManyRequest, AllocateOneRequest, HealthRequest, HealthResponse,
        core_service_client::CoreServiceClient,
    },
    types::new_allocator,
};
use micsrv_registry::{RegistryClient, RegistryConfig, RegistryError};
use micsrv_server::server::{
    config::RuntimeConfig,
    error::RuntimeError,
    runtime::{BoundRuntime, RuntimeHandle, RuntimeState, ServiceRuntime},
};
use serde_json::{Value, json};
use std::{
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tonic::{
    Code, Request,
    body::Body,
    codegen::{BoxFuture, http, http::uri::PathAndQuery},
    server::NamedService,
    transport::Channel,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// A service whose every call panics.
#[derive(Clone)]
struct Faulty;

impl NamedService for Faulty {
    const NAME: &'static str = "test.Faulty";
}

impl tower::Service<http::Request<Body>> for Faulty {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: http::Request<Body>) -> Self::Future {
        Box::pin(async move {
            let empty: Vec<u64> = Vec::new();
            let _first = empty[0];
            Ok(http::Response::new(Body::default()))
        })
    }
}

/// A server-streaming service whose response stream panics when first polled.
#[derive(Clone)]
struct Streamy;

impl NamedService for Streamy {
    const NAME: &'static str = "test.Streamy";
}

struct PanickingStream;

impl http_body::Body for PanickingStream {
    type Data = tonic::codegen::Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        panic!("watch source dropped");
    }
}

impl tower::Service<http::Request<Body>> for Streamy {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: http::Request<Body>) -> Self::Future {
        Box::pin(async move {
            let mut response = http::Response::new(Body::new(PanickingStream));
            response.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/grpc"),
            );
            Ok(response)
        })
    }
}

#[derive(Clone, Default)]
struct Recorded {
    registers: Arc<Mutex<Vec<Value>>>,
    unregisters: Arc<Mutex<Vec<Value>>>,
}

async fn spawn_registry(register_reply: Value) -> (SocketAddr, Recorded, JoinHandle<()>) {
    let recorded = Recorded::default();
    let router = Router::new()
        .route(
            "/micsrv/register",
            post({
                let recorded = recorded.clone();
                move |Json(body): Json<Value>| async move {
                    recorded.registers.lock().unwrap().push(body);
                    Json(register_reply)
                }
            }),
        )
        .route(
            "/micsrv/unregister",
            post({
                let recorded = recorded.clone();
                move |Json(body): Json<Value>| async move {
                    recorded.unregisters.lock().unwrap().push(body);
                    Json(json!({"code": 0}))
                }
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, recorded, handle)
}

fn runtime_config(delay: Duration) -> RuntimeConfig {
    RuntimeConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        service_name: "svc-a".to_string(),
        service_version: "1.2.0".to_string(),
        advertise_host: None,
        max_ids_per_request: 1_000,
        registration_delay: delay,
        drain_timeout: Some(Duration::from_secs(5)),
    }
}

fn registry_client(addr: SocketAddr) -> Arc<RegistryClient> {
    let cache = std::env::temp_dir().join("micsrv-runtime-tests");
    let config = RegistryConfig::new(addr.to_string(), "s3cret").with_cache_dir(cache);
    Arc::new(RegistryClient::new(config).unwrap())
}

async fn bind(runtime: ServiceRuntime) -> BoundRuntime {
    runtime.bind().await.unwrap()
}

/// Runs `bound` in the background until the returned sender fires.
fn spawn_serve(
    bound: BoundRuntime,
) -> (
    RuntimeHandle,
    oneshot::Sender<()>,
    JoinHandle<Result<(), RuntimeError>>,
) {
    let handle = bound.handle();
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(bound.serve_with_shutdown(async move {
        let _ = rx.await;
    }));
    (handle, tx, task)
}

async fn connect(addr: SocketAddr) -> Channel {
    Channel::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

async fn finish(task: JoinHandle<Result<(), RuntimeError>>) -> Result<(), RuntimeError> {
    tokio::time::timeout(TIMEOUT, task)
        .await
        .expect("runtime did not stop in time")
        .unwrap()
}

#[tokio::test]
async fn bind_failure_is_reported() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = RuntimeConfig {
        listen_addr: taken.local_addr().unwrap().to_string(),
        ..runtime_config(Duration::ZERO)
    };

    let err = ServiceRuntime::new(config, Arc::new(new_allocator(1)))
        .bind()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RuntimeError::Bind { .. }), "{err:?}");
}

#[tokio::test]
async fn registers_after_delay_and_unregisters_on_request() {
    let (registry_addr, recorded, registry) =
        spawn_registry(json!({"code": 0, "srv": "10.0.0.5:9000"})).await;

    let runtime = ServiceRuntime::new(
        runtime_config(Duration::from_millis(50)),
        Arc::new(new_allocator(1)),
    )
    .with_registry(registry_client(registry_addr));
    assert_eq!(runtime.state(), RuntimeState::Created);

    let bound = bind(runtime).await;
    let port = bound.local_addr().port();
    assert_eq!(bound.advertised_address(), port.to_string());
    let (handle, stop, task) = spawn_serve(bound);
    assert_eq!(handle.state(), RuntimeState::Bound);

    let resolved = tokio::time::timeout(TIMEOUT, handle.wait_registered())
        .await
        .unwrap();
    assert_eq!(resolved.as_deref(), Some("10.0.0.5:9000"));
    assert_eq!(handle.state(), RuntimeState::Serving);

    {
        let registers = recorded.registers.lock().unwrap();
        assert_eq!(registers.len(), 1);
        assert_eq!(registers[0]["name"], "svc-a");
        assert_eq!(registers[0]["proto"], "grpc");
        assert_eq!(registers[0]["version"], "1.2.0");
        assert_eq!(registers[0]["srv"], port.to_string());
    }

    stop.send(()).unwrap();
    finish(task).await.unwrap();
    assert_eq!(handle.state(), RuntimeState::Stopped);

    handle.unregister().await;
    let unregisters = recorded.unregisters.lock().unwrap();
    assert_eq!(unregisters.len(), 1);
    assert_eq!(unregisters[0]["srv"], "10.0.0.5:9000");
    assert_eq!(unregisters[0]["name"], "svc-a");

    registry.abort();
}

#[tokio::test]
async fn advertise_host_is_prefixed() {
    let (registry_addr, recorded, registry) =
        spawn_registry(json!({"code": 0, "srv": "10.0.0.5:9000"})).await;

    let config = RuntimeConfig {
        advertise_host: Some("10.0.0.5".to_string()),
        ..runtime_config(Duration::ZERO)
    };
    let bound = bind(
        ServiceRuntime::new(config, Arc::new(new_allocator(1)))
            .with_registry(registry_client(registry_addr)),
    )
    .await;
    let expected = format!("10.0.0.5:{}", bound.local_addr().port());
    let (handle, stop, task) = spawn_serve(bound);

    tokio::time::timeout(TIMEOUT, handle.wait_registered())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recorded.registers.lock().unwrap()[0]["srv"], expected);

    stop.send(()).unwrap();
    finish(task).await.unwrap();
    registry.abort();
}

#[tokio::test]
async fn rejected_registration_aborts_startup() {
    let (registry_addr, _recorded, registry) =
        spawn_registry(json!({"code": 1, "msg": "name taken"})).await;

    let bound = bind(
        ServiceRuntime::new(
            runtime_config(Duration::from_millis(10)),
            Arc::new(new_allocator(1)),
        )
        .with_registry(registry_client(registry_addr)),
    )
    .await;
    let handle = bound.handle();

    // no shutdown signal: the failed registration alone has to stop it
    let result = tokio::time::timeout(TIMEOUT, bound.serve_with_shutdown(core::future::pending()))
        .await
        .expect("runtime kept serving after a rejected registration");

    match result {
        Err(RuntimeError::Registration(RegistryError::Rejected { code, msg })) => {
            assert_eq!(code, 1);
            assert_eq!(msg, "name taken");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(handle.state(), RuntimeState::Stopped);
    assert_eq!(handle.resolved_address(), None);

    registry.abort();
}

#[tokio::test]
async fn shutdown_before_delay_skips_registration() {
    let (registry_addr, recorded, registry) =
        spawn_registry(json!({"code": 0, "srv": "10.0.0.5:9000"})).await;

    let bound = bind(
        ServiceRuntime::new(
            runtime_config(Duration::from_secs(60)),
            Arc::new(new_allocator(1)),
        )
        .with_registry(registry_client(registry_addr)),
    )
    .await;
    let (handle, stop, task) = spawn_serve(bound);
    handle.wait_for(RuntimeState::Serving).await;

    stop.send(()).unwrap();
    finish(task).await.unwrap();

    assert_eq!(handle.wait_registered().await, None);
    assert!(recorded.registers.lock().unwrap().is_empty());
    registry.abort();
}

#[tokio::test]
async fn unconfigured_registry_is_never_called() {
    let bound = bind(
        ServiceRuntime::new(runtime_config(Duration::ZERO), Arc::new(new_allocator(1)))
            .with_registry(Arc::new(
                RegistryClient::new(RegistryConfig::new("", "")).unwrap(),
            )),
    )
    .await;
    let (handle, stop, task) = spawn_serve(bound);
    handle.wait_for(RuntimeState::Serving).await;

    stop.send(()).unwrap();
    finish(task).await.unwrap();
    assert_eq!(handle.resolved_address(), None);
    handle.unregister().await;
}

#[tokio::test]
async fn core_service_allocates_ids() {
    let bound = bind(ServiceRuntime::new(
        runtime_config(Duration::ZERO),
        Arc::new(new_allocator(1)),
    ))
    .await;
    let addr = bound.local_addr();
    let (handle, stop, task) = spawn_serve(bound);
    handle.wait_for(RuntimeState::Serving).await;

    let mut client = CoreServiceClient::new(connect(addr).await);

    let health = client.health(HealthRequest {}).await.unwrap().into_inner();
    assert_eq!(health.code, 0);
    assert_eq!(health.message, "OK");

    let id = client
        .allocate_one(AllocateOneRequest { partition_hint: 7 })
        .await
        .unwrap()
        .into_inner()
        .id;
    let first = SnowflakeId::from_raw(id);
    assert_eq!(first.partition(), 7);

    let ids = client
        .allocate_many(AllocateManyRequest {
            partition_hint: 1030,
            count: 500,
        })
        .await
        .unwrap()
        .into_inner()
        .ids;
    assert_eq!(ids.len(), 500);
    let mut previous = first.ordering_key();
    for raw in ids {
        let id = SnowflakeId::from_raw(raw);
        assert_eq!(id.partition(), 6);
        assert!(id.ordering_key() > previous);
        previous = id.ordering_key();
    }

    let empty = client
        .allocate_many(AllocateManyRequest {
            partition_hint: 1,
            count: 0,
        })
        .await
        .unwrap()
        .into_inner();
    assert!(empty.ids.is_empty());

    let err = client
        .allocate_many(AllocateManyRequest {
            partition_hint: 1,
            count: 1_001,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    stop.send(()).unwrap();
    finish(task).await.unwrap();
}

#[tokio::test]
async fn concurrent_callers_get_distinct_ids() {
    let bound = bind(ServiceRuntime::new(
        runtime_config(Duration::ZERO),
        Arc::new(new_allocator(3)),
    ))
    .await;
    let addr = bound.local_addr();
    let (handle, stop, task) = spawn_serve(bound);
    handle.wait_for(RuntimeState::Serving).await;

    let channel = connect(addr).await;
    let calls = (0..100).map(|_| {
        let mut client = CoreServiceClient::new(channel.clone());
        async move {
            client
                .allocate_many(AllocateManyRequest {
                    partition_hint: 3,
                    count: 100,
                })
                .await
                .unwrap()
                .into_inner()
                .ids
        }
    });
    let batches = futures::future::join_all(calls).await;

    let mut all: Vec<u64> = batches.into_iter().flatten().collect();
    assert_eq!(all.len(), 10_000);
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 10_000);

    stop.send(()).unwrap();
    finish(task).await.unwrap();
}

#[tokio::test]
async fn panicking_handler_does_not_take_down_the_listener() {
    let bound = bind(
        ServiceRuntime::new(runtime_config(Duration::ZERO), Arc::new(new_allocator(1)))
            .register_handler(|routes| {
                routes.add_service(Faulty);
            }),
    )
    .await;
    let addr = bound.local_addr();
    let (handle, stop, task) = spawn_serve(bound);
    handle.wait_for(RuntimeState::Serving).await;

    let channel = connect(addr).await;
    let mut raw = tonic::client::Grpc::new(channel.clone());
    let mut core = CoreServiceClient::new(channel);

    for _ in 0..2 {
        raw.ready().await.unwrap();
        let err = raw
            .unary::<HealthRequest, HealthResponse, _>(
                Request::new(HealthRequest {}),
                PathAndQuery::from_static("/test.Faulty/Call"),
                tonic_prost::ProstCodec::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.message().contains("panicked"), "{}", err.message());

        let health = core.health(HealthRequest {}).await.unwrap().into_inner();
        assert_eq!(health.code, 0);
    }
    assert_eq!(handle.state(), RuntimeState::Serving);

    stop.send(()).unwrap();
    finish(task).await.unwrap();
}

#[tokio::test]
async fn panicking_stream_ends_with_internal_status() {
    let bound = bind(
        ServiceRuntime::new(runtime_config(Duration::ZERO), Arc::new(new_allocator(1)))
            .register_handler(|routes| {
                routes.add_service(Streamy);
            }),
    )
    .await;
    let addr = bound.local_addr();
    let (handle, stop, task) = spawn_serve(bound);
    handle.wait_for(RuntimeState::Serving).await;

    let channel = connect(addr).await;
    let mut raw = tonic::client::Grpc::new(channel.clone());
    let mut core = CoreServiceClient::new(channel);

    for _ in 0..2 {
        raw.ready().await.unwrap();
        let mut stream = raw
            .server_streaming::<HealthRequest, HealthResponse, _>(
                Request::new(HealthRequest {}),
                PathAndQuery::from_static("/test.Streamy/Watch"),
                tonic_prost::ProstCodec::default(),
            )
            .await
            .unwrap()
            .into_inner();

        let err = tokio::time::timeout(TIMEOUT, stream.message())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.message().contains("watch source dropped"), "{}", err.message());

        let health = core.health(HealthRequest {}).await.unwrap().into_inner();
        assert_eq!(health.code, 0);
    }
    assert_eq!(handle.state(), RuntimeState::Serving);

    stop.send(()).unwrap();
    finish(task).await.unwrap();
}
