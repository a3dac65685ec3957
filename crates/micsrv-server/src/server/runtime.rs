//! Lifecycle of a micsrv gRPC service.
//!
//! ```text
//! Created --bind()--> Bound --serve()--> Serving --shutdown--> Draining --> Stopped
//! ```
//!
//! [`ServiceRuntime`] collects configuration, the allocator, an optional
//! registry client and any handlers the embedding code wants mounted.
//! [`bind`](ServiceRuntime::bind) claims the listener and returns a
//! [`BoundRuntime`]; only a bound runtime can serve. Progress is published on
//! a watch channel that [`RuntimeHandle`]s observe.
//!
//! Registration is a one-shot task scheduled when serving starts. It waits
//! `registration_delay`, registers once and records the address the registry
//! resolved. Shutdown before the delay elapses cancels it. A failed
//! registration drains the runtime and surfaces as
//! [`RuntimeError::Registration`].

use crate::server::{
    config::RuntimeConfig, error::RuntimeError, interceptor::RecoveryLayer,
    service::handler::CoreHandler,
};
use core::{future::Future, time::Duration};
use micsrv_core::{
    proto::{FILE_DESCRIPTOR_SET, core_service_server::CoreServiceServer},
    types::{Allocator, GRPC_PROTOCOL},
};
use micsrv_registry::{RegistryClient, RegistryError};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{service::RoutesBuilder, transport::Server};
use tonic_health::server::HealthReporter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuntimeState {
    Created,
    Bound,
    Serving,
    Draining,
    Stopped,
}

/// A runtime that has not claimed its listener yet.
pub struct ServiceRuntime {
    config: RuntimeConfig,
    allocator: Arc<Allocator>,
    registry: Option<Arc<RegistryClient>>,
    routes: RoutesBuilder,
    state: watch::Sender<RuntimeState>,
}

impl ServiceRuntime {
    pub fn new(config: RuntimeConfig, allocator: Arc<Allocator>) -> Self {
        let (state, _) = watch::channel(RuntimeState::Created);
        Self {
            config,
            allocator,
            registry: None,
            routes: RoutesBuilder::default(),
            state,
        }
    }

    /// Registers this instance with `registry` once serving starts. Ignored
    /// when the client has no registry address.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Mounts application services next to the built-in ones. They sit
    /// behind the same recovery layer.
    #[must_use]
    pub fn register_handler<F>(mut self, register: F) -> Self
    where
        F: FnOnce(&mut RoutesBuilder),
    {
        register(&mut self.routes);
        self
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    /// Claims the listen address. Port `0` lets the OS choose.
    pub async fn bind(self) -> Result<BoundRuntime, RuntimeError> {
        let addr = self.config.listen_addr.clone();
        let bind_err = |source| RuntimeError::Bind {
            addr: addr.clone(),
            source,
        };

        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(service = %self.config.service_name, %addr, error = %e, "failed to bind listener");
                return Err(bind_err(e));
            }
        };
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let (resolved, _) = watch::channel(None);
        self.state.send_replace(RuntimeState::Bound);
        tracing::info!(service = %self.config.service_name, %local_addr, "listener bound");

        Ok(BoundRuntime {
            runtime: self,
            listener,
            local_addr,
            resolved,
        })
    }
}

/// A runtime holding its listener, ready to serve.
pub struct BoundRuntime {
    runtime: ServiceRuntime,
    listener: TcpListener,
    local_addr: SocketAddr,
    resolved: watch::Sender<Option<String>>,
}

impl BoundRuntime {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address this instance registers under.
    pub fn advertised_address(&self) -> String {
        self.runtime
            .config
            .advertised_address(self.local_addr.port())
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            state: self.runtime.state.subscribe(),
            resolved: self.resolved.subscribe(),
            local_addr: self.local_addr,
            service_name: self.runtime.config.service_name.clone(),
            registry: self.active_registry(),
        }
    }

    fn active_registry(&self) -> Option<Arc<RegistryClient>> {
        self.runtime
            .registry
            .as_ref()
            .filter(|registry| registry.registry_config().is_configured())
            .cloned()
    }

    /// Serves until SIGINT, SIGTERM or SIGHUP.
    pub async fn serve(self) -> Result<(), RuntimeError> {
        self.serve_with_shutdown(shutdown_signal()).await
    }

    /// Serves until `signal` resolves or registration fails, then drains.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<(), RuntimeError>
    where
        F: Future<Output = ()> + Send,
    {
        let registry = self.active_registry();
        let advertised = self.advertised_address();
        let Self {
            runtime,
            listener,
            local_addr,
            resolved,
        } = self;
        let ServiceRuntime {
            config,
            allocator,
            mut routes,
            state,
            ..
        } = runtime;

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<CoreServiceServer<CoreHandler>>()
            .await;

        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
            .build_v1()?;

        routes
            .add_service(health_service)
            .add_service(reflection)
            .add_service(CoreHandler::new(allocator, config.max_ids_per_request).into_server());

        let token = CancellationToken::new();
        let registration = registry.map(|registry| {
            spawn_registration(
                Registration {
                    name: config.service_name.clone(),
                    version: config.service_version.clone(),
                    address: advertised,
                    delay: config.registration_delay,
                },
                registry,
                resolved,
                token.clone(),
            )
        });

        let drain = drain_on(signal, token.clone(), health_reporter, state.clone());

        state.send_replace(RuntimeState::Serving);
        tracing::info!(service = %config.service_name, %local_addr, "serving");

        let serve = Server::builder()
            .layer(RecoveryLayer::new())
            .add_routes(routes.routes())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), drain);

        let served = match config.drain_timeout {
            None => serve.await,
            Some(limit) => {
                tokio::pin!(serve);
                tokio::select! {
                    result = &mut serve => result,
                    () = drain_deadline(&token, limit) => {
                        tracing::warn!(?limit, "drain timeout elapsed, abandoning in-flight calls");
                        Ok(())
                    }
                }
            }
        };

        token.cancel();
        let registered = match registration {
            Some(task) => task.await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "registration task did not complete");
                Ok(())
            }),
            None => Ok(()),
        };

        state.send_replace(RuntimeState::Stopped);
        tracing::info!(service = %config.service_name, "stopped");

        registered.map_err(RuntimeError::Registration)?;
        served?;
        Ok(())
    }
}

struct Registration {
    name: String,
    version: String,
    address: String,
    delay: Duration,
}

fn spawn_registration(
    registration: Registration,
    registry: Arc<RegistryClient>,
    resolved: watch::Sender<Option<String>>,
    token: CancellationToken,
) -> JoinHandle<Result<(), RegistryError>> {
    tokio::spawn(async move {
        let Registration {
            name,
            version,
            address,
            delay,
        } = registration;

        tokio::select! {
            () = token.cancelled() => {
                tracing::debug!(service = %name, "shutdown before registration, skipping it");
                return Ok(());
            }
            () = tokio::time::sleep(delay) => {}
        }

        match registry
            .register(&name, &address, GRPC_PROTOCOL, &version)
            .await
        {
            Ok(addr) => {
                resolved.send_replace(Some(addr));
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    service = %name,
                    registry = %registry.base_url(),
                    error = %e,
                    "registration failed, shutting down"
                );
                token.cancel();
                Err(e)
            }
        }
    })
}

/// Resolves once shutdown is requested, after flipping health to
/// `NOT_SERVING` so probes stop routing here while calls drain.
async fn drain_on<F>(
    signal: F,
    token: CancellationToken,
    health_reporter: HealthReporter,
    state: watch::Sender<RuntimeState>,
) where
    F: Future<Output = ()>,
{
    tokio::select! {
        () = signal => tracing::info!("shutdown requested"),
        () = token.cancelled() => {}
    }
    token.cancel();

    state.send_replace(RuntimeState::Draining);
    health_reporter
        .set_not_serving::<CoreServiceServer<CoreHandler>>()
        .await;
    tracing::info!("draining in-flight calls");
}

async fn drain_deadline(token: &CancellationToken, limit: Duration) {
    token.cancelled().await;
    tokio::time::sleep(limit).await;
}

/// Resolves on SIGINT, SIGTERM or SIGHUP (Ctrl+C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{Signal, SignalKind, signal};

        fn install(kind: SignalKind, name: &str) -> Option<Signal> {
            signal(kind)
                .inspect_err(|e| {
                    tracing::warn!(signal = name, error = %e, "failed to install signal handler");
                })
                .ok()
        }

        async fn recv(signal: &mut Option<Signal>) {
            match signal {
                Some(signal) => {
                    signal.recv().await;
                }
                None => core::future::pending().await,
            }
        }

        let mut interrupt = install(SignalKind::interrupt(), "SIGINT");
        let mut terminate = install(SignalKind::terminate(), "SIGTERM");
        let mut hangup = install(SignalKind::hangup(), "SIGHUP");

        let name = tokio::select! {
            () = recv(&mut interrupt) => "SIGINT",
            () = recv(&mut terminate) => "SIGTERM",
            () = recv(&mut hangup) => "SIGHUP",
        };
        tracing::info!(signal = name, "received shutdown signal");
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            core::future::pending::<()>().await;
        }
        tracing::info!("received Ctrl+C");
    }
}

/// Observer for a bound runtime. Cheap to clone, usable from any task.
#[derive(Clone)]
pub struct RuntimeHandle {
    state: watch::Receiver<RuntimeState>,
    resolved: watch::Receiver<Option<String>>,
    local_addr: SocketAddr,
    service_name: String,
    registry: Option<Arc<RegistryClient>>,
}

impl RuntimeHandle {
    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address the registry resolved for this instance, once registered.
    pub fn resolved_address(&self) -> Option<String> {
        self.resolved.borrow().clone()
    }

    /// Waits until the runtime has reached `target` (or gone past it).
    pub async fn wait_for(&self, target: RuntimeState) -> RuntimeState {
        let mut state = self.state.clone();
        match state.wait_for(|s| *s >= target).await {
            Ok(reached) => *reached,
            Err(_) => self.state(),
        }
    }

    /// Waits for registration to finish. `None` when the runtime starts
    /// draining first or never registers.
    pub async fn wait_registered(&self) -> Option<String> {
        let mut resolved = self.resolved.clone();
        let mut state = self.state.clone();
        loop {
            if let Some(addr) = resolved.borrow_and_update().clone() {
                return Some(addr);
            }
            if *state.borrow_and_update() >= RuntimeState::Draining {
                return None;
            }
            tokio::select! {
                changed = resolved.changed() => if changed.is_err() {
                    return self.resolved_address();
                },
                changed = state.changed() => if changed.is_err() {
                    return self.resolved_address();
                },
            }
        }
    }

    /// Best-effort removal from the registry. Does nothing if this instance
    /// never registered.
    pub async fn unregister(&self) {
        let (Some(registry), Some(addr)) = (&self.registry, self.resolved_address()) else {
            return;
        };
        registry
            .unregister(GRPC_PROTOCOL, &self.service_name, &addr)
            .await;
    }
}
