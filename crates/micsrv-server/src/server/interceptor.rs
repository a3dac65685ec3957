//! Per-call panic boundary.
//!
//! [`RecoveryLayer`] wraps the whole router, so every service mounted on the
//! runtime (built-in or registered by embedding code) gets the same treatment:
//!
//! - the handler future and every poll of the response body run inside
//!   [`catch_unwind`]; a panic becomes a gRPC `INTERNAL` status instead of
//!   tearing down the connection task
//! - the panic's backtrace is captured by a process-wide panic hook, but only
//!   while a guarded poll is running on the current thread; panics elsewhere
//!   still reach the previously installed hook
//! - every call is logged on return with its gRPC path, peer address and
//!   elapsed time
//!
//! A panic before the response head exists is answered with a trailers-only
//! `INTERNAL` response. A panic while streaming ends the body with an
//! `INTERNAL` trailers frame after whatever was already sent.

use crate::server::telemetry::{increment_panics, increment_requests, record_call_duration};
use core::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use http_body::{Body, Frame, SizeHint};
use micsrv_core::Error;
use pin_project_lite::pin_project;
use std::{
    any::Any,
    backtrace::Backtrace,
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Once},
    time::Instant,
};
use tonic::{Status, codegen::http, transport::server::TcpConnectInfo};
use tower::{Layer, Service};

thread_local! {
    static GUARDED: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if GUARDED.with(Cell::get) {
                let report = format!("{info}\n{}", Backtrace::force_capture());
                LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(report));
            } else {
                previous(info);
            }
        }));
    });
}

/// Marks the current thread as inside a guarded poll until dropped.
struct Guard {
    was_guarded: bool,
}

impl Guard {
    fn enter() -> Self {
        Self {
            was_guarded: GUARDED.with(|g| g.replace(true)),
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        GUARDED.with(|g| g.set(self.was_guarded));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `poll` with the current thread marked as guarded.
fn guarded<T>(poll: impl FnOnce() -> T) -> std::thread::Result<T> {
    let _guard = Guard::enter();
    catch_unwind(AssertUnwindSafe(poll))
}

/// What every log line of one call carries.
#[derive(Debug)]
struct CallInfo {
    path: String,
    peer: Option<SocketAddr>,
    start: Instant,
}

impl CallInfo {
    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1_000.0
    }

    /// Logs a caught panic with its backtrace and turns it into a status.
    fn recover(&self, payload: Box<dyn Any + Send>, stage: &'static str) -> Status {
        increment_panics();
        let elapsed_ms = self.elapsed_ms();
        let message = panic_message(payload.as_ref());
        let report = LAST_PANIC
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(|| message.clone());
        tracing::error!(
            path = %self.path,
            peer = self.peer.map(tracing::field::display),
            elapsed_ms,
            stage,
            panic = %message,
            "handler panicked\n{report}"
        );
        Error::Panicked { message }.into()
    }
}

/// Tower layer installing the per-call panic boundary.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryLayer;

impl RecoveryLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = Recovery<S>;

    fn layer(&self, inner: S) -> Self::Service {
        install_panic_hook();
        Recovery { inner }
    }
}

#[derive(Clone, Debug)]
pub struct Recovery<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for Recovery<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Error: core::fmt::Display,
    ResBody: Default,
{
    type Response = http::Response<RecoveryBody<ResBody>>;
    type Error = S::Error;
    type Future = RecoveryFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let path = req.uri().path().to_string();
        let peer = req
            .extensions()
            .get::<TcpConnectInfo>()
            .and_then(TcpConnectInfo::remote_addr);
        increment_requests();

        RecoveryFuture {
            inner: self.inner.call(req),
            call: Arc::new(CallInfo {
                path,
                peer,
                start: Instant::now(),
            }),
        }
    }
}

pin_project! {
    pub struct RecoveryFuture<F> {
        #[pin]
        inner: F,
        call: Arc<CallInfo>,
    }
}

impl<F, ResBody, E> Future for RecoveryFuture<F>
where
    F: Future<Output = Result<http::Response<ResBody>, E>>,
    E: core::fmt::Display,
    ResBody: Default,
{
    type Output = Result<http::Response<RecoveryBody<ResBody>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let call = this.call;
        let inner = this.inner;

        let polled = match guarded(|| inner.poll(cx)) {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(polled)) => polled,
            Err(payload) => Ok(call.recover(payload, "handler").into_http()),
        };

        let elapsed_ms = call.elapsed_ms();
        record_call_duration(elapsed_ms);
        let peer = call.peer.map(tracing::field::display);
        match &polled {
            Ok(response) => {
                let grpc_status = response
                    .headers()
                    .get("grpc-status")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("0");
                tracing::debug!(path = %call.path, peer, elapsed_ms, grpc_status, "call finished");
            }
            Err(e) => {
                tracing::warn!(path = %call.path, peer, elapsed_ms, error = %e, "call failed in transport");
            }
        }

        let call = Arc::clone(call);
        Poll::Ready(polled.map(|response| response.map(|body| RecoveryBody::new(body, call))))
    }
}

pin_project! {
    /// Response body polled under the same panic boundary as the handler.
    ///
    /// After a caught panic the inner body is never polled again; the stream
    /// ends with a single `INTERNAL` trailers frame.
    pub struct RecoveryBody<B> {
        #[pin]
        inner: B,
        call: Arc<CallInfo>,
        failed: bool,
    }
}

impl<B> RecoveryBody<B> {
    fn new(inner: B, call: Arc<CallInfo>) -> Self {
        Self {
            inner,
            call,
            failed: false,
        }
    }
}

impl<B> Body for RecoveryBody<B>
where
    B: Body,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        if *this.failed {
            return Poll::Ready(None);
        }

        let inner = this.inner;
        match guarded(|| inner.poll_frame(cx)) {
            Ok(polled) => polled,
            Err(payload) => {
                *this.failed = true;
                let status = this.call.recover(payload, "body");
                let mut trailers = http::HeaderMap::new();
                if let Err(e) = status.add_header(&mut trailers) {
                    tracing::warn!(error = %e, "failed to encode panic status");
                }
                Poll::Ready(Some(Ok(Frame::trailers(trailers))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.failed || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        if self.failed {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}
