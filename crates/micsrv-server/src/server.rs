//! Building blocks of the micsrv gRPC runtime.
//!
//! - [`runtime`] - `ServiceRuntime` lifecycle: bind, serve, register, drain.
//! - [`interceptor`] - recovery layer turning handler panics into `INTERNAL`.
//! - [`service`] - the built-in `CoreService` implementation.
//! - [`config`] - CLI / environment configuration.
//! - [`telemetry`] - log subscriber and optional OpenTelemetry metrics.

pub mod config;
pub mod error;
pub mod interceptor;
pub mod runtime;
pub mod service;
pub mod telemetry;
