//! The built-in `micsrv.CoreService`.
//!
//! ## Structure
//!
//! - [`handler`] - gRPC service entry point (`CoreHandler`).

pub mod handler;
