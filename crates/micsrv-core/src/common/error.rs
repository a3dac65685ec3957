//! Error types for the core service.
//!
//! This module defines the central `Error` enum for everything a request to
//! the built-in service can fail with. It implements `From<Error>` for
//! `tonic::Status` so handlers can return it with `?`.
//!
//! ## Error Cases
//! - `InvalidRequest`: The client request was malformed or exceeded bounds.
//! - `Allocation`: The blocking allocation task did not complete.
//! - `Panicked`: A handler panicked and the recovery layer caught it.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the core service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The allocation task was cancelled or failed before producing ids.
    #[error("Allocation failed: {context}")]
    Allocation { context: String },

    /// The handler panicked; `message` is the panic payload.
    #[error("Handler panicked: {message}")]
    Panicked { message: String },
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::Allocation { context } => {
                Status::internal(format!("Allocation failed: {context}"))
            }
            Error::Panicked { message } => Status::internal(format!("Handler panicked: {message}")),
        }
    }
}
