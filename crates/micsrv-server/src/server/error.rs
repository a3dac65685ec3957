use micsrv_registry::RegistryError;

/// Reasons a runtime stops with an error.
///
/// Every variant is fatal: the process is expected to exit.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The listener could not be bound. Not retried.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The registry refused or failed the deferred registration.
    #[error("service registration failed: {0}")]
    Registration(#[source] RegistryError),

    /// The reflection service could not be built from the descriptor set.
    #[error("failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    /// The gRPC server stopped with a transport error.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}
