//! Error types for registry calls.
//!
//! - `RegistryError`: why a single registry round trip (or a config lookup)
//!   failed.
//! - `StaleDiscovery`: a failed discovery, carrying the last known instance
//!   list so callers can still route.

/// Unified error type for registry calls.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No registry address was configured.
    #[error("registry address is not configured")]
    NotConfigured,

    /// The derived auth token could not be used as a header value.
    #[error("invalid auth header: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Connecting, sending or reading the body failed (including timeouts).
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The registry answered with a non-200 HTTP status.
    #[error("registry returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    /// The body was not the JSON document the endpoint promises.
    #[error("malformed registry response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// The registry processed the request and reported `code != 0`.
    #[error("registry rejected the request (code {code}): {msg}")]
    Rejected { code: i64, msg: String },

    /// Neither the registry nor the disk cache produced the named config.
    #[error("configuration `{name}` is unavailable from the registry and the local cache")]
    ConfigUnavailable { name: String },
}

impl RegistryError {
    /// The registry's own failure message, if it sent one.
    pub fn registry_message(&self) -> Option<&str> {
        match self {
            Self::Rejected { msg, .. } => Some(msg),
            _ => None,
        }
    }
}

/// A discovery call that failed. `cached` holds the last list the registry
/// returned for the same key, or nothing if there never was one.
#[derive(Debug, thiserror::Error)]
#[error("discovery of `{key}` failed, {} cached instance(s) available: {source}", cached.len())]
pub struct StaleDiscovery {
    pub key: String,
    pub cached: Vec<String>,
    #[source]
    pub source: RegistryError,
}

impl StaleDiscovery {
    pub fn into_cached(self) -> Vec<String> {
        self.cached
    }
}
