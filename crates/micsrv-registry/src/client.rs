use crate::cache::encode_key;
use crate::{
    Cache, ConfigResponse, DiscoverResponse, FileCache, MemoryCache, RegisterRequest,
    RegisterResponse, RegistryConfig, RegistryError, StaleDiscovery, StatusResponse,
    UnregisterRequest, select_instance, unix_seconds,
};
use micsrv_core::proto::{HealthRequest, core_service_client::CoreServiceClient};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use tonic::transport::Endpoint;

/// Source of unix seconds used to rotate between discovered instances.
pub type UnixClock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Auth header carrying the derived token (`X-TOKEN` on the wire).
const TOKEN_HEADER: HeaderName = HeaderName::from_static("x-token");

/// Client for the micsrv HTTP registry.
///
/// The registry address and token are fixed at construction. Every call is an
/// independent round trip: no idle connections are kept between calls.
pub struct RegistryClient {
    config: RegistryConfig,
    http: reqwest::Client,
    probe: reqwest::Client,
    discovery_cache: Arc<dyn Cache<Vec<String>>>,
    config_cache: Arc<dyn Cache<String>>,
    clock: UnixClock,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("base_url", &self.config.base_url)
            .field("timeout", &self.config.timeout)
            .field("cache_dir", &self.config.cache_dir)
            .finish_non_exhaustive()
    }
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, HeaderValue::from_str(&config.token)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(RegistryError::Client)?;

        // Health probes target service instances, not the registry, so they
        // carry no credentials.
        let probe = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(RegistryError::Client)?;

        Ok(Self {
            discovery_cache: Arc::new(MemoryCache::new()),
            config_cache: Arc::new(FileCache::new(&config.cache_dir)),
            clock: Arc::new(unix_seconds),
            config,
            http,
            probe,
        })
    }

    /// Replaces the clock used by [`resolve_one_instance`](Self::resolve_one_instance).
    #[must_use]
    pub fn with_clock(mut self, clock: UnixClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_discovery_cache(mut self, cache: Arc<dyn Cache<Vec<String>>>) -> Self {
        self.discovery_cache = cache;
        self
    }

    #[must_use]
    pub fn with_config_cache(mut self, cache: Arc<dyn Cache<String>>) -> Self {
        self.config_cache = cache;
        self
    }

    pub fn registry_config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Registers `address` under `name` and returns the address the registry
    /// resolved for it.
    ///
    /// Any failure is returned; callers are expected to abort startup.
    pub async fn register(
        &self,
        name: &str,
        address: &str,
        proto: &str,
        version: &str,
    ) -> Result<String, RegistryError> {
        let body = RegisterRequest {
            name,
            srv: address,
            proto,
            version,
        };
        let response: RegisterResponse = self
            .request(Method::POST, "/micsrv/register", Some(&body))
            .await?;
        if response.code != 0 {
            return Err(RegistryError::Rejected {
                code: response.code,
                msg: response.msg,
            });
        }

        tracing::info!(name, proto, resolved = %response.srv, "registered service");
        Ok(response.srv)
    }

    /// Best-effort removal of a registration. Failures are logged, never
    /// returned.
    pub async fn unregister(&self, proto: &str, name: &str, address: &str) {
        let body = UnregisterRequest {
            name,
            proto,
            srv: address,
        };
        match self
            .request::<StatusResponse, _>(Method::POST, "/micsrv/unregister", Some(&body))
            .await
        {
            Ok(response) => {
                tracing::info!(name, proto, address, code = response.code, "unregistered service");
            }
            Err(e) => {
                tracing::warn!(name, proto, address, error = %e, "unregister failed");
            }
        }
    }

    /// Fetches the instance list for `proto`/`name`.
    ///
    /// A successful non-empty answer replaces the cached list for
    /// `"{proto}@{name}"`. An empty answer is returned as is and leaves the
    /// cache alone. On failure the error carries the last cached list.
    pub async fn discover(&self, proto: &str, name: &str) -> Result<Vec<String>, StaleDiscovery> {
        let key = discovery_key(proto, name);
        let path = format!(
            "/micsrv/discover/{}/{}",
            encode_key(proto),
            encode_key(name)
        );

        let result = self
            .request::<DiscoverResponse, ()>(Method::GET, &path, None)
            .await
            .and_then(|response| {
                if response.code == 0 {
                    Ok(response.srvs)
                } else {
                    Err(RegistryError::Rejected {
                        code: response.code,
                        msg: response.msg,
                    })
                }
            });

        match result {
            Ok(srvs) => {
                if !srvs.is_empty() {
                    if let Err(e) = self.discovery_cache.set(&key, srvs.clone()) {
                        tracing::warn!(%key, error = %e, "failed to cache discovery result");
                    }
                }
                tracing::debug!(%key, instances = srvs.len(), "discovered instances");
                Ok(srvs)
            }
            Err(source) => {
                let cached = self.discovery_cache.get(&key).unwrap_or_default();
                tracing::warn!(
                    %key,
                    cached = cached.len(),
                    error = %source,
                    "discovery failed, falling back to cache"
                );
                Err(StaleDiscovery {
                    key,
                    cached,
                    source,
                })
            }
        }
    }

    /// Probes `address` up to `max_attempts` times, stopping at the first
    /// success.
    ///
    /// `grpc` instances are asked for the core `Health` RPC and must answer
    /// `code == 0`; anything else must answer `GET /healthz` with 200.
    pub async fn health(&self, max_attempts: usize, proto: &str, address: &str) -> bool {
        for attempt in 1..=max_attempts {
            let healthy = if proto == micsrv_core::types::GRPC_PROTOCOL {
                self.grpc_health(address).await
            } else {
                self.http_health(address).await
            };
            if healthy {
                return true;
            }
            tracing::debug!(proto, address, attempt, max_attempts, "health probe failed");
        }
        false
    }

    async fn grpc_health(&self, address: &str) -> bool {
        let endpoint = match Endpoint::from_shared(format!("http://{address}")) {
            Ok(endpoint) => endpoint
                .connect_timeout(self.config.timeout)
                .timeout(self.config.timeout),
            Err(e) => {
                tracing::warn!(address, error = %e, "invalid health probe address");
                return false;
            }
        };

        let channel = match endpoint.connect().await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::debug!(address, error = %e, "health probe connect failed");
                return false;
            }
        };

        match CoreServiceClient::new(channel).health(HealthRequest {}).await {
            Ok(response) => response.into_inner().code == 0,
            Err(status) => {
                tracing::debug!(address, %status, "health rpc failed");
                false
            }
        }
    }

    async fn http_health(&self, address: &str) -> bool {
        let url = format!("http://{address}/healthz");
        match self.probe.get(&url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                tracing::debug!(%url, error = %e, "health probe failed");
                false
            }
        }
    }

    /// Loads the configuration blob `name`.
    ///
    /// A non-empty blob from the registry is written to the disk cache and
    /// returned. Otherwise the cached copy is used; if there is none the call
    /// fails with [`RegistryError::ConfigUnavailable`].
    pub async fn config(&self, name: &str) -> Result<String, RegistryError> {
        let key = config_key(name);
        let path = format!("/micsrv/config/{}", encode_key(name));

        match self.request::<ConfigResponse, ()>(Method::GET, &path, None).await {
            Ok(response) if response.code == 0 && !response.yaml.is_empty() => {
                if let Err(e) = self.config_cache.set(&key, response.yaml.clone()) {
                    tracing::warn!(%key, error = %e, "failed to persist configuration");
                }
                return Ok(response.yaml);
            }
            Ok(response) => {
                tracing::warn!(name, code = response.code, msg = %response.msg, "registry has no usable configuration");
            }
            Err(e) => {
                tracing::warn!(name, error = %e, "configuration fetch failed");
            }
        }

        match self.config_cache.get(&key) {
            Some(yaml) if !yaml.is_empty() => {
                tracing::info!(name, "using cached configuration");
                Ok(yaml)
            }
            _ => {
                tracing::error!(name, registry = %self.config.base_url, "configuration unavailable");
                Err(RegistryError::ConfigUnavailable {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Asks the registry to reload its state. A rejection carries the
    /// registry's message verbatim.
    pub async fn reload(&self) -> Result<(), RegistryError> {
        let response: StatusResponse = self
            .request::<_, ()>(Method::GET, "/micsrv/reload", None)
            .await?;
        if response.code != 0 {
            return Err(RegistryError::Rejected {
                code: response.code,
                msg: response.msg,
            });
        }
        tracing::info!(registry = %self.config.base_url, "registry reloaded");
        Ok(())
    }

    /// Picks one live instance of `proto`/`name`, falling back to the cached
    /// list when the registry is unreachable or reports no instances.
    pub async fn resolve_one_instance(&self, proto: &str, name: &str) -> Option<String> {
        let candidates = match self.discover(proto, name).await {
            Ok(srvs) if srvs.is_empty() => self
                .discovery_cache
                .get(&discovery_key(proto, name))
                .unwrap_or_default(),
            Ok(srvs) => srvs,
            Err(stale) => stale.into_cached(),
        };
        let picked = select_instance(&candidates, (self.clock)()).map(str::to_string);
        if picked.is_none() {
            tracing::warn!(proto, name, "no instance available");
        }
        picked
    }

    async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, RegistryError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        if !self.config.is_configured() {
            return Err(RegistryError::NotConfigured);
        }

        let url = self.config.endpoint(path);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let transport = |source| RegistryError::Transport {
            url: url.clone(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(RegistryError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(transport)?;
        tracing::trace!(%url, body = %String::from_utf8_lossy(&bytes), "registry response");
        serde_json::from_slice(&bytes).map_err(|source| RegistryError::Decode { url, source })
    }
}

pub fn discovery_key(proto: &str, name: &str) -> String {
    format!("{proto}@{name}")
}

pub fn config_key(name: &str) -> String {
    format!("config@{name}")
}
