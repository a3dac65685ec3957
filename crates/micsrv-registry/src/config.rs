use core::time::Duration;
use md5::{Digest, Md5};
use std::path::PathBuf;

/// Environment variable holding the registry base address.
pub const REGISTRY_ADDR_ENV: &str = "DCSRV";

/// Environment variable holding the shared secret the auth token is derived
/// from.
pub const REGISTRY_SECRET_ENV: &str = "DCJWT";

/// Default per-request timeout for registry calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default directory for the on-disk configuration cache.
pub const DEFAULT_CACHE_DIR: &str = "./cachedir";

/// Connection settings for [`RegistryClient`](crate::RegistryClient).
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Base URL, always carrying a scheme.
    pub base_url: String,
    /// Lowercase hex MD5 of the shared secret, sent as `X-TOKEN`.
    pub token: String,
    pub timeout: Duration,
    pub cache_dir: PathBuf,
}

impl core::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

impl RegistryConfig {
    /// Builds a config from a registry address and the shared secret.
    ///
    /// Addresses without an `http` prefix get `http://`. A trailing slash is
    /// dropped so endpoint paths can be appended directly.
    pub fn new(address: impl AsRef<str>, secret: impl AsRef<str>) -> Self {
        Self {
            base_url: normalize_base_url(address.as_ref()),
            token: derive_token(secret.as_ref()),
            timeout: DEFAULT_TIMEOUT,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }

    /// Reads `DCSRV` and `DCJWT`. Missing variables read as empty strings; use
    /// [`is_configured`](Self::is_configured) to tell whether a registry was
    /// provided at all.
    pub fn from_env() -> Self {
        let address = std::env::var(REGISTRY_ADDR_ENV).unwrap_or_default();
        let secret = std::env::var(REGISTRY_SECRET_ENV).unwrap_or_default();
        Self::new(address, secret)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// `true` when a registry address was given.
    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Lowercase hex MD5 digest of `secret`.
pub fn derive_token(secret: &str) -> String {
    let digest = Md5::digest(secret.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn normalize_base_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.is_empty() || address.starts_with("http") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_hex_md5_of_secret() {
        assert_eq!(derive_token(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(derive_token("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn address_gets_scheme_prefix() {
        let config = RegistryConfig::new("10.0.0.9:8500", "s3cret");
        assert_eq!(config.base_url, "http://10.0.0.9:8500");
        assert_eq!(config.endpoint("/micsrv/reload"), "http://10.0.0.9:8500/micsrv/reload");

        let config = RegistryConfig::new("https://registry.local/", "s3cret");
        assert_eq!(config.base_url, "https://registry.local");
    }

    #[test]
    fn defaults() {
        let config = RegistryConfig::new("registry:80", "");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.cache_dir, PathBuf::from("./cachedir"));
        assert!(config.is_configured());
        assert!(!RegistryConfig::new("  ", "").is_configured());
    }
}
