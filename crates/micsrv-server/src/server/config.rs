use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use micsrv_core::types::DEFAULT_PARTITION;
use micsrv_registry::RegistryConfig;

/// Runtime configuration for the `micsrv-server` binary.
///
/// All values are parsed from CLI arguments or environment variables. The
/// registry variables keep their historical names (`DCSRV`, `DCJWT`) so
/// existing deployments keep working.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "micsrv-server",
    version,
    about = "A gRPC service runtime with Snowflake id allocation and registry self-registration"
)]
pub struct CliArgs {
    /// Address to listen on. Port `0` lets the OS pick one.
    ///
    /// Environment variable: `LISTEN_ADDR`
    #[arg(long, env = "LISTEN_ADDR", default_value_t = String::from("0.0.0.0:0"))]
    pub listen_addr: String,

    /// Name this instance registers under.
    ///
    /// Environment variable: `SERVICE_NAME`
    #[arg(long, env = "SERVICE_NAME", default_value_t = String::from("micsrv"))]
    pub service_name: String,

    /// Version reported to the registry.
    ///
    /// Environment variable: `SERVICE_VERSION`
    #[arg(long, env = "SERVICE_VERSION", default_value_t = String::from(env!("CARGO_PKG_VERSION")))]
    pub service_version: String,

    /// Host part of the registered address. When unset only the port is
    /// registered and the registry fills in the caller's address.
    ///
    /// Environment variable: `ADVERTISE_HOST`
    #[arg(long, env = "ADVERTISE_HOST")]
    pub advertise_host: Option<String>,

    /// Registry base address, e.g. `http://10.0.0.2:8500`. Registration is
    /// skipped when unset.
    ///
    /// Environment variable: `DCSRV`
    #[arg(long, env = "DCSRV")]
    pub registry_addr: Option<String>,

    /// Shared secret the `X-TOKEN` header is derived from.
    ///
    /// Environment variable: `DCJWT`
    #[arg(long, env = "DCJWT", default_value_t = String::new(), hide_env_values = true)]
    pub registry_secret: String,

    /// Allocator partition. Values outside `0..1024` wrap.
    ///
    /// Environment variable: `PARTITION`
    #[arg(long, env = "PARTITION", default_value_t = DEFAULT_PARTITION, allow_negative_numbers = true)]
    pub partition: i64,

    /// Upper bound for `AllocateMany`.
    ///
    /// Environment variable: `MAX_IDS_PER_REQUEST`
    #[arg(long, env = "MAX_IDS_PER_REQUEST", default_value_t = 100_000)]
    pub max_ids_per_request: usize,

    /// Delay between the listener coming up and the registration call.
    ///
    /// Environment variable: `REGISTRATION_DELAY_MS`
    #[arg(long, env = "REGISTRATION_DELAY_MS", default_value_t = 1_000)]
    pub registration_delay_ms: u64,

    /// Upper bound on how long in-flight calls may run after a shutdown
    /// signal. Unset waits for them indefinitely.
    ///
    /// Environment variable: `DRAIN_TIMEOUT_SECS`
    #[arg(long, env = "DRAIN_TIMEOUT_SECS")]
    pub drain_timeout_secs: Option<u64>,

    /// Per-request timeout for registry calls.
    ///
    /// Environment variable: `REGISTRY_TIMEOUT_MS`
    #[arg(long, env = "REGISTRY_TIMEOUT_MS", default_value_t = 3_000)]
    pub registry_timeout_ms: u64,

    /// Directory holding cached configuration blobs.
    ///
    /// Environment variable: `CONFIG_CACHE_DIR`
    #[arg(long, env = "CONFIG_CACHE_DIR", default_value_t = String::from(micsrv_registry::DEFAULT_CACHE_DIR))]
    pub config_cache_dir: String,

    /// Configuration blob to load from the registry (or its disk cache)
    /// before serving. Startup fails if neither has it.
    ///
    /// Environment variable: `CONFIG_NAME`
    #[arg(long, env = "CONFIG_NAME")]
    pub config_name: Option<String>,
}

/// Settings the [`ServiceRuntime`](crate::server::runtime::ServiceRuntime)
/// needs. Everything else about the process lives in [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen_addr: String,
    pub service_name: String,
    pub service_version: String,
    pub advertise_host: Option<String>,
    pub max_ids_per_request: usize,
    pub registration_delay: Duration,
    pub drain_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".to_string(),
            service_name: "micsrv".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            advertise_host: None,
            max_ids_per_request: 100_000,
            registration_delay: Duration::from_secs(1),
            drain_timeout: None,
        }
    }
}

impl RuntimeConfig {
    /// The address handed to the registry for a listener on `port`.
    pub fn advertised_address(&self, port: u16) -> String {
        match &self.advertise_host {
            Some(host) => format!("{host}:{port}"),
            None => port.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub runtime: RuntimeConfig,
    /// Always present so configuration can still come from the disk cache;
    /// registration only happens when it carries an address.
    pub registry: RegistryConfig,
    pub partition: i64,
    pub config_name: Option<String>,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.listen_addr.trim().is_empty() {
            bail!("LISTEN_ADDR must not be empty");
        }

        if args.service_name.trim().is_empty() {
            bail!("SERVICE_NAME must not be empty");
        }

        if args.max_ids_per_request == 0 {
            bail!("MAX_IDS_PER_REQUEST must be greater than 0");
        }

        if args.registry_timeout_ms == 0 {
            bail!("REGISTRY_TIMEOUT_MS must be greater than 0");
        }

        let advertise_host = args
            .advertise_host
            .map(|host| host.trim().to_string())
            .filter(|host| !host.is_empty());

        let registry = RegistryConfig::new(
            args.registry_addr.unwrap_or_default(),
            args.registry_secret,
        )
        .with_timeout(Duration::from_millis(args.registry_timeout_ms))
        .with_cache_dir(args.config_cache_dir);

        Ok(Self {
            runtime: RuntimeConfig {
                listen_addr: args.listen_addr,
                service_name: args.service_name,
                service_version: args.service_version,
                advertise_host,
                max_ids_per_request: args.max_ids_per_request,
                registration_delay: Duration::from_millis(args.registration_delay_ms),
                drain_timeout: args.drain_timeout_secs.map(Duration::from_secs),
            },
            registry,
            partition: args.partition,
            config_name: args.config_name.filter(|name| !name.is_empty()),
        })
    }
}
