use anyhow::Context;
use clap::Parser;
use micsrv_core::types::new_allocator;
use micsrv_registry::RegistryClient;
use micsrv_server::server::{
    config::{CliArgs, ServerConfig},
    error::RuntimeError,
    runtime::ServiceRuntime,
    telemetry::init_telemetry,
};
use std::sync::Arc;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry(&config.runtime.service_name)?;
    let result = run(config).await;
    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "exiting");
    }
    providers.shutdown();
    result
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    log_startup_info(&config);

    let registry = Arc::new(RegistryClient::new(config.registry.clone())?);

    if let Some(name) = &config.config_name {
        let blob = registry
            .config(name)
            .await
            .with_context(|| format!("loading configuration `{name}`"))?;
        tracing::info!(name, bytes = blob.len(), "configuration loaded");
    }

    let allocator = Arc::new(new_allocator(config.partition));
    let bound = ServiceRuntime::new(config.runtime, allocator)
        .with_registry(registry)
        .bind()
        .await?;
    let handle = bound.handle();

    let result = bound.serve().await;
    if !matches!(result, Err(RuntimeError::Registration(_))) {
        handle.unregister().await;
    }
    result?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting micsrv runtime with full config: {:#?}", config);
    } else {
        tracing::info!(
            listen_addr = %config.runtime.listen_addr,
            service = %config.runtime.service_name,
            partition = config.partition,
            registry = config.registry.is_configured(),
            "Starting micsrv runtime"
        );
    }
}
