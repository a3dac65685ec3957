//! gRPC service implementation for health checks and id allocation.
//!
//! [`CoreHandler`] implements the [`CoreService`] trait generated from
//! `proto/micsrv.proto`. It owns nothing but a handle to the process-wide
//! allocator, so cloning it per connection is cheap.

use crate::server::telemetry::{increment_ids_allocated, record_ids_per_request};
use micsrv_core::{
    Error,
    proto::{
        AllocateManyRequest, AllocateManyResponse, AllocateOneRequest, AllocateOneResponse,
        HealthRequest, HealthResponse,
        core_service_server::{CoreService, CoreServiceServer},
    },
    types::Allocator,
};
use std::sync::Arc;
use tonic::{Request, Response, Status, codec::CompressionEncoding};

#[derive(Clone)]
pub struct CoreHandler {
    allocator: Arc<Allocator>,
    max_ids_per_request: usize,
}

impl CoreHandler {
    pub fn new(allocator: Arc<Allocator>, max_ids_per_request: usize) -> Self {
        Self {
            allocator,
            max_ids_per_request,
        }
    }

    /// Wraps the handler in its generated server with compression enabled.
    pub fn into_server(self) -> CoreServiceServer<Self> {
        CoreServiceServer::new(self)
            .send_compressed(CompressionEncoding::Zstd)
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Zstd)
            .accept_compressed(CompressionEncoding::Gzip)
    }

    /// Runs the allocation on the blocking pool: a batch may sleep through
    /// exhausted milliseconds or a clock step while holding the allocator
    /// lock.
    async fn allocate(&self, partition_hint: i64, count: usize) -> Result<Vec<u64>, Error> {
        let allocator = Arc::clone(&self.allocator);
        let ids = tokio::task::spawn_blocking(move || allocator.allocate(partition_hint, count))
            .await
            .map_err(|e| Error::Allocation {
                context: e.to_string(),
            })?;
        increment_ids_allocated(ids.len() as u64);
        Ok(ids)
    }
}

#[tonic::async_trait]
impl CoreService for CoreHandler {
    async fn health(
        &self,
        _req: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        tracing::debug!("health check ok");
        Ok(Response::new(HealthResponse {
            code: 0,
            message: "OK".to_string(),
        }))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(partition_hint = req.get_ref().partition_hint))]
    async fn allocate_one(
        &self,
        req: Request<AllocateOneRequest>,
    ) -> Result<Response<AllocateOneResponse>, Status> {
        let ids = self.allocate(req.into_inner().partition_hint, 1).await?;
        let id = ids.first().copied().ok_or_else(|| Error::Allocation {
            context: "allocator returned no id".to_string(),
        })?;
        Ok(Response::new(AllocateOneResponse { id }))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(partition_hint = req.get_ref().partition_hint, count = req.get_ref().count))]
    async fn allocate_many(
        &self,
        req: Request<AllocateManyRequest>,
    ) -> Result<Response<AllocateManyResponse>, Status> {
        let AllocateManyRequest {
            partition_hint,
            count,
        } = req.into_inner();
        let count = count as usize;

        if count > self.max_ids_per_request {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "Count {count} exceeds maximum allowed ({})",
                    self.max_ids_per_request
                ),
            }
            .into());
        }

        record_ids_per_request(count as f64);
        if count == 0 {
            return Ok(Response::new(AllocateManyResponse { ids: Vec::new() }));
        }

        let ids = self.allocate(partition_hint, count).await?;
        Ok(Response::new(AllocateManyResponse { ids }))
    }
}
