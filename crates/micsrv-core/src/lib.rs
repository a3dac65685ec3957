#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
// Public re-export so downstream crates can reach the allocator through
// `micsrv_core::micsrv_id`
pub use micsrv_id;

/// gRPC service and message definitions generated from `proto/micsrv.proto`.
///
/// ## Service
///
/// - `CoreService::health` - fixed `{ code: 0, message: "OK" }` while the
///   runtime is up.
/// - `CoreService::allocate_one` / `CoreService::allocate_many` - ids from the
///   runtime's allocator.
///
/// Ids are carried as `uint64`. The reserved top bit is always clear, so they
/// decode identically as `int64` for clients that use signed ids.
pub mod proto {
    tonic::include_proto!("micsrv");

    /// Encoded descriptor set for `tonic-reflection`.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("micsrv_descriptor");
}
