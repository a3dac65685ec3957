//! # Shared Types and Constants
//!
//! The allocator, clock and protocol names every micsrv crate agrees on.
//!
//! - [`Clock`] - The time source embedded into ids (system wall clock)
//! - [`EPOCH`] - Zero point for id timestamps
//! - [`Allocator`] - The process-wide allocator the runtime hands to its
//!   handlers
//! - [`GRPC_PROTOCOL`] - Protocol tag under which gRPC runtimes register

use micsrv_id::{IdAllocator, MICSRV_EPOCH, WallClock};

/// The system clock used by the allocator for timestamp encoding.
pub type Clock = WallClock;

/// The epoch offset used as the zero-point for id timestamps.
pub const EPOCH: core::time::Duration = MICSRV_EPOCH;

/// The allocator type shared by the runtime and its handlers.
pub type Allocator = IdAllocator<Clock>;

/// Protocol tag for gRPC runtimes, used in registration and discovery keys.
pub const GRPC_PROTOCOL: &str = "grpc";

/// Partition used when nothing else is configured.
pub const DEFAULT_PARTITION: i64 = 1023;

/// Builds an allocator on the shared clock and epoch.
pub fn new_allocator(partition_hint: i64) -> Allocator {
    Allocator::new(partition_hint, Clock::with_epoch(EPOCH))
}
