use crate::SnowflakeId;

/// Represents the result of a single, non-blocking allocation step.
///
/// - [`IdGenStatus::Ready`] indicates a new id was minted.
/// - [`IdGenStatus::Pending`] means no id can be minted until the clock reads
///   at least `yield_until`, either because the sequence for the current
///   millisecond is used up or because the clock is behind the last
///   timestamp handed out.
///
/// [`IdAllocator`](crate::IdAllocator) turns `Pending` into a short sleep and
/// retries; the step itself never blocks, which keeps it testable with a
/// scripted clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdGenStatus {
    /// A unique id was generated and is ready to use.
    Ready {
        /// The generated id.
        id: SnowflakeId,
    },
    /// No id could be generated for the current clock reading.
    Pending {
        /// The earliest timestamp (inclusive) at which generation may resume.
        yield_until: u64,
    },
}
