use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Allocator epoch: Thursday, July 1, 2021 00:00:00 UTC
///
/// 41 timestamp bits starting here last until roughly 2090.
pub const MICSRV_EPOCH: Duration = Duration::from_millis(1_625_068_800_000);

/// A trait for time sources that return a millisecond timestamp relative to
/// some origin.
///
/// This abstraction allows you to plug in the system wall clock or a mocked
/// time source in tests. Implementations are *not* required to be monotonic:
/// the allocator copes with a clock that steps backwards.
///
/// # Example
///
/// ```
/// use micsrv_id::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn current_millis(&self) -> u64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.current_millis(), 1234);
/// ```
pub trait TimeSource {
    /// Returns the current time in milliseconds since the configured epoch.
    fn current_millis(&self) -> u64;
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }
}

/// The system wall clock, offset to a fixed epoch.
///
/// Every call reads `SystemTime::now()`, so NTP steps and manual clock changes
/// are visible to the allocator. Times earlier than the epoch read as `0`.
#[derive(Clone, Copy, Debug)]
pub struct WallClock {
    epoch_ms: u64,
}

impl Default for WallClock {
    /// Constructs a wall clock aligned to [`MICSRV_EPOCH`].
    fn default() -> Self {
        Self::with_epoch(MICSRV_EPOCH)
    }
}

impl WallClock {
    /// Constructs a wall clock whose zero point is `epoch`, given as a
    /// [`Duration`] since 1970-01-01 UTC.
    pub const fn with_epoch(epoch: Duration) -> Self {
        Self {
            epoch_ms: epoch.as_millis() as u64,
        }
    }

    pub const fn epoch_millis(&self) -> u64 {
        self.epoch_ms
    }
}

impl TimeSource for WallClock {
    fn current_millis(&self) -> u64 {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        since_unix.saturating_sub(self.epoch_ms)
    }
}
