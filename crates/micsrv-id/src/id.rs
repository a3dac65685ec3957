use core::fmt;

/// A 64-bit partitioned Snowflake id.
///
/// - 1 bit reserved (always zero, so the id is a positive `i64` too)
/// - 10 bits partition (datacenter / shard)
/// - 41 bits timestamp (ms since [`MICSRV_EPOCH`])
/// - 12 bits sequence
///
/// ```text
///  Bit Index:  63           63 62             53 52             12 11             0
///              +--------------+-----------------+-----------------+---------------+
///  Field:      | reserved (1) | partition (10)  | timestamp (41)  | sequence (12) |
///              +--------------+-----------------+-----------------+---------------+
///              |<----------- MSB ---------- 64 bits ----------- LSB ------------>|
/// ```
///
/// Because the partition sits above the timestamp, ids are time-ordered
/// *within* a partition only.
///
/// [`MICSRV_EPOCH`]: crate::MICSRV_EPOCH
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnowflakeId {
    id: u64,
}

impl SnowflakeId {
    /// Bitmask for the 10-bit partition field. Occupies bits 53 through 62.
    pub const PARTITION_MASK: u64 = (1 << 10) - 1;

    /// Bitmask for the 41-bit timestamp field. Occupies bits 12 through 52.
    pub const TIMESTAMP_MASK: u64 = (1 << 41) - 1;

    /// Bitmask for the 12-bit sequence field. Occupies bits 0 through 11.
    pub const SEQUENCE_MASK: u64 = (1 << 12) - 1;

    pub const PARTITION_SHIFT: u64 = 53;
    pub const TIMESTAMP_SHIFT: u64 = 12;
    pub const SEQUENCE_SHIFT: u64 = 0;

    /// Number of distinct partitions (`0..PARTITION_COUNT`).
    pub const PARTITION_COUNT: u64 = Self::PARTITION_MASK + 1;

    /// Packs the three fields. Each field is masked to its width.
    pub const fn from_components(partition: u64, timestamp: u64, sequence: u64) -> Self {
        let partition = (partition & Self::PARTITION_MASK) << Self::PARTITION_SHIFT;
        let timestamp = (timestamp & Self::TIMESTAMP_MASK) << Self::TIMESTAMP_SHIFT;
        let sequence = (sequence & Self::SEQUENCE_MASK) << Self::SEQUENCE_SHIFT;
        Self {
            id: partition | timestamp | sequence,
        }
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self { id: raw }
    }

    pub const fn to_raw(&self) -> u64 {
        self.id
    }

    pub const fn partition(&self) -> u64 {
        (self.id >> Self::PARTITION_SHIFT) & Self::PARTITION_MASK
    }

    pub const fn timestamp(&self) -> u64 {
        (self.id >> Self::TIMESTAMP_SHIFT) & Self::TIMESTAMP_MASK
    }

    pub const fn sequence(&self) -> u64 {
        (self.id >> Self::SEQUENCE_SHIFT) & Self::SEQUENCE_MASK
    }

    pub const fn max_sequence() -> u64 {
        Self::SEQUENCE_MASK
    }

    /// The `(timestamp, sequence)` pair, which is what orders ids minted by
    /// a single allocator regardless of partition changes.
    pub const fn ordering_key(&self) -> (u64, u64) {
        (self.timestamp(), self.sequence())
    }

    /// Maps any partition hint into `0..PARTITION_COUNT`.
    ///
    /// Negative and oversized hints wrap instead of being rejected.
    pub const fn normalize_partition(hint: i64) -> u64 {
        hint.rem_euclid(Self::PARTITION_COUNT as i64) as u64
    }
}

impl From<SnowflakeId> for u64 {
    fn from(id: SnowflakeId) -> Self {
        id.to_raw()
    }
}

impl fmt::Display for SnowflakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for SnowflakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnowflakeId")
            .field("id", &self.id)
            .field("partition", &self.partition())
            .field("timestamp", &self.timestamp())
            .field("sequence", &self.sequence())
            .finish()
    }
}
