use thiserror::Error;

/// Result alias for fallible aggregation operations.
pub type Result<T> = std::result::Result<T, AggregateError>;

/// Errors raised by the aggregation core.
///
/// Ingest never propagates errors to the caller. Capacity misses are
/// counted as dropped samples, and decode failures can only surface
/// during flush, where they abort the affected database and are logged.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// An element id landed past the block allocator's fixed table.
    #[error("element id {id} exceeds allocator capacity of {max_blocks} blocks")]
    CapacityExceeded { id: u32, max_blocks: usize },

    /// A key byte sequence could not be decoded back into a snapshot.
    #[error("key decode failed at byte {offset}: {reason}")]
    Decode { offset: usize, reason: &'static str },

    /// The host framework could not synthesize a key node path.
    #[error("host rejected key node synthesis")]
    HostRejection,

    /// The service configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}
