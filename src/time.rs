use std::time::SystemTime;

/// Seconds of unix time. Feeds the cipher bucket and the resolver cache
/// stamps; a clock set before the epoch reads as zero rather than panicking.
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|lapsed| lapsed.as_secs())
        .unwrap_or(0)
}
