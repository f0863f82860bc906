//! Engine tuning knobs

use std::time::Duration;

/// Configuration shared by the peer-side pipeline and the coordinator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Block size for the delta signature index.
    pub delta_block_size: u32,
    /// Files at or below this size are batched into archives.
    pub small_file_limit: u64,
    /// An archive is flushed before a file that would push it past this size.
    pub archive_max_size: u64,
    /// An archive open longer than this is flushed.
    pub archive_window: Duration,
    /// A report bucket is sent once it holds this many ids.
    pub report_bucket_limit: usize,
    /// A report bucket older than this is sent regardless of fill.
    pub report_bucket_age: Duration,
    /// One network call carries at most this many ids.
    pub report_chunk_size: usize,
    /// Concurrent outbound transfers.
    pub upload_concurrency: usize,
    /// Concurrent in-flight archive finalizations.
    pub pack_concurrency: usize,
    /// Bounded wait for the coordinator session lock.
    pub lock_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delta_block_size: 1024,
            small_file_limit: 200 * 1024,
            archive_max_size: 50 * 1024 * 1024,
            archive_window: Duration::from_secs(15),
            report_bucket_limit: 100,
            report_bucket_age: Duration::from_secs(15),
            report_chunk_size: 200,
            upload_concurrency: 2,
            pack_concurrency: 2,
            lock_wait: Duration::from_secs(10),
        }
    }
}
