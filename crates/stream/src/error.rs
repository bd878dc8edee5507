use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Streaming failure taxonomy. None of these are fatal: a bad asset
/// degrades one cell's visuals, never the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Archive path or record id absent. Placeholder substituted.
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed asset bytes. Placeholder substituted.
    #[error("decode failed: {0}")]
    Decode(String),
    /// Completed work for a cell that was unloaded in the meantime.
    /// Discarded silently, not an error condition worth logging.
    #[error("stale result")]
    Stale,
}

/// Deduplicating, rate-limited failure logger.
///
/// The first failure for a given key logs at warn; repeats are only
/// counted and flushed as one summary line per interval, so a missing
/// mesh referenced by hundreds of placements cannot flood the log.
pub struct LogLimiter {
    seen: HashSet<String>,
    suppressed: u64,
    last_summary: Instant,
    interval: Duration,
}

impl LogLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            seen: HashSet::new(),
            suppressed: 0,
            last_summary: Instant::now(),
            interval,
        }
    }

    /// Report a failure for a key. Returns true if this occurrence should
    /// be logged by the caller.
    pub fn should_log(&mut self, key: &str) -> bool {
        if self.seen.insert(key.to_owned()) {
            return true;
        }
        self.suppressed += 1;
        if self.last_summary.elapsed() >= self.interval && self.suppressed > 0 {
            tracing::warn!(
                suppressed = self.suppressed,
                unique_ids = self.seen.len(),
                "repeated streaming failures suppressed"
            );
            self.suppressed = 0;
            self.last_summary = Instant::now();
        }
        false
    }

    pub fn unique_failures(&self) -> usize {
        self.seen.len()
    }
}

impl Default for LogLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
