//! Stream aggregation: accumulate deltas and decide when to flush.
//!
//! Deltas are appended to a single buffer. A flush is due once the buffer has
//! changed and at least `flush_interval` has passed since the last flush; the
//! end of the stream always flushes. Each flush renders the buffer into
//! chunks with [`split_into_chunks`].

use std::time::Duration;

use tokio::time::Instant;

/// Split text into consecutive chunks of at most `max_chars` characters.
///
/// Chunks never overlap and never leave gaps, so concatenating them yields
/// the input. Splits fall on character boundaries. Empty input yields no
/// chunks.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;

    for ch in text.chars() {
        if count == max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Accumulates streamed text and paces flushes.
#[derive(Debug)]
pub struct StreamAggregator {
    accumulated: String,
    last_flush_at: Instant,
    flush_interval: Duration,
    dirty: bool,
}

impl StreamAggregator {
    /// Start aggregating. The flush clock starts now.
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            accumulated: String::new(),
            last_flush_at: Instant::now(),
            flush_interval,
            dirty: false,
        }
    }

    /// Append a delta. Empty deltas are ignored.
    pub fn push(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.accumulated.push_str(delta);
        self.dirty = true;
    }

    /// Everything accumulated so far.
    pub fn text(&self) -> &str {
        &self.accumulated
    }

    /// Whether text arrived since the last flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether a timed flush is due at `now`.
    pub fn should_flush(&self, now: Instant) -> bool {
        self.dirty && now.saturating_duration_since(self.last_flush_at) >= self.flush_interval
    }

    /// Earliest instant at which the next timed flush may happen.
    pub fn next_flush_at(&self) -> Instant {
        self.last_flush_at + self.flush_interval
    }

    /// Record that the current text has been delivered.
    pub fn mark_flushed(&mut self, now: Instant) {
        self.last_flush_at = now;
        self.dirty = false;
    }

    pub fn into_text(self) -> String {
        self.accumulated
    }
}
