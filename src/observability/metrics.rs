//! Metrics collection using metrics-rs.

use metrics::{Counter, Gauge, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const ALLOCATED_BYTES: &str = "mapped_memory_allocated_bytes";
const BYTES_IN_USE: &str = "mapped_memory_bytes_in_use";
const CHUNKS: &str = "mapped_memory_chunks";
const CHUNKS_CREATED: &str = "mapped_memory_chunks_created";
const CHUNKS_FREED: &str = "mapped_memory_chunks_freed";
const ALLOC_FAILURES: &str = "mapped_memory_alloc_failures";
const FENCE_WAITS: &str = "mapped_memory_fence_waits";
const FENCE_WAIT_TIME_NS: &str = "mapped_memory_fence_wait_time_ns";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_gauge!(
        ALLOCATED_BYTES,
        Unit::Bytes,
        "Shared memory reserved by all chunks of a manager"
    );
    metrics::describe_gauge!(
        BYTES_IN_USE,
        Unit::Bytes,
        "Bytes handed out and not yet freed (pending frees excluded)"
    );
    metrics::describe_gauge!(CHUNKS, Unit::Count, "Number of live chunks");
    metrics::describe_counter!(
        CHUNKS_CREATED,
        Unit::Count,
        "Total number of chunks created"
    );
    metrics::describe_counter!(
        CHUNKS_FREED,
        Unit::Count,
        "Total number of idle chunks returned to the transfer buffer factory"
    );
    metrics::describe_counter!(
        ALLOC_FAILURES,
        Unit::Count,
        "Allocations that could not be satisfied within the configured limits"
    );
    metrics::describe_counter!(
        FENCE_WAITS,
        Unit::Count,
        "Allocations that had to wait on a fence token"
    );
    metrics::describe_histogram!(
        FENCE_WAIT_TIME_NS,
        Unit::Nanoseconds,
        "Time spent in the waiting allocation pass"
    );
}

/// Metrics collector for one mapped memory manager.
///
/// Handles are created once with the manager's name as label.
#[derive(Clone)]
pub struct AllocatorMetrics {
    name: String,
    allocated_bytes: Gauge,
    bytes_in_use: Gauge,
    chunks: Gauge,
    chunks_created: Counter,
    chunks_freed: Counter,
    alloc_failures: Counter,
    fence_waits: Counter,
    fence_wait_time: Histogram,
}

impl AllocatorMetrics {
    /// Create a new collector labelled with `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            allocated_bytes: gauge!(ALLOCATED_BYTES, "manager" => name.to_string()),
            bytes_in_use: gauge!(BYTES_IN_USE, "manager" => name.to_string()),
            chunks: gauge!(CHUNKS, "manager" => name.to_string()),
            chunks_created: counter!(CHUNKS_CREATED, "manager" => name.to_string()),
            chunks_freed: counter!(CHUNKS_FREED, "manager" => name.to_string()),
            alloc_failures: counter!(ALLOC_FAILURES, "manager" => name.to_string()),
            fence_waits: counter!(FENCE_WAITS, "manager" => name.to_string()),
            fence_wait_time: histogram!(FENCE_WAIT_TIME_NS, "manager" => name.to_string()),
        }
    }

    /// Record the manager's current footprint.
    #[inline]
    pub fn record_usage(&self, allocated_bytes: usize, bytes_in_use: usize, chunks: usize) {
        self.allocated_bytes.set(allocated_bytes as f64);
        self.bytes_in_use.set(bytes_in_use as f64);
        self.chunks.set(chunks as f64);
    }

    /// Record a new chunk.
    #[inline]
    pub fn record_chunk_created(&self) {
        self.chunks_created.increment(1);
    }

    /// Record chunks released by `free_unused`.
    #[inline]
    pub fn record_chunks_freed(&self, count: usize) {
        self.chunks_freed.increment(count as u64);
    }

    /// Record an allocation that returned `None`.
    #[inline]
    pub fn record_alloc_failure(&self) {
        self.alloc_failures.increment(1);
    }

    /// Record an allocation satisfied by waiting on a fence.
    #[inline]
    pub fn record_fence_wait(&self) {
        self.fence_waits.increment(1);
    }

    /// Record time spent in the waiting pass.
    #[inline]
    pub fn record_wait_time(&self, duration: Duration) {
        self.fence_wait_time.record(duration.as_nanos() as f64);
    }

    /// Start a timer that records wait time on drop.
    pub fn start_wait_timer(&self) -> WaitTimer<'_> {
        WaitTimer {
            start: Instant::now(),
            metrics: self,
        }
    }

    /// Get the manager name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Guard that records fence wait time when dropped.
pub struct WaitTimer<'a> {
    start: Instant,
    metrics: &'a AllocatorMetrics,
}

impl Drop for WaitTimer<'_> {
    fn drop(&mut self) {
        self.metrics.record_wait_time(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        // Should be idempotent
        init_metrics();
    }

    #[test]
    fn test_allocator_metrics() {
        // No recorder installed: everything is a no-op.
        let metrics = AllocatorMetrics::new("test-manager");

        metrics.record_usage(4096, 1024, 2);
        metrics.record_chunk_created();
        metrics.record_chunks_freed(2);
        metrics.record_alloc_failure();
        metrics.record_fence_wait();

        assert_eq!(metrics.name(), "test-manager");
    }

    #[test]
    fn test_wait_timer() {
        let metrics = AllocatorMetrics::new("timer-test");
        {
            let _timer = metrics.start_wait_timer();
        }
    }
}
