//! Observability: metrics for mapped memory managers.
//!
//! Logging goes through `tracing` directly at the call sites. This module
//! holds the `metrics-rs` side:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `mapped_memory_allocated_bytes` | Gauge | Shared memory reserved by all chunks |
//! | `mapped_memory_bytes_in_use` | Gauge | Bytes handed out and not yet freed |
//! | `mapped_memory_chunks` | Gauge | Live chunks |
//! | `mapped_memory_chunks_created` | Counter | Chunks created |
//! | `mapped_memory_chunks_freed` | Counter | Idle chunks released |
//! | `mapped_memory_alloc_failures` | Counter | Allocations refused by limits |
//! | `mapped_memory_fence_waits` | Counter | Allocations that waited on a token |
//! | `mapped_memory_fence_wait_time_ns` | Histogram | Time in the waiting pass |
//!
//! Every metric carries a `manager` label.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mapped_memory::observability::init_metrics;
//!
//! // Describe metrics once at startup, then install any metrics exporter.
//! init_metrics();
//! ```

mod metrics;

pub use metrics::{AllocatorMetrics, WaitTimer, init_metrics};
