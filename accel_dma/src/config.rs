//! Configuration types for accel_dma.

use std::time::Duration;

/// Spin iterations before a wait falls back to blocking.
pub const DEFAULT_SPIN_BOUND: u32 = 5000;

/// Longest single blocking sleep before a waiter re-polls.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_millis(10);

/// Default depth of the simulated engine's command queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Per-endpoint configuration.
///
/// Controls the two-tier wait: spin on `poll` for low latency, then block to
/// stop burning CPU on long transfers.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Number of `poll` iterations before blocking.
    /// Default: 5000
    pub spin_bound: u32,
    /// Upper bound on one blocking sleep before re-polling.
    /// Default: 10 ms
    pub block_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            spin_bound: DEFAULT_SPIN_BOUND,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }
}

impl EndpointConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the spin bound.
    pub fn with_spin_bound(mut self, spin_bound: u32) -> Self {
        self.spin_bound = spin_bound;
        self
    }

    /// Set the blocking timeout.
    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }
}

/// Configuration of the simulated fabric.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Delay applied after each copied segment.
    /// Default: zero
    pub segment_latency: Duration,
    /// Commands the engine queue holds before `issue` blocks.
    /// Default: 1024
    pub queue_depth: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            segment_latency: Duration::ZERO,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl FabricConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-segment latency.
    pub fn with_segment_latency(mut self, segment_latency: Duration) -> Self {
        self.segment_latency = segment_latency;
        self
    }

    /// Set the engine queue depth.
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth.max(1);
        self
    }
}
