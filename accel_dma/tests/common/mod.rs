//! Common test utilities for accel_dma integration tests.

#![allow(dead_code)]

use std::time::Duration;

use accel_dma::sim::{Access, Fabric, MemoryRegion, SimChannel};
use accel_dma::{Endpoint, EndpointAddress, EndpointConfig, FabricConfig};

/// Install a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fabric with zero latency.
pub fn fabric() -> Fabric {
    init_tracing();
    Fabric::new(FabricConfig::default()).expect("failed to start fabric")
}

/// Fabric that sleeps `latency` after every copied segment.
pub fn slow_fabric(latency: Duration) -> Fabric {
    init_tracing();
    Fabric::new(FabricConfig::default().with_segment_latency(latency))
        .expect("failed to start fabric")
}

/// Endpoint bound to `port` on the local node.
pub fn bound(fabric: &Fabric, port: u16) -> (Endpoint<SimChannel>, EndpointAddress) {
    let ep = fabric.endpoint();
    let addr = EndpointAddress::local(port);
    ep.bind(addr).expect("bind failed");
    (ep, addr)
}

/// Endpoint bound to `port` with a custom configuration.
pub fn bound_with_config(
    fabric: &Fabric,
    port: u16,
    config: EndpointConfig,
) -> (Endpoint<SimChannel>, EndpointAddress) {
    let ep = fabric.endpoint_with_config(config);
    let addr = EndpointAddress::local(port);
    ep.bind(addr).expect("bind failed");
    (ep, addr)
}

/// Fully accessible region of `len` bytes.
pub fn region(ep: &Endpoint<SimChannel>, len: usize) -> MemoryRegion {
    ep.channel()
        .alloc_region(len, Access::all())
        .expect("alloc_region failed")
}

/// Region holding `values` as consecutive `i32`s.
pub fn int_region(ep: &Endpoint<SimChannel>, values: &[i32]) -> MemoryRegion {
    let region = region(ep, values.len() * 4);
    // Fresh region; nothing can be transferring into it yet.
    unsafe { region.write_slice(0, values) };
    region
}

/// Byte pattern that differs from its neighbours at every offset.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

/// Unique shared-memory name for a test.
pub fn shm_name(prefix: &str) -> String {
    format!("/{}-{}", prefix, uuid::Uuid::now_v7())
}
