#![allow(dead_code)]

use gpu_addresses::VirtualAddress;
use gpu_driver::sim::SimulatedGpu;
use gpu_driver::{Device, DriverConfig, ObjectFlags, VspaceId};
use std::sync::Arc;

pub const MIB: u64 = 1 << 20;

/// 32 MiB of VRAM with an 8 MiB budget and short hardware timeouts.
pub fn config() -> DriverConfig {
    DriverConfig::default()
        .with_vram_size(32 * MIB)
        .with_instance_size(4 * MIB)
        .with_vram_budget(8 * MIB)
        .with_pause_timeout_ms(200)
        .with_fence_timeout_ms(200)
        .with_flush_timeout_ms(200)
}

pub fn device(config: DriverConfig) -> (Arc<SimulatedGpu>, Device) {
    let gpu = Arc::new(SimulatedGpu::new());
    let dev = Device::new(config, gpu.clone()).expect("device");
    (gpu, dev)
}

pub fn swappable() -> ObjectFlags {
    ObjectFlags::new().with_swappable(true)
}

pub fn pattern(len: u64, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 12) as u8)
        .collect()
}

/// Fill `[va, va + len)` with a seeded pattern and return it.
pub fn fill(dev: &Device, vs: VspaceId, va: VirtualAddress, len: u64, seed: u8) -> Vec<u8> {
    let data = pattern(len, seed);
    dev.vspace_write(vs, va, &data).expect("write");
    data
}

pub fn read(dev: &Device, vs: VspaceId, va: VirtualAddress, len: u64) -> Vec<u8> {
    let mut buf = vec![0; usize::try_from(len).expect("len")];
    dev.vspace_read(vs, va, &mut buf).expect("read");
    buf
}
