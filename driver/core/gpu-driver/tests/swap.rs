mod common;

use common::{MIB, config, device, fill, read, swappable};
use gpu_driver::sim::SimEvent;
use gpu_driver::{ChannelState, ChunkSet, DriverConfig, DriverError, MemoryClass, ObjectFlags};
use gpu_trace::TraceLogger;
use gpu_vmem::Aperture;
use log::LevelFilter;
use std::time::{Duration, Instant};

/// A (large pages) and B (small pages) fill the 8 MiB budget of one client;
/// C of another client must push exactly one of them to host memory.
#[test]
fn third_object_evicts_exactly_one() {
    let logger = TraceLogger::install(LevelFilter::Info);
    let (_gpu, dev) = device(config());
    let heavy = dev.client_new().unwrap();
    let light = dev.client_new().unwrap();
    let vs = dev.vspace_new(1 << 30).unwrap();

    let a = dev.object_new(heavy, 4 * MIB, MemoryClass::VramLarge, 0, swappable()).unwrap();
    let b = dev.object_new(heavy, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    let va_a = dev.vspace_map(vs, a, 0, 0, false).unwrap();
    let va_b = dev.vspace_map(vs, b, 0, 0, false).unwrap();
    let data_a = fill(&dev, vs, va_a, 4 * MIB, 1);
    let data_b = fill(&dev, vs, va_b, 4 * MIB, 2);
    assert_eq!(dev.stats().usage, 8 * MIB);

    let c = dev.object_new(light, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    let va_c = dev.vspace_map(vs, c, 0, 0, false).unwrap();
    let data_c = fill(&dev, vs, va_c, 4 * MIB, 3);

    let swapped = [a, b].map(|o| dev.object_swapped(o).unwrap());
    assert_eq!(swapped.iter().filter(|s| **s).count(), 1, "{swapped:?}");
    let (evicted, evicted_va) = if swapped[0] { (a, va_a) } else { (b, va_b) };
    assert_eq!(dev.chunk_set(evicted, 0).unwrap(), Some(ChunkSet::Swapped));

    let (_, aperture) = dev.vspace_translate(vs, evicted_va).unwrap();
    assert_eq!(aperture, Aperture::HostSnooped);
    let (_, aperture) = dev.vspace_translate(vs, va_c).unwrap();
    assert_eq!(aperture, Aperture::Vram);

    assert_eq!(read(&dev, vs, va_a, 4 * MIB), data_a);
    assert_eq!(read(&dev, vs, va_b, 4 * MIB), data_b);
    assert_eq!(read(&dev, vs, va_c, 4 * MIB), data_c);

    let stats = dev.stats();
    assert_eq!(stats.usage, 8 * MIB);
    assert_eq!(stats.demand, 8 * MIB);
    assert_eq!(stats.swapped, 4 * MIB);
    assert!(logger.contains("gpu_driver::swap", "evicted"));
}

#[test]
fn evicted_chunk_comes_back_bit_identical() {
    let (_gpu, dev) = device(config());
    let heavy = dev.client_new().unwrap();
    let light = dev.client_new().unwrap();
    let vs = dev.vspace_new(1 << 30).unwrap();

    let a = dev.object_new(heavy, 4 * MIB, MemoryClass::VramLarge, 0, swappable()).unwrap();
    let b = dev.object_new(heavy, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    let va_a = dev.vspace_map(vs, a, 0, 0, false).unwrap();
    let va_b = dev.vspace_map(vs, b, 0, 0, false).unwrap();
    let data_a = fill(&dev, vs, va_a, 4 * MIB, 7);
    let data_b = fill(&dev, vs, va_b, 4 * MIB, 8);

    let c = dev.object_new(light, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    assert_eq!(dev.swap().increase(), 0, "no room while C is live");
    dev.object_free(c).unwrap();

    assert_eq!(dev.swap().increase(), 4 * MIB);
    for (o, va, data) in [(a, va_a, &data_a), (b, va_b, &data_b)] {
        assert!(!dev.object_swapped(o).unwrap());
        assert_eq!(dev.chunk_set(o, 0).unwrap(), Some(ChunkSet::Candidate));
        let (_, aperture) = dev.vspace_translate(vs, va).unwrap();
        assert_eq!(aperture, Aperture::Vram);
        assert_eq!(&read(&dev, vs, va, 4 * MIB), data);
    }
    let stats = dev.stats();
    assert_eq!((stats.usage, stats.demand, stats.swapped), (8 * MIB, 8 * MIB, 0));
}

#[test]
fn passes_converge_on_a_lowered_budget() {
    let (_gpu, dev) = device(config().with_vram_budget(24 * MIB));
    let one = dev.client_new().unwrap();
    let two = dev.client_new().unwrap();
    let vs = dev.vspace_new(1 << 30).unwrap();
    let big = dev.object_new(one, 10 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    let va = dev.vspace_map(vs, big, 0, 0, false).unwrap();
    let data = fill(&dev, vs, va, 10 * MIB, 5);
    for _ in 0..2 {
        dev.object_new(two, 4 * MIB, MemoryClass::VramLarge, 0, swappable()).unwrap();
    }
    assert_eq!(dev.stats().usage, 18 * MIB);

    dev.set_budget(8 * MIB);
    let mut last = dev.swap().required();
    assert_eq!(last, 10 * MIB);
    for _ in 0..8 {
        let swap = dev.swap();
        swap.reduce(swap.required());
        let now = swap.required();
        assert!(now <= last, "pressure grew from {last:x} to {now:x}");
        last = now;
        if now == 0 {
            break;
        }
    }
    assert_eq!(last, 0);

    for client in [one, two] {
        let s = dev.client_stats(client).unwrap();
        assert_eq!(s.sets.pending, 0);
    }
    let sets_one = dev.client_stats(one).unwrap().sets;
    assert_eq!(sets_one.candidates + sets_one.swapped, 3);
    assert_eq!(read(&dev, vs, va, 10 * MIB), data);
}

#[test]
fn dma_fault_is_retried_with_another_draw() {
    let (gpu, dev) = device(config());
    let heavy = dev.client_new().unwrap();
    let light = dev.client_new().unwrap();
    let a = dev.object_new(heavy, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    let b = dev.object_new(heavy, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();

    gpu.fail_dma(1);
    dev.object_new(light, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    let swapped = [a, b].iter().filter(|o| dev.object_swapped(**o).unwrap()).count();
    assert_eq!(swapped, 1);
    assert_eq!(dev.stats().swapped, 4 * MIB);
    assert_eq!(gpu.host_pages_live(), 1024);
}

#[test]
fn persistent_dma_faults_fail_the_allocation() {
    let (gpu, dev) = device(config());
    let heavy = dev.client_new().unwrap();
    let light = dev.client_new().unwrap();
    let a = dev.object_new(heavy, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    let b = dev.object_new(heavy, 4 * MIB, MemoryClass::VramLarge, 0, swappable()).unwrap();

    gpu.fail_dma(u32::MAX);
    assert_eq!(
        dev.object_new(light, 4 * MIB, MemoryClass::VramSmall, 0, swappable()),
        Err(DriverError::OutOfMemory)
    );
    gpu.fail_dma(0);

    let stats = dev.stats();
    assert_eq!((stats.usage, stats.demand, stats.swapped), (8 * MIB, 8 * MIB, 0));
    assert_eq!(dev.client_stats(light).unwrap().demand, 0);
    for o in [a, b] {
        assert_eq!(dev.chunk_set(o, 0).unwrap(), Some(ChunkSet::Candidate));
    }
    assert_eq!(gpu.host_pages_live(), 0);
}

/// The derived budget must trip eviction before the allocator runs dry.
#[test]
fn default_budget_swaps_before_vram_runs_out() {
    let config = DriverConfig::default();
    let (gpu, dev) = device(config);
    assert_eq!(dev.stats().budget, config.object_vram());
    let client = dev.client_new().unwrap();
    let count = config.object_vram() / (4 * MIB) + 10;
    let mut objects = Vec::new();
    for _ in 0..count {
        objects.push(dev.object_new(client, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap());
    }
    let stats = dev.stats();
    assert!(stats.swapped >= 10 * 4 * MIB, "{stats:?}");
    assert!(stats.usage <= stats.budget);
    assert!(gpu.host_pages_live() >= 10 * 1024);
    let swapped = objects.iter().filter(|o| dev.object_swapped(**o).unwrap()).count();
    assert!(swapped >= 10);
}

/// Fragmentation can exhaust the allocator below the budget; eviction then
/// opens a hole instead of failing the allocation.
#[test]
fn fragmented_vram_is_relieved_by_eviction() {
    let config = config().with_chunk_size(0);
    let (_gpu, dev) = device(config);
    dev.set_budget(config.object_vram());
    let client = dev.client_new().unwrap();
    let objects: Vec<_> = (0..6)
        .map(|_| dev.object_new(client, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap())
        .collect();
    for o in objects.iter().skip(1).step_by(2) {
        dev.object_free(*o).unwrap();
    }
    assert!(dev.stats().vram_free >= 8 * MIB);

    let pinned = ObjectFlags::new().with_contiguous(true);
    let big = dev.object_new(client, 8 * MIB, MemoryClass::VramSmall, 0, pinned).unwrap();
    assert!(!dev.object_swapped(big).unwrap());
    assert!(dev.stats().swapped >= 4 * MIB);
    assert_eq!(
        dev.object_new(client, 64 * MIB, MemoryClass::VramSmall, 0, pinned),
        Err(DriverError::OutOfMemory)
    );
}

#[test]
fn oversized_budget_is_clamped_to_object_vram() {
    let config = config();
    let (_gpu, dev) = device(config);
    dev.set_budget(1 << 40);
    assert_eq!(dev.stats().budget, config.object_vram());
    dev.set_budget(MIB);
    assert_eq!(dev.stats().budget, MIB);
}

#[test]
fn pinned_objects_are_never_evicted() {
    let (_gpu, dev) = device(config());
    let heavy = dev.client_new().unwrap();
    let light = dev.client_new().unwrap();
    let pinned = dev.object_new(heavy, 8 * MIB, MemoryClass::VramSmall, 0, ObjectFlags::new()).unwrap();
    assert_eq!(dev.chunk_set(pinned, 0).unwrap(), None);
    assert_eq!(
        dev.object_new(light, 4 * MIB, MemoryClass::VramSmall, 0, swappable()),
        Err(DriverError::OutOfMemory)
    );
    assert!(!dev.object_swapped(pinned).unwrap());
}

/// The second space refuses the commit that points it at host memory and
/// the commit that points it back; only that space's channel is failed and
/// the copy it may still reach is never freed.
#[test]
fn refused_rollback_strands_the_space_and_fails_its_channel() {
    let logger = TraceLogger::install(LevelFilter::Info);
    let (gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let one = dev.vspace_new(1 << 30).unwrap();
    let two = dev.vspace_new(1 << 30).unwrap();
    let obj = dev.object_new(client, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    let va_one = dev.vspace_map(one, obj, 0, 0, false).unwrap();
    let va_two = dev.vspace_map(two, obj, 0, 0, false).unwrap();
    let data = fill(&dev, one, va_one, 4 * MIB, 9);

    let mut chans = Vec::new();
    for vs in [one, two] {
        let chan = dev.chan_new(vs).unwrap();
        let ib = dev.object_new(client, 0x1000, MemoryClass::HostSnooped, 0, ObjectFlags::new()).unwrap();
        dev.chan_init_submission(chan, ib, 9).unwrap();
        chans.push(chan);
    }
    let ib_pages = gpu.host_pages_live();

    dev.set_budget(2 * MIB);
    gpu.fail_flushes(2, 2);
    assert_eq!(dev.swap().reduce(dev.swap().required()), 4 * MIB);

    assert!(logger.contains("gpu_driver::swap", "stranded"));
    assert_eq!(dev.chan_state(chans[0]).unwrap(), ChannelState::Running);
    assert_eq!(dev.chan_state(chans[1]).unwrap(), ChannelState::Failed);
    assert!(dev.object_swapped(obj).unwrap(), "the next draw succeeded");
    assert_eq!(gpu.host_pages_live(), ib_pages + 2 * 1024, "stranded copy kept");
    assert_eq!(dev.stats().swapped, 4 * MIB);
    assert_eq!(read(&dev, two, va_two, 4 * MIB), data);
}

#[test]
fn migration_is_bracketed_by_quiescence() {
    let (gpu, dev) = device(config());
    let heavy = dev.client_new().unwrap();
    let light = dev.client_new().unwrap();
    let vs = dev.vspace_new(1 << 30).unwrap();
    let a = dev.object_new(heavy, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    let b = dev.object_new(heavy, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    dev.vspace_map(vs, a, 0, 0, false).unwrap();
    dev.vspace_map(vs, b, 0, 0, false).unwrap();

    let chan = dev.chan_new(vs).unwrap();
    let ib = dev.object_new(heavy, 0x1000, MemoryClass::HostSnooped, 0, ObjectFlags::new()).unwrap();
    dev.chan_init_submission(chan, ib, 9).unwrap();
    dev.chan_submit(chan, 4).unwrap();
    gpu.clear_events();

    dev.object_new(light, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();

    let slot = chan.index();
    let events = gpu.events();
    let pos = |want: &dyn Fn(&SimEvent) -> bool| events.iter().position(want);
    let halt = pos(&|e| *e == SimEvent::Halt(slot)).expect("halted");
    let first_copy = pos(&|e| matches!(e, SimEvent::Copy { .. })).expect("copied");
    let last_copy = events.iter().rposition(|e| matches!(e, SimEvent::Copy { .. })).unwrap();
    let resume = pos(&|e| *e == SimEvent::Resume(slot)).expect("resumed");
    let barrier = pos(&|e| matches!(e, SimEvent::Fence { chan: c, .. } if *c == slot)).expect("fenced");
    assert!(barrier < halt);
    assert!(halt < first_copy);
    assert!(last_copy < resume);
    assert!(
        events[last_copy..resume]
            .iter()
            .any(|e| matches!(e, SimEvent::Invalidate(_))),
        "PTEs rewritten before resume"
    );
    assert_eq!(dev.chan_state(chan).unwrap(), ChannelState::Running);
    assert!(!gpu.is_halted(slot));
}

#[test]
fn quiescence_timeout_fails_the_channel_and_unwinds_one_step() {
    let (gpu, dev) = device(config());
    let heavy = dev.client_new().unwrap();
    let light = dev.client_new().unwrap();
    let vs = dev.vspace_new(1 << 30).unwrap();
    let a = dev.object_new(heavy, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    let b = dev.object_new(heavy, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    dev.vspace_map(vs, a, 0, 0, false).unwrap();
    dev.vspace_map(vs, b, 0, 0, false).unwrap();
    let chan = dev.chan_new(vs).unwrap();
    let ib = dev.object_new(heavy, 0x1000, MemoryClass::HostSnooped, 0, ObjectFlags::new()).unwrap();
    dev.chan_init_submission(chan, ib, 9).unwrap();

    gpu.stall_fifo(true);
    dev.object_new(light, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    gpu.stall_fifo(false);

    assert_eq!(dev.chan_state(chan).unwrap(), ChannelState::Failed);
    assert_eq!(dev.chan_submit(chan, 1), Err(DriverError::ChannelFailed));
    let swapped = [a, b].iter().filter(|o| dev.object_swapped(**o).unwrap()).count();
    assert_eq!(swapped, 1);
    let stats = dev.stats();
    assert_eq!((stats.usage, stats.demand, stats.swapped), (8 * MIB, 8 * MIB, 4 * MIB));
}

#[test]
fn freeing_a_swapped_object_rolls_back_counters() {
    let (_gpu, dev) = device(config());
    let heavy = dev.client_new().unwrap();
    let a = dev.object_new(heavy, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    dev.set_budget(2 * MIB);
    assert_eq!(dev.swap().reduce(dev.swap().required()), 4 * MIB);
    assert!(dev.object_swapped(a).unwrap());
    dev.object_free(a).unwrap();
    let stats = dev.stats();
    assert_eq!((stats.usage, stats.demand, stats.swapped), (0, 0, 0));
    assert_eq!(dev.client_stats(heavy).unwrap().sets.swapped, 0);
}

#[test]
fn background_pass_readmits_swapped_chunks() {
    let (_gpu, dev) = device(config().with_background_interval_ms(5));
    let dev = std::sync::Arc::new(dev);
    let heavy = dev.client_new().unwrap();
    let a = dev.object_new(heavy, 4 * MIB, MemoryClass::VramSmall, 0, swappable()).unwrap();
    dev.set_budget(2 * MIB);
    dev.swap().reduce(dev.swap().required());
    assert!(dev.object_swapped(a).unwrap());

    dev.set_budget(8 * MIB);
    let bg = dev.start_background().expect("configured");
    let deadline = Instant::now() + Duration::from_secs(5);
    while dev.object_swapped(a).unwrap() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    bg.stop();
    assert!(!dev.object_swapped(a).unwrap());
    assert_eq!(dev.stats().usage, 4 * MIB);
}
