mod common;

use common::{config, device};
use gpu_driver::{ChannelState, DriverError, MemoryClass, ObjectFlags};
use gpu_info::layout::CTRL_IB_PUT;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

#[test]
fn lifecycle_and_submission() {
    let (gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(1 << 30).unwrap();
    let chan = dev.chan_new(vs).unwrap();
    assert_eq!(dev.chan_state(chan).unwrap(), ChannelState::Initialized);
    assert!(gpu.is_bound(chan.index()));
    assert_eq!(dev.chan_submit(chan, 1), Err(DriverError::InvalidState));
    assert_eq!(dev.chan_pause(chan).err(), Some(DriverError::InvalidState));

    let wrong = dev.object_new(client, 0x2000, MemoryClass::HostSnooped, 0, ObjectFlags::new()).unwrap();
    assert_eq!(dev.chan_init_submission(chan, wrong, 9), Err(DriverError::InvalidRange));
    let ib = dev.object_new(client, 0x1000, MemoryClass::HostSnooped, 0, ObjectFlags::new()).unwrap();
    assert_eq!(dev.chan_init_submission(chan, ib, 0), Err(DriverError::InvalidRange));
    assert_eq!(dev.chan_init_submission(chan, ib, 21), Err(DriverError::InvalidRange));

    dev.chan_init_submission(chan, ib, 9).unwrap();
    assert_eq!(dev.chan_state(chan).unwrap(), ChannelState::Running);
    let (ib_va, order) = gpu.indirect_buffer(chan.index()).expect("IB programmed");
    assert_eq!(order, 9);
    assert!(dev.vspace_translate(vs, ib_va).is_ok());
    assert_eq!(dev.chan_init_submission(chan, ib, 9), Err(DriverError::InvalidState));

    assert_eq!(dev.chan_submit(chan, 1).unwrap(), 1);
    assert_eq!(dev.chan_submit(chan, 4).unwrap(), 2);
    assert_eq!(dev.chan_submit(chan, 512), Err(DriverError::InvalidRange));
    assert_eq!(dev.chan_submit(chan, 0), Err(DriverError::InvalidRange));
    assert_eq!(dev.chan_read_control(chan, CTRL_IB_PUT).unwrap(), 5);
    assert_eq!(dev.chan_read_control(chan, 2), Err(DriverError::InvalidRange));
    assert_eq!(dev.chan_read_control(chan, 0x1000), Err(DriverError::InvalidRange));
    assert_eq!(dev.chan_continue(chan), Err(DriverError::InvalidState));
}

#[test]
fn pauses_nest_and_the_shadow_is_written_back() {
    let (gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(1 << 30).unwrap();
    let chan = dev.chan_new(vs).unwrap();
    let ib = dev.object_new(client, 0x1000, MemoryClass::HostSnooped, 0, ObjectFlags::new()).unwrap();
    dev.chan_init_submission(chan, ib, 9).unwrap();
    dev.chan_submit(chan, 3).unwrap();
    let slot = chan.index();

    let pause = dev.chan_pause(chan).unwrap();
    pause.wait(WAIT).unwrap();
    assert!(pause.is_complete());
    assert_eq!(pause.channel(), chan);
    assert_eq!(dev.chan_state(chan).unwrap(), ChannelState::Paused);
    assert!(gpu.is_halted(slot));
    assert_eq!(dev.chan_pause(chan).err(), Some(DriverError::AlreadyPaused));
    assert_eq!(dev.chan_submit(chan, 1), Err(DriverError::InvalidState));

    gpu.set_control(slot, CTRL_IB_PUT, 0x77);
    assert_eq!(dev.chan_read_control(chan, CTRL_IB_PUT).unwrap(), 3);

    dev.chan_continue(chan).unwrap();
    assert_eq!(dev.chan_state(chan).unwrap(), ChannelState::Paused);
    dev.chan_continue(chan).unwrap();
    assert_eq!(dev.chan_state(chan).unwrap(), ChannelState::Running);
    assert!(!gpu.is_halted(slot));
    assert_eq!(dev.chan_read_control(chan, CTRL_IB_PUT).unwrap(), 3);
    assert_eq!(dev.chan_submit(chan, 1).unwrap(), 3, "the barrier consumed seq 2");
}

#[test]
fn control_reads_are_shadowed_while_the_pause_is_in_flight() {
    let (gpu, dev) = device(config().with_pause_timeout_ms(5000));
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(1 << 30).unwrap();
    let chan = dev.chan_new(vs).unwrap();
    let ib = dev.object_new(client, 0x1000, MemoryClass::HostSnooped, 0, ObjectFlags::new()).unwrap();
    dev.chan_init_submission(chan, ib, 9).unwrap();
    dev.chan_submit(chan, 3).unwrap();
    let slot = chan.index();

    gpu.stall_fifo(true);
    let pause = dev.chan_pause(chan).unwrap();
    assert_eq!(dev.chan_state(chan).unwrap(), ChannelState::Pausing);
    gpu.set_control(slot, CTRL_IB_PUT, 0x77);
    assert_eq!(dev.chan_read_control(chan, CTRL_IB_PUT).unwrap(), 3);
    assert!(!pause.is_complete());

    gpu.stall_fifo(false);
    pause.wait(WAIT).unwrap();
    assert_eq!(dev.chan_state(chan).unwrap(), ChannelState::Paused);
    assert_eq!(dev.chan_read_control(chan, CTRL_IB_PUT).unwrap(), 0x77, "refreshed after the halt");
    gpu.set_control(slot, CTRL_IB_PUT, 0x99);
    assert_eq!(dev.chan_read_control(chan, CTRL_IB_PUT).unwrap(), 0x77);

    dev.chan_continue(chan).unwrap();
    assert_eq!(dev.chan_state(chan).unwrap(), ChannelState::Running);
    assert_eq!(dev.chan_read_control(chan, CTRL_IB_PUT).unwrap(), 0x77);
}

#[test]
fn stalled_barrier_fails_the_channel() {
    let (gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(1 << 30).unwrap();
    let chan = dev.chan_new(vs).unwrap();
    let ib = dev.object_new(client, 0x1000, MemoryClass::HostSnooped, 0, ObjectFlags::new()).unwrap();
    dev.chan_init_submission(chan, ib, 9).unwrap();

    gpu.stall_fifo(true);
    let pause = dev.chan_pause(chan).unwrap();
    assert_eq!(pause.wait(WAIT), Err(DriverError::Timeout));
    gpu.stall_fifo(false);

    assert_eq!(dev.chan_state(chan).unwrap(), ChannelState::Failed);
    assert!(!gpu.is_halted(chan.index()));
    assert_eq!(dev.chan_pause(chan).err(), Some(DriverError::ChannelFailed));
    assert_eq!(dev.chan_continue(chan), Err(DriverError::ChannelFailed));
    assert_eq!(dev.chan_submit(chan, 1), Err(DriverError::ChannelFailed));

    dev.chan_free(chan).unwrap();
    assert!(!gpu.is_bound(chan.index()));
    assert_eq!(dev.object_swapped(ib), Err(DriverError::InvalidHandle));
}

#[test]
fn teardown_releases_the_ib_and_the_control_page() {
    let (gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let before = dev.instance_free();
    let vs = dev.vspace_new(1 << 30).unwrap();
    let chan = dev.chan_new(vs).unwrap();
    let ib = dev.object_new(client, 0x1000, MemoryClass::HostNonSnooped, 0, ObjectFlags::new()).unwrap();
    dev.chan_init_submission(chan, ib, 8).unwrap();
    dev.chan_submit(chan, 2).unwrap();

    assert_eq!(dev.object_free(ib), Err(DriverError::InvalidState));
    assert_eq!(dev.vspace_free(vs), Err(DriverError::InvalidState));
    let pages = gpu.host_pages_live();
    assert!(pages >= 1);

    dev.chan_free(chan).unwrap();
    assert_eq!(dev.chan_state(chan), Err(DriverError::InvalidHandle));
    assert_eq!(dev.chan_free(chan), Err(DriverError::InvalidHandle));
    assert_eq!(dev.object_free(ib), Err(DriverError::InvalidHandle));
    assert_eq!(gpu.host_pages_live(), pages - 1);
    assert!(!gpu.is_bound(chan.index()));

    dev.vspace_free(vs).unwrap();
    assert_eq!(dev.chan_new(vs), Err(DriverError::InvalidHandle));
    assert_eq!(dev.instance_free(), before);
    assert_eq!(dev.object_count(), 0);
}

#[test]
fn freeing_a_running_channel_pauses_it_first() {
    let (gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(1 << 30).unwrap();
    let chan = dev.chan_new(vs).unwrap();
    let ib = dev.object_new(client, 0x1000, MemoryClass::HostSnooped, 0, ObjectFlags::new()).unwrap();
    dev.chan_init_submission(chan, ib, 9).unwrap();
    gpu.clear_events();

    dev.chan_free(chan).unwrap();
    let slot = chan.index();
    let events = gpu.events();
    let halt = events.iter().position(|e| *e == gpu_driver::sim::SimEvent::Halt(slot));
    let unbind = events.iter().position(|e| *e == gpu_driver::sim::SimEvent::Unbind(slot));
    assert!(halt.is_some());
    assert!(halt < unbind);
}
