mod common;

use common::{MIB, config, device, fill, read};
use gpu_addresses::{PhysicalAddress, VirtualAddress};
use gpu_driver::sim::HOST_BASE;
use gpu_driver::{DriverError, MemoryClass, ObjectFlags};
use gpu_info::ChipGeneration;
use gpu_vmem::{Aperture, DirectoryEntry, PageTableEntry};
use proptest::prelude::*;

const SPACE: u64 = 1 << 30;

#[test]
fn one_object_mapped_twice() {
    let (_gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(SPACE).unwrap();
    let obj = dev.object_new(client, 0x1_0000, MemoryClass::VramSmall, 0, ObjectFlags::new()).unwrap();

    let first = dev.vspace_map(vs, obj, 0, 0, false).unwrap();
    let second = dev.vspace_map(vs, obj, 0, 0, false).unwrap();
    assert_eq!(first.as_u64(), 0);
    assert_ne!(first, second);
    dev.vspace_write(vs, first + 0x100, b"shared").unwrap();
    let mut buf = [0; 6];
    dev.vspace_read(vs, second + 0x100, &mut buf).unwrap();
    assert_eq!(&buf, b"shared");

    dev.vspace_unmap(vs, first).unwrap();
    assert_eq!(dev.vspace_read(vs, first, &mut buf), Err(DriverError::NotMapped));
    assert_eq!(dev.vspace_translate(vs, first + 0x2000), Err(DriverError::NotMapped));
    assert_eq!(dev.vspace_unmap(vs, first), Err(DriverError::NotMapped));
    dev.vspace_read(vs, second + 0x100, &mut buf).unwrap();
    assert_eq!(&buf, b"shared");

    let again = dev.vspace_map(vs, obj, 0, 0, false).unwrap();
    assert_eq!(again, first);
}

#[test]
fn unmap_by_interior_address() {
    let (_gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(SPACE).unwrap();
    let obj = dev.object_new(client, 0x4000, MemoryClass::VramSmall, 0, ObjectFlags::new()).unwrap();
    let va = dev.vspace_map(vs, obj, 0, 0, false).unwrap();
    dev.vspace_unmap(vs, va + 0x3000).unwrap();
    assert_eq!(dev.vspace_translate(vs, va), Err(DriverError::NotMapped));
}

#[test]
fn windows_and_back_bias() {
    let (_gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(SPACE).unwrap();
    let obj = dev.object_new(client, 0x1_0000, MemoryClass::VramSmall, 0, ObjectFlags::new()).unwrap();

    let top = dev.vspace_map(vs, obj, 0, 0, true).unwrap();
    assert_eq!(top.as_u64(), SPACE - 0x1_0000);
    let inside = dev.vspace_map(vs, obj, 0x10_0000, 0x20_0000, false).unwrap();
    assert!((0x10_0000..0x20_0000 - 0x1_0000 + 1).contains(&inside.as_u64()));

    assert_eq!(dev.vspace_map(vs, obj, 0, SPACE + 0x1000, false), Err(DriverError::InvalidRange));
    assert_eq!(dev.vspace_map(vs, obj, 0x20_0000, 0x10_0000, false), Err(DriverError::InvalidRange));
    assert_eq!(dev.vspace_map(vs, obj, 0x10_0000, 0x10_8000, false), Err(DriverError::OutOfMemory));
}

#[test]
fn space_sizes_follow_the_generation() {
    let (_gpu, dev) = device(config());
    assert_eq!(dev.vspace_new(0), Err(DriverError::InvalidRange));
    assert_eq!(dev.vspace_new(0x1_0000), Err(DriverError::InvalidRange));
    assert_eq!(dev.vspace_new((1 << 40) + 0x2_0000), Err(DriverError::InvalidRange));
    assert!(dev.vspace_new(1 << 40).is_ok());

    let (_gpu, tesla) = device(config().with_generation(ChipGeneration::Tesla));
    assert!(tesla.vspace_new(0x1_0000).is_ok());
    assert_eq!(tesla.vspace_new(0x8000), Err(DriverError::InvalidRange));
}

#[test]
fn tesla_space_round_trips_both_page_sizes() {
    let (_gpu, dev) = device(config().with_generation(ChipGeneration::Tesla));
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(SPACE).unwrap();
    let large = dev.object_new(client, MIB, MemoryClass::VramLarge, 0, ObjectFlags::new()).unwrap();
    let small = dev.object_new(client, 0x3000, MemoryClass::VramSmall, 0, ObjectFlags::new()).unwrap();
    let va_large = dev.vspace_map(vs, large, 0, 0, false).unwrap();
    let va_small = dev.vspace_map(vs, small, 0, 0, false).unwrap();

    let data_large = fill(&dev, vs, va_large, MIB, 11);
    let data_small = fill(&dev, vs, va_small, 0x3000, 12);
    assert_eq!(read(&dev, vs, va_large, MIB), data_large);
    assert_eq!(read(&dev, vs, va_small, 0x3000), data_small);
    let (_, aperture) = dev.vspace_translate(vs, va_large + 0x1_2345).unwrap();
    assert_eq!(aperture, Aperture::Vram);
}

#[test]
fn host_objects_map_through_the_host_aperture() {
    let (gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(SPACE).unwrap();
    let obj = dev.object_new(client, 0x2800, MemoryClass::HostSnooped, 0, ObjectFlags::new()).unwrap();
    assert_eq!(gpu.host_pages_live(), 3);
    let va = dev.vspace_map(vs, obj, 0, 0, false).unwrap();
    let (pa, aperture) = dev.vspace_translate(vs, va + 0x2000).unwrap();
    assert_eq!(aperture, Aperture::HostSnooped);
    assert!(pa.as_u64() >= HOST_BASE);
    let data = fill(&dev, vs, va, 0x3000, 4);
    assert_eq!(read(&dev, vs, va, 0x3000), data);
    assert_eq!(dev.stats().usage, 0);

    dev.object_free(obj).unwrap();
    assert_eq!(gpu.host_pages_live(), 0);
}

#[test]
fn large_objects_round_to_the_large_page() {
    let (_gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(SPACE).unwrap();
    let a = dev.object_new(client, 0x1000, MemoryClass::VramLarge, 0, ObjectFlags::new()).unwrap();
    let b = dev.object_new(client, 0x1000, MemoryClass::VramLarge, 0, ObjectFlags::new()).unwrap();
    assert_eq!(dev.stats().usage, 0x4_0000);
    let va_a = dev.vspace_map(vs, a, 0, 0, false).unwrap();
    let va_b = dev.vspace_map(vs, b, 0, 0, false).unwrap();
    assert_eq!(va_b.as_u64() - va_a.as_u64(), 0x2_0000);
}

#[test]
fn page_tables_live_in_instance_memory() {
    let (gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(SPACE).unwrap();
    let obj = dev.object_new(client, 0x3000, MemoryClass::VramSmall, 0, ObjectFlags::new()).unwrap();
    let va = dev.vspace_map(vs, obj, 0, 0, false).unwrap();

    let block = ChipGeneration::Fermi.geometry().block_size;
    let pde = gpu.entry_at(dev.vspace_directory(vs).unwrap() + (va.as_u64() / block) * 8);
    let table = PhysicalAddress::new(DirectoryEntry::from_bits(pde).small_table() << 12);
    assert!(table.as_u64() > 0);
    let slot = (va.as_u64() % block) >> 12;
    for page in 0..3 {
        let raw = gpu.entry_at(table + (slot + page) * 8);
        let entry = PageTableEntry::from_raw(raw);
        assert!(entry.present());
        let (pa, _) = dev.vspace_translate(vs, va + page * 0x1000).unwrap();
        assert_eq!(entry.target(), pa);
    }

    dev.vspace_unmap(vs, va).unwrap();
    assert_eq!(gpu.entry_at(table + slot * 8), 0);
}

#[test]
fn recycled_vram_reads_as_zero() {
    let (_gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let vs = dev.vspace_new(SPACE).unwrap();
    let old = dev.object_new(client, 0x1_0000, MemoryClass::VramSmall, 0, ObjectFlags::new()).unwrap();
    let va = dev.vspace_map(vs, old, 0, 0, false).unwrap();
    let (old_pa, _) = dev.vspace_translate(vs, va).unwrap();
    fill(&dev, vs, va, 0x1_0000, 0x5a);
    dev.object_free(old).unwrap();

    let new = dev.object_new(client, 0x1_0000, MemoryClass::VramSmall, 0, ObjectFlags::new()).unwrap();
    let va = dev.vspace_map(vs, new, 0, 0, false).unwrap();
    let (new_pa, _) = dev.vspace_translate(vs, va).unwrap();
    assert_eq!(new_pa, old_pa, "the freed block is reused");
    assert!(read(&dev, vs, va, 0x1_0000).iter().all(|&b| b == 0));
}

#[test]
fn object_size_and_owner_are_checked() {
    let (_gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let flags = ObjectFlags::new();
    assert_eq!(dev.object_new(client, 0, MemoryClass::VramSmall, 0, flags), Err(DriverError::InvalidRange));
    assert_eq!(
        dev.object_new(client, 1 << 40, MemoryClass::VramSmall, 0, flags),
        Err(DriverError::InvalidRange)
    );
    assert_eq!(
        dev.object_new(client, 64 * MIB, MemoryClass::VramSmall, 0, flags),
        Err(DriverError::OutOfMemory)
    );
    dev.client_free(client).unwrap();
    assert_eq!(
        dev.object_new(client, 0x1000, MemoryClass::VramSmall, 0, flags),
        Err(DriverError::InvalidHandle)
    );
    let stats = dev.stats();
    assert_eq!((stats.usage, stats.demand), (0, 0));
}

#[test]
fn freeing_an_object_unmaps_it_everywhere() {
    let (_gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let one = dev.vspace_new(SPACE).unwrap();
    let two = dev.vspace_new(SPACE).unwrap();
    let obj = dev.object_new(client, 0x2_0000, MemoryClass::VramLarge, 0, ObjectFlags::new()).unwrap();
    let va_one = dev.vspace_map(one, obj, 0, 0, false).unwrap();
    let va_two = dev.vspace_map(two, obj, 0, 0, true).unwrap();

    dev.object_free(obj).unwrap();
    assert_eq!(dev.vspace_translate(one, va_one), Err(DriverError::NotMapped));
    assert_eq!(dev.vspace_translate(two, va_two), Err(DriverError::NotMapped));
    assert_eq!(dev.object_free(obj), Err(DriverError::InvalidHandle));
    assert_eq!(dev.vspace_map(one, obj, 0, 0, false), Err(DriverError::InvalidHandle));
    assert_eq!(dev.stats().usage, 0);
}

#[test]
fn freeing_a_space_returns_its_instance_memory() {
    let (_gpu, dev) = device(config());
    let client = dev.client_new().unwrap();
    let before = dev.instance_free();
    let vs = dev.vspace_new(SPACE).unwrap();
    assert!(dev.instance_free() < before);

    let small = dev.object_new(client, 0x5000, MemoryClass::VramSmall, 0, ObjectFlags::new()).unwrap();
    let large = dev.object_new(client, MIB, MemoryClass::VramLarge, 0, ObjectFlags::new()).unwrap();
    dev.vspace_map(vs, small, 0, 0, false).unwrap();
    dev.vspace_map(vs, large, 0, 0, true).unwrap();
    dev.vspace_map(vs, small, 1 << 28, 0, false).unwrap();

    dev.vspace_free(vs).unwrap();
    assert_eq!(dev.instance_free(), before);
    assert_eq!(dev.vspace_free(vs), Err(DriverError::InvalidHandle));
    assert_eq!(dev.vspace_map(vs, small, 0, 0, false), Err(DriverError::InvalidHandle));
    assert_eq!(
        dev.vspace_unmap(vs, VirtualAddress::new(0)),
        Err(DriverError::InvalidHandle)
    );

    dev.object_free(small).unwrap();
    dev.object_free(large).unwrap();
    assert_eq!(dev.object_count(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_mapping_sees_its_own_bytes(
        pages in prop::collection::vec(1u64..24, 1..8),
        back in any::<bool>(),
    ) {
        let (_gpu, dev) = device(config());
        let client = dev.client_new().unwrap();
        let vs = dev.vspace_new(SPACE).unwrap();
        let mut live = Vec::new();
        for (i, n) in pages.iter().enumerate() {
            let len = n * 0x1000;
            let obj = dev.object_new(client, len, MemoryClass::VramSmall, 0, ObjectFlags::new()).unwrap();
            let va = dev.vspace_map(vs, obj, 0, 0, back && i % 2 == 0).unwrap();
            #[allow(clippy::cast_possible_truncation)]
            let data = fill(&dev, vs, va, len, i as u8);
            live.push((va, data));
        }
        for (va, data) in &live {
            prop_assert_eq!(&read(&dev, vs, *va, data.len() as u64), data);
        }
    }
}
