use super::layout::{extracted_bytes, FileDemand};
use super::*;
use crate::inject::MIN_DRIVER_RESERVE;
use winstick_core::test_utils::MemoryDisk;
use winstick_core::BootMode;

const GIB: u64 = 1024 * 1024 * 1024;

fn seed() -> LayoutSeed {
    LayoutSeed::derive(&[b"partition-tests"])
}

fn file(path: &str, size: u64) -> FileDemand {
    FileDemand {
        path: path.to_string(),
        size,
        is_dir: false,
    }
}

fn request_for(mode: BootMode) -> LayoutRequest {
    let demand = match mode {
        BootMode::Bios => ContentDemand::Extracted {
            entries: vec![
                file("bootmgr", 400 * 1024),
                file("sources/boot.wim", 300 * 1024 * 1024),
                file("efi/boot/bootx64.efi", 1500 * 1024),
            ],
        },
        BootMode::Uefi | BootMode::Hybrid => ContentDemand::Raw { bytes: 500 * 1024 * 1024 },
    };
    LayoutRequest {
        demand,
        driver_reserve: 0,
        seed: seed(),
    }
}

#[test]
fn planned_tables_are_valid_for_all_geometries() {
    for sector_size in [512u32, 4096] {
        for size in [GIB, 8 * GIB, 64 * GIB, 3 * 1024 * GIB] {
            let geometry = Geometry::new(sector_size, size / sector_size as u64);
            for mode in BootMode::ALL {
                let layout = plan(&geometry, mode, &request_for(mode))
                    .unwrap_or_else(|e| panic!("{} on {} x {}: {}", mode, size, sector_size, e));
                let table = &layout.table;

                let mut sorted = table.entries.clone();
                sorted.sort_by_key(|e| e.start_lba);
                for pair in sorted.windows(2) {
                    assert!(pair[0].end_lba() <= pair[1].start_lba);
                }
                for entry in &table.entries {
                    assert!(geometry.is_aligned(entry.start_lba));
                    assert!(geometry.is_aligned(entry.sector_count));
                    assert!(entry.end_lba() <= geometry.total_sectors);
                    if mode != BootMode::Uefi {
                        assert!(entry.end_lba() <= u32::MAX as u64);
                    }
                }
                assert!(layout.driver_reserve >= MIN_DRIVER_RESERVE);
                assert!(validate(table, &geometry).is_ok());
            }
        }
    }
}

#[test]
fn tables_round_trip_through_the_device() {
    for sector_size in [512u32, 4096] {
        for mode in BootMode::ALL {
            let disk = MemoryDisk::new("rt", sector_size, 2 * GIB / sector_size as u64);
            let mut device = disk.open().unwrap();
            let layout = plan(&disk.geometry(), mode, &request_for(mode)).unwrap();

            let record = write_table(&mut device, &layout.table).unwrap();
            assert_eq!(record.extents[0].start_lba, 0);
            assert_eq!(record.extents[0].sector_count, 1);

            let decoded = read_table(&mut device).unwrap();
            assert_eq!(decoded, layout.table, "{} with {}-byte sectors", mode, sector_size);
        }
    }
}

#[test]
fn gpt_backup_mirrors_primary() {
    let disk = MemoryDisk::new("gpt", 512, 4 * GIB / 512);
    let mut device = disk.open().unwrap();
    let layout = plan(&disk.geometry(), BootMode::Uefi, &request_for(BootMode::Uefi)).unwrap();
    write_table(&mut device, &layout.table).unwrap();

    let total = disk.geometry().total_sectors;
    let primary = gpt::decode_header(&device.read_sectors(1, 1).unwrap()).unwrap();
    let backup = gpt::decode_header(&device.read_sectors(total - 1, 1).unwrap()).unwrap();
    assert_eq!(primary.backup_lba, total - 1);
    assert_eq!(backup.backup_lba, 1);
    assert_eq!(backup.entries_lba, total - 33);
    assert_eq!(primary.entries_crc, backup.entries_crc);
    assert_eq!(
        device.read_sectors(2, 32).unwrap(),
        device.read_sectors(total - 33, 32).unwrap()
    );
}

#[test]
fn hybrid_mbr_puts_protective_entry_first() {
    let geometry = Geometry::new(512, 8 * GIB / 512);
    let layout = plan(&geometry, BootMode::Hybrid, &request_for(BootMode::Hybrid)).unwrap();
    let slots = mbr::slots_for(&layout.table, &geometry).unwrap();
    assert_eq!(slots.len(), 3);
    assert_eq!(slots[0].partition_type, 0xEE);
    assert_eq!(slots[0].start_lba, 1);
    assert_eq!(slots[0].end_lba(), 2048);
    assert_eq!((slots[1].partition_type, slots[1].active), (0xEF, true));
    assert_eq!((slots[2].partition_type, slots[2].active), (0x07, false));

    let esp = layout.boot_partition();
    assert_eq!(esp.start_lba, 2048);
    assert!(esp.bootable);
    assert_eq!(layout.content_partition().start_lba, esp.end_lba());
}

#[test]
fn raw_capacity_boundary() {
    let geometry = Geometry::new(512, 4 * GIB / 512);
    for mode in [BootMode::Uefi, BootMode::Hybrid] {
        let probe = plan(&geometry, mode, &request_for(mode)).unwrap();
        let capacity = probe.content_capacity;

        let exact = LayoutRequest {
            demand: ContentDemand::Raw { bytes: capacity },
            ..request_for(mode)
        };
        assert!(plan(&geometry, mode, &exact).is_ok());

        let over = LayoutRequest {
            demand: ContentDemand::Raw { bytes: capacity + 1 },
            ..request_for(mode)
        };
        match plan(&geometry, mode, &over) {
            Err(WinstickError::InsufficientSpace { required, available }) => {
                assert_eq!(required, capacity / 512 + 1);
                assert_eq!(available, capacity / 512);
            }
            other => panic!("expected InsufficientSpace, got {:?}", other),
        }
    }
}

#[test]
fn extracted_capacity_boundary() {
    let geometry = Geometry::new(512, GIB / 512);
    let empty = LayoutRequest {
        demand: ContentDemand::Extracted { entries: vec![] },
        driver_reserve: 0,
        seed: seed(),
    };
    let probe = plan(&geometry, BootMode::Bios, &empty).unwrap();
    let cluster = probe.boot_params.cluster_bytes();
    // The root directory takes one cluster
    let largest = probe.content_capacity - cluster;

    let fits = LayoutRequest {
        demand: ContentDemand::Extracted {
            entries: vec![file("install.esd", largest)],
        },
        ..empty.clone()
    };
    assert!(plan(&geometry, BootMode::Bios, &fits).is_ok());

    let over = LayoutRequest {
        demand: ContentDemand::Extracted {
            entries: vec![file("install.esd", largest + 1)],
        },
        ..empty
    };
    assert!(matches!(
        plan(&geometry, BootMode::Bios, &over),
        Err(WinstickError::InsufficientSpace { .. })
    ));
}

#[test]
fn extracted_bytes_counts_directory_tables() {
    let entries = vec![
        file("a/b/c.txt", 1),
        FileDemand {
            path: "a/empty".to_string(),
            size: 0,
            is_dir: true,
        },
    ];
    // root, a, a/b, a/empty tables plus one data cluster
    assert_eq!(extracted_bytes(&entries, 4096).unwrap(), 5 * 4096);
    let bad = vec![file("a/b?.txt", 1)];
    assert!(matches!(
        extracted_bytes(&bad, 4096),
        Err(WinstickError::InvalidName(_))
    ));
}

#[test]
fn bios_rejects_files_over_four_gib() {
    let geometry = Geometry::new(512, 16 * GIB / 512);
    let request = LayoutRequest {
        demand: ContentDemand::Extracted {
            entries: vec![file("sources/install.wim", 5 * GIB)],
        },
        driver_reserve: 0,
        seed: seed(),
    };
    match plan(&geometry, BootMode::Bios, &request) {
        Err(WinstickError::FileTooLarge { path, size }) => {
            assert_eq!(path, "sources/install.wim");
            assert_eq!(size, 5 * GIB);
        }
        other => panic!("expected FileTooLarge, got {:?}", other),
    }
}

#[test]
fn mode_and_demand_must_agree() {
    let geometry = Geometry::new(512, 8 * GIB / 512);
    let raw_for_bios = request_for(BootMode::Uefi);
    assert!(matches!(
        plan(&geometry, BootMode::Bios, &raw_for_bios),
        Err(WinstickError::InvalidLayout(_))
    ));
    let files_for_uefi = request_for(BootMode::Bios);
    assert!(matches!(
        plan(&geometry, BootMode::Uefi, &files_for_uefi),
        Err(WinstickError::InvalidLayout(_))
    ));
}

#[test]
fn tiny_devices_are_refused() {
    let geometry = Geometry::new(512, 16 * 1024 * 1024 / 512);
    for mode in BootMode::ALL {
        let request = LayoutRequest {
            demand: match mode {
                BootMode::Bios => ContentDemand::Extracted { entries: vec![] },
                _ => ContentDemand::Raw { bytes: 1024 },
            },
            driver_reserve: 0,
            seed: seed(),
        };
        assert!(
            matches!(
                plan(&geometry, mode, &request),
                Err(WinstickError::InsufficientSpace { .. })
            ),
            "{} should not fit on 16 MiB",
            mode
        );
    }
}

#[test]
fn seeds_make_layouts_deterministic() {
    let geometry = Geometry::new(512, 8 * GIB / 512);
    let request = request_for(BootMode::Hybrid);
    let a = plan(&geometry, BootMode::Hybrid, &request).unwrap();
    let b = plan(&geometry, BootMode::Hybrid, &request).unwrap();
    assert_eq!(a, b);
    assert_ne!(a.table.disk_signature, 0);

    let other = LayoutRequest {
        seed: LayoutSeed::derive(&[b"another image"]),
        ..request
    };
    let c = plan(&geometry, BootMode::Hybrid, &other).unwrap();
    assert_ne!(a.table.disk_guid, c.table.disk_guid);
    assert_ne!(a.table.entries[0].guid, c.table.entries[0].guid);
}

#[test]
fn validator_rejects_broken_tables() {
    let geometry = Geometry::new(512, 8 * GIB / 512);
    let layout = plan(&geometry, BootMode::Uefi, &request_for(BootMode::Uefi)).unwrap();

    let mut overlapping = layout.table.clone();
    overlapping.entries[1].start_lba -= 2048;
    assert!(matches!(
        validate(&overlapping, &geometry),
        Err(WinstickError::InvalidLayout(_))
    ));

    let mut misaligned = layout.table.clone();
    misaligned.entries[1].start_lba += 1;
    misaligned.entries[1].sector_count -= 2048;
    assert!(validate(&misaligned, &geometry).is_err());

    let mut past_end = layout.table.clone();
    past_end.entries[1].sector_count += 2048;
    assert!(validate(&past_end, &geometry).is_err());

    let mut unknown_shape = layout.table.clone();
    unknown_shape.entries.swap(0, 1);
    assert!(validate(&unknown_shape, &geometry).is_err());

    let mut duplicate_guid = layout.table.clone();
    duplicate_guid.entries[1].guid = duplicate_guid.entries[0].guid;
    assert!(validate(&duplicate_guid, &geometry).is_err());

    let mut bootable_esp_on_gpt = layout.table.clone();
    bootable_esp_on_gpt.entries[0].bootable = true;
    assert!(validate(&bootable_esp_on_gpt, &geometry).is_err());
}

#[test]
fn footprint_covers_head_and_tail() {
    let geometry = Geometry::new(4096, 262_144);
    let [head, tail] = footprint(&geometry).unwrap();
    assert_eq!(head, 0..6);
    assert_eq!(tail, 262_139..262_144);
}

#[test]
fn footprint_of_a_tiny_device_is_an_error() {
    for total in [0, 10, 33, 66] {
        let err = footprint(&Geometry::new(512, total)).unwrap_err();
        assert!(matches!(err, WinstickError::InvalidLayout(_)), "{} sectors", total);
    }
    let [head, tail] = footprint(&Geometry::new(512, 67)).unwrap();
    assert_eq!(head, 0..34);
    assert_eq!(tail, 34..67);
}
