use super::*;
use crate::fat32::Fat32Reader;
use crate::inject::tests::test_catalog;
use crate::inject::{BootConfig, CONFIG_FLAG_RAW_NTFS, CONFIG_PATH};
use crate::partition::Scheme;
use crate::testing::{pattern, Content, NtfsImageBuilder};
use std::io::Cursor;
use winstick_core::test_utils::{MemoryDisk, MockDeviceManager};
use winstick_core::{ErrorKind, NullProgress};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;
const VOLUME_BYTES: u64 = 8 * MIB;
const WIM_BYTES: usize = 2 * MIB as usize;

fn installer_volume() -> Vec<u8> {
    NtfsImageBuilder::installer(VOLUME_BYTES, WIM_BYTES).build()
}

fn image_of(volume: &[u8]) -> SourceImage<Cursor<Vec<u8>>> {
    SourceImage::from_reader(Cursor::new(volume.to_vec())).unwrap()
}

fn run_session(
    manager: &MockDeviceManager,
    device: &Device,
    volume: &[u8],
    config: SessionConfig,
) -> SessionReport {
    let catalog = test_catalog();
    WriteSession::new(config, &catalog).run(
        manager,
        device,
        image_of(volume),
        &mut NullProgress,
        &CancelToken::new(),
    )
}

fn failure_of(report: &SessionReport) -> &SessionFailure {
    match report.failure() {
        Some(failure) => failure,
        None => panic!("expected a failed session, got {:?}", report.outcome),
    }
}

/// Planned layout for `volume` on `disk`, as the session would compute it.
fn layout_for(disk: &MemoryDisk, mode: BootMode, volume: &[u8]) -> Layout {
    let catalog = test_catalog();
    let variant = catalog.select("ntfs-boot", mode).unwrap();
    plan_session(&disk.geometry(), mode, variant, &image_of(volume)).unwrap()
}

const FULL_RUN: [Phase; 8] = [
    Phase::Idle,
    Phase::DevicePrepared,
    Phase::Partitioned,
    Phase::Formatted,
    Phase::ContentCopying,
    Phase::DriverInjecting,
    Phase::Verifying,
    Phase::Completed,
];

#[test]
fn uefi_session_copies_volume_and_injects_driver() {
    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("Kingston DataTraveler", 128 * MIB);
    let volume = installer_volume();

    let mut events = Vec::new();
    let mut sink = |event: ProgressEvent| events.push(event);
    let catalog = test_catalog();
    let report = WriteSession::new(SessionConfig::new(BootMode::Uefi), &catalog).run(
        &manager,
        &device,
        image_of(&volume),
        &mut sink,
        &CancelToken::new(),
    );

    assert!(report.is_completed(), "{:?}", report.outcome);
    assert_eq!(report.history, FULL_RUN);
    assert!(!disk.is_locked());
    assert_eq!(report.bytes_written, disk.bytes_written());
    assert_eq!(report.records.len(), 3);
    assert!(report.records.iter().all(|r| r.verified));

    let layout = report.layout.as_ref().unwrap();
    assert_eq!(layout.table.scheme, Scheme::Gpt);
    let data = layout.content_partition().clone();
    let esp = layout.boot_partition().clone();
    assert_eq!(disk.read_bytes(data.start_lba * 512, volume.len()), volume);

    let injection = report.injection.as_ref().unwrap();
    assert!(!injection.mbr_patched);
    assert!(!injection.vbr_patched);

    let mut dev = disk.open().unwrap();
    let mut reader = Fat32Reader::open(&mut dev, esp.start_lba).unwrap();
    assert_eq!(reader.read_file("efi/boot/bootx64.efi").unwrap(), vec![0x4D; 40_000]);
    assert_eq!(reader.read_file("efi/winstick/ntfs_x64.efi").unwrap(), vec![0x5A; 60_000]);
    let config = BootConfig::decode(&reader.read_file(CONFIG_PATH).unwrap()).unwrap();
    assert_eq!(config.flags, CONFIG_FLAG_RAW_NTFS);
    assert_eq!(config.target_start_lba, data.start_lba);
    assert_eq!(config.target_guid, data.guid.unwrap());
    assert!(reader.fats_match().unwrap());

    let copying: Vec<&ProgressEvent> = events
        .iter()
        .filter(|e| e.phase == Phase::ContentCopying)
        .collect();
    assert!(copying.windows(2).all(|w| w[0].bytes_done <= w[1].bytes_done));
    let last = copying.last().unwrap();
    assert_eq!((last.bytes_done, last.bytes_total), (VOLUME_BYTES, VOLUME_BYTES));
    assert_eq!(events.last().unwrap().phase, Phase::Completed);
}

#[test]
fn bios_session_extracts_files_and_patches_boot_code() {
    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("SanDisk Cruzer", 128 * MIB);
    let report = run_session(&manager, &device, &installer_volume(), SessionConfig::new(BootMode::Bios));

    assert!(report.is_completed(), "{:?}", report.outcome);
    let layout = report.layout.as_ref().unwrap();
    assert_eq!(layout.table.scheme, Scheme::Mbr);
    let injection = report.injection.as_ref().unwrap();
    assert!(injection.mbr_patched && injection.vbr_patched);
    // Raw volumes carry their own record; extracted files sit in the boot record
    assert_eq!(report.records.len(), 2);

    let mut dev = disk.open().unwrap();
    let mbr_sector = dev.read_sectors(0, 1).unwrap();
    assert!(mbr_sector[..300].iter().all(|b| *b == 0xFA));
    assert_eq!(&mbr_sector[510..], &[0x55, 0xAA]);

    let mut reader = Fat32Reader::open(&mut dev, layout.boot_partition().start_lba).unwrap();
    assert_eq!(reader.read_file("sources/install.wim").unwrap(), pattern(WIM_BYTES, 4));
    assert_eq!(reader.read_file("setup.exe").unwrap(), pattern(7000, 5));
    assert_eq!(
        reader.read_file("autorun.inf").unwrap(),
        b"[AutoRun]\r\nicon=setup.exe\r\n".to_vec()
    );
    let bootmgr = reader.stat("bootmgr").unwrap().unwrap();
    assert_eq!(bootmgr.attributes & 0x07, 0x07);
    assert_eq!(reader.read_file("winstick/ntfsldr.bin").unwrap(), vec![0xB0; 20_000]);
    let config = BootConfig::decode(&reader.read_file(CONFIG_PATH).unwrap()).unwrap();
    assert_eq!(config.flags, 0);
    assert_eq!(config.boot_mode, BootMode::Bios);
}

#[test]
fn every_mode_completes_and_reads_back() {
    let volume = installer_volume();
    for mode in [BootMode::Bios, BootMode::Uefi, BootMode::Hybrid] {
        let manager = MockDeviceManager::new();
        let (device, disk) = manager.add_usb("Stick", 128 * MIB);
        let report = run_session(&manager, &device, &volume, SessionConfig::new(mode));
        assert!(report.is_completed(), "{}: {:?}", mode, report.outcome);
        assert_eq!(report.history, FULL_RUN);

        let mut dev = disk.open().unwrap();
        let table = read_table(&mut dev).unwrap();
        assert_eq!(&table, &report.layout.as_ref().unwrap().table);
        if mode == BootMode::Hybrid {
            assert_eq!(table.scheme, Scheme::Hybrid);
            let mbr_sector = dev.read_sectors(0, 1).unwrap();
            assert!(mbr_sector[..440].iter().all(|b| *b == 0x33));
        }
    }
}

#[test]
fn content_exactly_filling_the_device_completes() {
    let volume = installer_volume();
    let probe = MemoryDisk::with_size("probe", 128 * MIB);
    let data_start = layout_for(&probe, BootMode::Uefi, &volume)
        .content_partition()
        .start_lba;
    // Data partition ends where the backup GPT begins
    let sectors = data_start + VOLUME_BYTES / 512 + 33;

    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("Exact", sectors * 512);
    let report = run_session(&manager, &device, &volume, SessionConfig::new(BootMode::Uefi));
    assert!(report.is_completed(), "{:?}", report.outcome);
    let layout = report.layout.as_ref().unwrap();
    assert_eq!(layout.content_partition().sector_count, VOLUME_BYTES / 512);
    assert_eq!(layout.content_capacity, VOLUME_BYTES);
    assert_eq!(disk.read_bytes(data_start * 512, volume.len()), volume);
}

#[test]
fn one_cluster_too_many_fails_before_writing() {
    let fits = installer_volume();
    let probe = MemoryDisk::with_size("probe", 128 * MIB);
    let data_start = layout_for(&probe, BootMode::Uefi, &fits)
        .content_partition()
        .start_lba;
    let sectors = data_start + VOLUME_BYTES / 512 + 33;

    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("Exact", sectors * 512);
    let larger = NtfsImageBuilder::installer(VOLUME_BYTES + 4096, WIM_BYTES).build();
    let report = run_session(&manager, &device, &larger, SessionConfig::new(BootMode::Uefi));

    let failure = failure_of(&report);
    assert_eq!(failure.kind, ErrorKind::InsufficientSpace);
    assert_eq!(failure.phase, Phase::DevicePrepared);
    assert_eq!(report.bytes_attempted, 0);
    assert_eq!(disk.write_calls(), 0);
    assert!(disk.snapshot().is_empty());
    assert!(!disk.is_locked());
}

#[test]
fn fixed_disks_are_refused_without_opening() {
    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_fixed("Samsung SSD", 128 * MIB);
    let report = run_session(&manager, &device, &installer_volume(), SessionConfig::new(BootMode::Uefi));

    let failure = failure_of(&report);
    assert_eq!(failure.kind, ErrorKind::NotRemovable);
    assert_eq!(failure.phase, Phase::Idle);
    assert_eq!(report.history, vec![Phase::Idle, Phase::Failed]);
    assert_eq!(disk.write_calls(), 0);
    assert!(report.layout.is_none());
}

#[test]
fn fixed_disks_are_written_with_the_override() {
    let manager = MockDeviceManager::new();
    let (device, _disk) = manager.add_fixed("External HDD", 128 * MIB);
    let config = SessionConfig {
        allow_non_removable: true,
        ..SessionConfig::new(BootMode::Uefi)
    };
    let report = run_session(&manager, &device, &installer_volume(), config);
    assert!(report.is_completed(), "{:?}", report.outcome);
}

#[test]
fn locked_devices_report_busy() {
    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("Stick", 128 * MIB);
    let held = disk.open().unwrap();
    let report = run_session(&manager, &device, &installer_volume(), SessionConfig::new(BootMode::Uefi));
    drop(held);

    assert_eq!(failure_of(&report).kind, ErrorKind::DeviceBusy);
    assert_eq!(report.bytes_attempted, 0);
    assert_eq!(disk.write_calls(), 0);
}

#[test]
fn write_fault_mid_copy_names_phase_and_sectors() {
    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("Flaky", 128 * MIB);
    let volume = installer_volume();
    let data_start = layout_for(&disk, BootMode::Uefi, &volume)
        .content_partition()
        .start_lba;
    let bad = data_start + 5000;
    disk.fail_writes_in(bad..bad + 1);

    let report = run_session(&manager, &device, &volume, SessionConfig::new(BootMode::Uefi));
    let failure = failure_of(&report);
    assert_eq!(failure.kind, ErrorKind::IoFailure);
    assert_eq!(failure.phase, Phase::ContentCopying);
    let sectors = failure.sectors.clone().unwrap();
    assert!(sectors.contains(&bad), "{:?}", sectors);
    assert_eq!(report.bytes_attempted, disk.bytes_attempted());
    assert_eq!(report.bytes_written, disk.bytes_written());
    assert!(report.bytes_attempted > report.bytes_written);
    assert!(!disk.is_locked());
}

#[test]
fn corrupted_read_back_fails_verification() {
    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("Fake capacity", 128 * MIB);
    let volume = installer_volume();
    let data_start = layout_for(&disk, BootMode::Uefi, &volume)
        .content_partition()
        .start_lba;
    let bad = data_start + 100;
    disk.corrupt_reads(bad..bad + 1);

    let report = run_session(&manager, &device, &volume, SessionConfig::new(BootMode::Uefi));
    let failure = failure_of(&report);
    assert_eq!(failure.kind, ErrorKind::VerificationMismatch);
    assert_eq!(failure.phase, Phase::Verifying);
    assert!(failure.sectors.clone().unwrap().contains(&bad));
}

#[test]
fn equal_inputs_give_identical_media() {
    let volume = installer_volume();
    let mut snapshots = Vec::new();
    for _ in 0..2 {
        let manager = MockDeviceManager::new();
        let (device, disk) = manager.add_usb("Stick", 128 * MIB);
        let report = run_session(&manager, &device, &volume, SessionConfig::new(BootMode::Hybrid));
        assert!(report.is_completed());
        snapshots.push(disk.snapshot());
    }
    assert_eq!(snapshots[0], snapshots[1]);

    // Rewriting a used stick converges on the same bytes
    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("Stick", 128 * MIB);
    for _ in 0..2 {
        let report = run_session(&manager, &device, &volume, SessionConfig::new(BootMode::Hybrid));
        assert!(report.is_completed());
    }
    assert_eq!(disk.snapshot(), snapshots[0]);
}

#[test]
fn bios_refuses_files_over_four_gib_before_writing() {
    let mut builder = NtfsImageBuilder::installer(VOLUME_BYTES, 4096);
    builder.file(
        "sources/install.esd",
        Content::Sparse {
            head: Vec::new(),
            hole_clusters: 5 * GIB / 4096,
            tail: Vec::new(),
        },
    );
    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("Stick", 128 * MIB);
    let report = run_session(&manager, &device, &builder.build(), SessionConfig::new(BootMode::Bios));

    let failure = failure_of(&report);
    assert_eq!(failure.kind, ErrorKind::FileTooLarge);
    assert_eq!(failure.phase, Phase::DevicePrepared);
    assert!(failure.message.contains("sources/install.esd"), "{}", failure.message);
    assert_eq!(disk.write_calls(), 0);
}

#[test]
fn unknown_driver_variant_is_incompatible() {
    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("Stick", 128 * MIB);
    let config = SessionConfig {
        driver_variant: "ext4-boot".to_string(),
        ..SessionConfig::new(BootMode::Uefi)
    };
    let report = run_session(&manager, &device, &installer_volume(), config);
    assert_eq!(failure_of(&report).kind, ErrorKind::DriverIncompatible);
    assert_eq!(disk.write_calls(), 0);
}

/// Runs a session that cancels itself on entering `phase`.
fn cancel_on(phase: Phase, disk_seed: Option<&[u8]>) -> (SessionReport, MemoryDisk, BTreeMapSnapshot) {
    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("Stick", 128 * MIB);
    if let Some(seed) = disk_seed {
        disk.write_bytes(0, seed);
        let tail = disk.geometry().size_bytes() - seed.len() as u64;
        disk.write_bytes(tail, seed);
    }
    let before = disk.snapshot();

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let mut sink = move |event: ProgressEvent| {
        if event.phase == phase {
            trigger.cancel();
        }
    };
    let catalog = test_catalog();
    let report = WriteSession::new(SessionConfig::new(BootMode::Uefi), &catalog).run(
        &manager,
        &device,
        image_of(&installer_volume()),
        &mut sink,
        &cancel,
    );
    (report, disk, before)
}

type BTreeMapSnapshot = std::collections::BTreeMap<u64, Vec<u8>>;

#[test]
fn cancel_after_partitioning_restores_the_old_table() {
    let old_table = pattern(4096, 9);
    let (report, disk, before) = cancel_on(Phase::Partitioned, Some(&old_table));

    assert_eq!(report.outcome, Outcome::RolledBack);
    assert_eq!(
        report.history,
        vec![Phase::Idle, Phase::DevicePrepared, Phase::Partitioned, Phase::RolledBack]
    );
    assert!(report.bytes_written > 0);
    assert_eq!(disk.snapshot(), before);
    assert!(!disk.is_locked());
}

#[test]
fn cancel_while_preparing_writes_nothing() {
    let (report, disk, before) = cancel_on(Phase::DevicePrepared, None);
    assert_eq!(report.outcome, Outcome::RolledBack);
    assert_eq!(report.bytes_attempted, 0);
    assert_eq!(disk.write_calls(), 0);
    assert_eq!(disk.snapshot(), before);
}

#[test]
fn cancel_after_formatting_fails_the_session() {
    let (report, _disk, _) = cancel_on(Phase::Formatted, None);
    let failure = failure_of(&report);
    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert_eq!(failure.phase, Phase::Formatted);
}

#[test]
fn cancel_during_copy_stops_between_batches() {
    let (report, disk, _) = cancel_on(Phase::ContentCopying, None);
    let failure = failure_of(&report);
    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert_eq!(failure.phase, Phase::ContentCopying);
    assert!(report.injection.is_none());
    assert!(!disk.is_locked());
}

#[tokio::test]
async fn spawned_session_streams_progress() {
    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("Stick", 128 * MIB);
    let image = image_of(&installer_volume());
    let mut handle = spawn_session(
        Arc::new(manager),
        device.clone(),
        image,
        SessionConfig::new(BootMode::Uefi),
        Arc::new(test_catalog()),
    );

    let mut phases = Vec::new();
    while let Some(event) = handle.progress.recv().await {
        if phases.last() != Some(&event.phase) {
            phases.push(event.phase);
        }
    }
    let report = handle.join(&device.id, BootMode::Uefi).await;

    assert!(report.is_completed(), "{:?}", report.outcome);
    assert_eq!(phases, FULL_RUN[1..]);
    assert_eq!(report.bytes_written, disk.bytes_written());
}

#[test]
#[ignore = "writes a 6 GiB volume to an 8 GiB simulated stick"]
fn full_size_uefi_write() {
    let mut builder = NtfsImageBuilder::new(6 * GIB);
    builder.file("bootmgr", Content::Bytes(pattern(5000, 1)));
    builder.file("efi/boot/bootx64.efi", Content::Bytes(pattern(12_000, 2)));
    builder.file(
        "sources/install.wim",
        Content::Sparse {
            head: pattern(1 << 20, 3),
            hole_clusters: 5 * GIB / 4096,
            tail: pattern(1 << 20, 4),
        },
    );
    let file = builder.build_file();
    let image = SourceImage::open(file.path()).unwrap();

    let manager = MockDeviceManager::new();
    let (device, disk) = manager.add_usb("Large Stick", 8 * GIB);
    let catalog = test_catalog();
    let report = WriteSession::new(SessionConfig::new(BootMode::Uefi), &catalog).run(
        &manager,
        &device,
        image,
        &mut NullProgress,
        &CancelToken::new(),
    );
    assert!(report.is_completed(), "{:?}", report.outcome);
    let data = report.layout.as_ref().unwrap().content_partition().start_lba;
    assert_eq!(disk.read_bytes(data * 512, 512)[3..11], *b"NTFS    ");
}
