//! The write session state machine.
//!
//! A session owns the locked device from open to close and walks
//! `Idle -> DevicePrepared -> Partitioned -> Formatted -> ContentCopying ->
//! DriverInjecting -> Verifying -> Completed`. The first error ends the
//! session in `Failed`. Cancellation is checked between phases and between
//! write batches; before formatting starts it restores the sectors the
//! partition table replaced and ends in `RolledBack`.

mod metered;

#[cfg(test)]
mod tests;

pub use metered::MeteredDevice;

use crate::fat32::{Fat32Volume, FormatOptions};
use crate::inject::{self, DriverCatalog, DriverVariant, InjectionReport, MAX_CLUSTER_BYTES};
use crate::partition::{footprint, plan, read_table, write_table};
use crate::partition::{ContentDemand, Layout, LayoutRequest, LayoutSeed};
use crate::source::{SourceEntries, SourceImage};
use crate::verify::{verify_records, VerificationRecord};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use winstick_core::{
    BlockDevice, BootMode, CancelToken, Device, DeviceManager, Geometry, Phase, ProgressEvent,
    ProgressSink, Result, SessionConfig, SessionFailure, WinstickError,
};

/// Terminal result of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Completed,
    Failed(SessionFailure),
    RolledBack,
}

impl Outcome {
    pub fn phase(&self) -> Phase {
        match self {
            Outcome::Completed => Phase::Completed,
            Outcome::Failed(_) => Phase::Failed,
            Outcome::RolledBack => Phase::RolledBack,
        }
    }
}

/// Everything a front end needs to know about a finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub device_id: String,
    pub boot_mode: BootMode,
    pub outcome: Outcome,
    /// Phases entered, in order, ending with the terminal one.
    pub history: Vec<Phase>,
    /// Bytes the device accepted.
    pub bytes_written: u64,
    /// Bytes handed to the device, including a failed final write.
    pub bytes_attempted: u64,
    pub layout: Option<Layout>,
    pub records: Vec<VerificationRecord>,
    pub injection: Option<InjectionReport>,
}

impl SessionReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == Outcome::Completed
    }

    pub fn failure(&self) -> Option<&SessionFailure> {
        match &self.outcome {
            Outcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// How source content reaches the device.
enum Content<R> {
    Raw(SourceImage<R>),
    Extracted(SourceEntries<R>),
}

/// Sectors saved before the table write, restored on rollback.
struct Snapshot {
    ranges: Vec<(u64, Vec<u8>)>,
}

impl Snapshot {
    fn take(device: &mut dyn BlockDevice) -> Result<Self> {
        let geometry = device.geometry();
        let mut ranges = Vec::new();
        for range in footprint(&geometry)? {
            let data = device.read_sectors(range.start, range.end - range.start)?;
            ranges.push((range.start, data));
        }
        Ok(Self { ranges })
    }

    fn restore(&self, device: &mut dyn BlockDevice) -> Result<()> {
        for (lba, data) in &self.ranges {
            device.write_sectors(*lba, data)?;
        }
        device.flush()
    }
}

/// Seed every identifier from the inputs so equal inputs give equal media.
pub fn session_seed<R: Read + Seek>(
    image: &SourceImage<R>,
    geometry: &Geometry,
    mode: BootMode,
    variant: &DriverVariant,
) -> LayoutSeed {
    LayoutSeed::derive(&[
        &image.serial().to_le_bytes(),
        &image.volume_len().to_le_bytes(),
        &geometry.total_sectors.to_le_bytes(),
        &geometry.sector_size.to_le_bytes(),
        mode.as_str().as_bytes(),
        variant.id.as_bytes(),
    ])
}

/// The layout a session would write for `image` on a device of `geometry`.
pub fn plan_session<R: Read + Seek>(
    geometry: &Geometry,
    mode: BootMode,
    variant: &DriverVariant,
    image: &SourceImage<R>,
) -> Result<Layout> {
    let demand = if mode.copies_raw_volume() {
        ContentDemand::Raw {
            bytes: image.volume_len(),
        }
    } else {
        ContentDemand::Extracted {
            entries: image.demand(),
        }
    };
    let request = LayoutRequest {
        demand,
        driver_reserve: variant.payload_bytes(MAX_CLUSTER_BYTES),
        seed: session_seed(image, geometry, mode, variant),
    };
    plan(geometry, mode, &request)
}

/// One run against one device.
pub struct WriteSession<'a> {
    config: SessionConfig,
    catalog: &'a DriverCatalog,
    phase: Phase,
    history: Vec<Phase>,
    layout: Option<Layout>,
    records: Vec<VerificationRecord>,
    injection: Option<InjectionReport>,
}

impl<'a> WriteSession<'a> {
    pub fn new(config: SessionConfig, catalog: &'a DriverCatalog) -> Self {
        Self {
            config,
            catalog,
            phase: Phase::Idle,
            history: vec![Phase::Idle],
            layout: None,
            records: Vec::new(),
            injection: None,
        }
    }

    fn enter(&mut self, phase: Phase, progress: &mut dyn ProgressSink, bytes_total: u64) {
        info!("Session phase {} -> {}", self.phase, phase);
        self.phase = phase;
        self.history.push(phase);
        progress.report(ProgressEvent {
            phase,
            bytes_done: 0,
            bytes_total,
        });
    }

    /// Run the whole session. The device is closed, and its lock released,
    /// on every path out of here.
    pub fn run<R: Read + Seek>(
        mut self,
        manager: &dyn DeviceManager,
        device: &Device,
        image: SourceImage<R>,
        progress: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> SessionReport {
        info!(
            "Starting {} session on {} ({})",
            self.config.boot_mode, device.id, device.name
        );
        let mut handle: Option<MeteredDevice> = None;
        let result = self.execute(manager, device, image, &mut handle, progress, cancel);

        let outcome = match result {
            Ok(()) => Outcome::Completed,
            Err(Stop::RolledBack) => Outcome::RolledBack,
            Err(Stop::Failed(err)) => {
                let failure = SessionFailure::new(&err, self.phase);
                warn!("Session failed: {}", failure);
                Outcome::Failed(failure)
            }
        };
        let terminal = outcome.phase();
        self.history.push(terminal);
        progress.report(ProgressEvent {
            phase: terminal,
            bytes_done: 0,
            bytes_total: 0,
        });

        let (bytes_written, bytes_attempted) = match handle {
            Some(metered) => {
                let counts = (metered.bytes_written(), metered.bytes_attempted());
                if let Err(err) = metered.close() {
                    warn!("Closing {} failed: {}", device.id, err);
                }
                counts
            }
            None => (0, 0),
        };
        info!(
            "Session on {} ended {:?}: {} bytes written",
            device.id, terminal, bytes_written
        );
        SessionReport {
            device_id: device.id.clone(),
            boot_mode: self.config.boot_mode,
            outcome,
            history: self.history,
            bytes_written,
            bytes_attempted,
            layout: self.layout,
            records: self.records,
            injection: self.injection,
        }
    }

    /// Stop at a phase boundary if cancellation was requested.
    fn checkpoint(
        &self,
        cancel: &CancelToken,
        device: &mut dyn BlockDevice,
        snapshot: Option<&Snapshot>,
    ) -> std::result::Result<(), Stop> {
        if !cancel.is_cancelled() {
            return Ok(());
        }
        if self.phase.can_roll_back() {
            warn!("Cancelled during {}, restoring the original table sectors", self.phase);
            if let Some(snapshot) = snapshot {
                snapshot.restore(device)?;
            }
            return Err(Stop::RolledBack);
        }
        Err(Stop::Failed(WinstickError::Cancelled))
    }

    fn execute<R: Read + Seek>(
        &mut self,
        manager: &dyn DeviceManager,
        device: &Device,
        image: SourceImage<R>,
        handle: &mut Option<MeteredDevice>,
        progress: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> std::result::Result<(), Stop> {
        let mode = self.config.boot_mode;
        self.config.validate()?;
        if let Some(refusal) = device.refusal(self.config.allow_non_removable) {
            return Err(refusal.into());
        }
        let catalog = self.catalog;
        let variant = catalog.select(&self.config.driver_variant, mode)?;
        if cancel.is_cancelled() {
            return Err(Stop::Failed(WinstickError::Cancelled));
        }

        let opened = manager.open(device, self.config.allow_non_removable)?;
        let device_handle = handle.insert(MeteredDevice::new(opened));
        let dev: &mut dyn BlockDevice = device_handle;
        let geometry = dev.geometry();

        // Planning is pure, so every sizing failure lands before the first write
        self.enter(Phase::DevicePrepared, progress, 0);
        let layout = plan_session(&geometry, mode, variant, &image)?;
        self.layout = Some(layout.clone());
        let timestamp = image.timestamp();
        let volume_id = session_seed(&image, &geometry, mode, variant).volume_id("boot-volume");
        let mut content = if mode.copies_raw_volume() {
            Content::Raw(image)
        } else {
            Content::Extracted(image.entries()?)
        };
        let snapshot = Snapshot::take(dev)?;
        self.checkpoint(cancel, dev, None)?;

        self.enter(Phase::Partitioned, progress, 0);
        let mut table_record = write_table(dev, &layout.table)?;
        dev.flush()?;
        self.checkpoint(cancel, dev, Some(&snapshot))?;

        self.enter(Phase::Formatted, progress, 0);
        let options = FormatOptions {
            label: "WINSTICK".to_string(),
            volume_id,
            timestamp,
            batch_sectors: self.config.batch_sectors,
        };
        let mut volume = Fat32Volume::format(dev, layout.boot_partition(), options)?;
        self.checkpoint(cancel, dev, None)?;

        let content_record = match &mut content {
            Content::Raw(image) => {
                let total = image.volume_len();
                self.enter(Phase::ContentCopying, progress, total);
                Some(self.copy_raw(dev, image, &layout, progress, cancel)?)
            }
            Content::Extracted(entries) => {
                let total = entries.total_bytes();
                self.enter(Phase::ContentCopying, progress, total);
                self.copy_entries(dev, &mut volume, entries, total, progress, cancel)?;
                None
            }
        };
        self.checkpoint(cancel, dev, None)?;

        self.enter(Phase::DriverInjecting, progress, 0);
        let injection = inject::inject(dev, &mut volume, &layout, variant, &mut table_record)?;
        self.injection = Some(injection);
        let boot_record = volume.finish(dev)?;
        dev.flush()?;
        self.records.push(table_record);
        self.records.push(boot_record);
        self.records.extend(content_record);
        self.checkpoint(cancel, dev, None)?;

        let total: u64 = self.records.iter().map(|r| r.sectors()).sum::<u64>() * geometry.sector_size as u64;
        self.enter(Phase::Verifying, progress, total);
        verify_records(dev, &mut self.records, progress, cancel)?;
        let written = read_table(dev)?;
        if written != layout.table {
            return Err(WinstickError::InvalidLayout(
                "partition table read back differs from the planned one".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Copy the NTFS volume byte for byte into the content partition.
    fn copy_raw<R: Read + Seek>(
        &self,
        dev: &mut dyn BlockDevice,
        image: &mut SourceImage<R>,
        layout: &Layout,
        progress: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> std::result::Result<VerificationRecord, Stop> {
        let sector_size = layout.geometry.sector_size as u64;
        let target = layout.content_partition();
        let total = image.volume_len();
        let batch = self.config.batch_sectors as u64 * sector_size;
        let mut record = VerificationRecord::new("content");
        let mut done = 0u64;
        info!(
            "Copying {} bytes of NTFS to LBA {} in {}-byte batches",
            total, target.start_lba, batch
        );

        while done < total {
            if cancel.is_cancelled() {
                return Err(Stop::Failed(WinstickError::Cancelled));
            }
            let len = batch.min(total - done);
            let mut data = image.raw_range(done, len as usize)?;
            // A volume ending mid-sector is padded with zeros
            data.resize((len.div_ceil(sector_size) * sector_size) as usize, 0);
            let lba = target.start_lba + done / sector_size;
            dev.write_sectors(lba, &data)?;
            record.record(lba, &data, sector_size as u32);
            done += len;
            trace!("Raw copy at LBA {}: {}/{} bytes", lba, done, total);
            progress.report(ProgressEvent {
                phase: Phase::ContentCopying,
                bytes_done: done,
                bytes_total: total,
            });
        }
        Ok(record)
    }

    /// Recreate the source tree in the FAT32 boot volume.
    fn copy_entries<R: Read + Seek>(
        &self,
        dev: &mut dyn BlockDevice,
        volume: &mut Fat32Volume,
        entries: &mut SourceEntries<R>,
        total: u64,
        progress: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> std::result::Result<(), Stop> {
        let chunk = (self.config.batch_sectors as usize * dev.geometry().sector_size as usize).max(4096);
        let mut buffer = vec![0u8; chunk];
        let mut done = 0u64;
        info!("Extracting {} entries ({} bytes)", entries.len(), total);

        while let Some(entry) = entries.next_entry() {
            if cancel.is_cancelled() {
                return Err(Stop::Failed(WinstickError::Cancelled));
            }
            let path = entry.info.path_string();
            let Some(mut content) = entry.content else {
                volume.create_directory(&path)?;
                if entry.info.attributes != Default::default() {
                    volume.set_attributes(&path, entry.info.attributes)?;
                }
                continue;
            };
            let mut writer = volume.create_file(dev, &path, entry.info.size)?;
            loop {
                let read = content.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                std::io::Write::write_all(&mut writer, &buffer[..read])?;
                done += read as u64;
                progress.report(ProgressEvent {
                    phase: Phase::ContentCopying,
                    bytes_done: done,
                    bytes_total: total,
                });
                if cancel.is_cancelled() {
                    return Err(Stop::Failed(WinstickError::Cancelled));
                }
            }
            let extent = writer.finish()?;
            volume.set_attributes(&path, entry.info.attributes)?;
            debug!("Extracted /{} ({} bytes)", path, extent.size);
        }
        Ok(())
    }
}

/// Why `execute` stopped early.
enum Stop {
    Failed(WinstickError),
    RolledBack,
}

impl From<WinstickError> for Stop {
    fn from(err: WinstickError) -> Self {
        Stop::Failed(err)
    }
}

impl From<std::io::Error> for Stop {
    fn from(err: std::io::Error) -> Self {
        Stop::Failed(err.into())
    }
}

/// A session running on a blocking worker thread.
pub struct SessionHandle {
    pub progress: mpsc::UnboundedReceiver<ProgressEvent>,
    pub cancel: CancelToken,
    pub task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the report; a panicked worker becomes a failed session.
    pub async fn join(self, device_id: &str, boot_mode: BootMode) -> SessionReport {
        match self.task.await {
            Ok(report) => report,
            Err(err) => SessionReport {
                device_id: device_id.to_string(),
                boot_mode,
                outcome: Outcome::Failed(SessionFailure::new(
                    &WinstickError::Other(format!("session worker stopped: {}", err)),
                    Phase::Failed,
                )),
                history: vec![Phase::Failed],
                bytes_written: 0,
                bytes_attempted: 0,
                layout: None,
                records: Vec::new(),
                injection: None,
            },
        }
    }
}

/// Start a session on tokio's blocking pool and stream its progress.
pub fn spawn_session<R>(
    manager: Arc<dyn DeviceManager>,
    device: Device,
    image: SourceImage<R>,
    config: SessionConfig,
    catalog: Arc<DriverCatalog>,
) -> SessionHandle
where
    R: Read + Seek + Send + 'static,
{
    let (sender, receiver) = mpsc::unbounded_channel();
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let task = tokio::task::spawn_blocking(move || {
        let mut sink = sender;
        WriteSession::new(config, &catalog).run(manager.as_ref(), &device, image, &mut sink, &worker_cancel)
    });
    SessionHandle {
        progress: receiver,
        cancel,
        task,
    }
}
