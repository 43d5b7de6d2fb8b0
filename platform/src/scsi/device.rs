use super::command::{self, CommandBlock, CommandStatus, Direction, InquiryData, Sense};
use log::{debug, info, warn};
use std::io;
use winstick_core::{
    BlockDevice, Device, DeviceType, Geometry, LockState, Result, WinstickError,
};

/// Largest data phase issued per READ(10)/WRITE(10).
const MAX_TRANSFER_BYTES: u32 = 128 * 1024;
/// Freshly attached sticks often report UNIT ATTENTION before they settle.
const READY_ATTEMPTS: usize = 3;

/// The pair of bulk endpoints of a mass-storage interface.
pub trait BulkTransport: Send {
    fn bulk_out(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read up to `buf.len()` bytes, returning how many arrived.
    fn bulk_in(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A mass-storage device driven directly over the bulk-only transport.
pub struct ScsiBlockDevice<T: BulkTransport> {
    id: String,
    transport: T,
    lun: u8,
    tag: u32,
    geometry: Geometry,
    inquiry: InquiryData,
    removal_prevented: bool,
}

impl<T: BulkTransport> ScsiBlockDevice<T> {
    /// Bring the unit up: TEST UNIT READY, INQUIRY, PREVENT MEDIUM REMOVAL, READ CAPACITY.
    pub fn open(transport: T, id: &str, allow_non_removable: bool) -> Result<Self> {
        let mut dev = Self {
            id: id.to_string(),
            transport,
            lun: 0,
            tag: 0,
            geometry: Geometry::new(512, 0),
            inquiry: InquiryData {
                peripheral_type: 0,
                removable: false,
                vendor: String::new(),
                product: String::new(),
                revision: String::new(),
            },
            removal_prevented: false,
        };

        let mut ready = Err(WinstickError::Other("unit never became ready".to_string()));
        for attempt in 1..=READY_ATTEMPTS {
            ready = dev.execute(&command::test_unit_ready(), None).map(|_| ());
            if ready.is_ok() {
                break;
            }
            debug!("{}: TEST UNIT READY attempt {} failed", dev.id, attempt);
        }
        ready?;

        let data = dev.execute(&command::inquiry(), None)?;
        dev.inquiry = command::parse_inquiry(&data)
            .ok_or_else(|| WinstickError::Other(format!("{}: short INQUIRY response", dev.id)))?;
        if !dev.inquiry.removable && !allow_non_removable {
            return Err(WinstickError::NotRemovable(format!(
                "{} ({} {}) reports a fixed medium",
                dev.id, dev.inquiry.vendor, dev.inquiry.product
            )));
        }

        dev.execute(&command::prevent_allow_medium_removal(true), None)?;
        dev.removal_prevented = true;

        let data = dev.execute(&command::read_capacity_10(), None)?;
        let capacity = command::parse_read_capacity(&data)
            .ok_or_else(|| WinstickError::Other(format!("{}: short READ CAPACITY", dev.id)))?;
        if capacity.last_lba == u32::MAX {
            return Err(WinstickError::Other(format!(
                "{} is too large for READ CAPACITY(10)",
                dev.id
            )));
        }
        if !capacity.block_len.is_power_of_two() || capacity.block_len < 512 {
            return Err(WinstickError::Other(format!(
                "{} reports a {}-byte block",
                dev.id, capacity.block_len
            )));
        }
        dev.geometry = Geometry::new(capacity.block_len, capacity.blocks());

        info!(
            "{}: {} {} rev {}, {} blocks of {} bytes",
            dev.id,
            dev.inquiry.vendor,
            dev.inquiry.product,
            dev.inquiry.revision,
            capacity.blocks(),
            capacity.block_len
        );
        Ok(dev)
    }

    pub fn inquiry(&self) -> &InquiryData {
        &self.inquiry
    }

    pub fn describe(&self) -> Device {
        Device {
            id: self.id.clone(),
            name: format!("{} {}", self.inquiry.vendor, self.inquiry.product),
            size: self.geometry.size_bytes(),
            sector_size: self.geometry.sector_size,
            device_type: DeviceType::USB,
            mount_points: vec![],
            is_removable: self.inquiry.removable,
            is_system: false,
        }
    }

    fn blocks_per_transfer(&self) -> u64 {
        (MAX_TRANSFER_BYTES / self.geometry.sector_size).clamp(1, u16::MAX as u32) as u64
    }

    /// One CBW / data / CSW exchange.
    fn transact(
        &mut self,
        block: &CommandBlock,
        data_out: Option<&[u8]>,
    ) -> io::Result<(CommandStatus, Vec<u8>)> {
        self.tag = self.tag.wrapping_add(1);
        self.transport
            .bulk_out(&command::encode_cbw(self.tag, self.lun, block))?;

        let mut data = Vec::new();
        match block.direction {
            Direction::DataIn => {
                data = vec![0u8; block.data_transfer_len as usize];
                let received = self.transport.bulk_in(&mut data)?;
                data.truncate(received);
            }
            Direction::DataOut => self.transport.bulk_out(data_out.unwrap_or(&[]))?,
            Direction::NonDirectional => {}
        }

        let mut csw = [0u8; command::CSW_LEN];
        let received = self.transport.bulk_in(&mut csw)?;
        let status = command::decode_csw(&csw[..received])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if status.tag != self.tag {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("CSW tag {} does not match CBW tag {}", status.tag, self.tag),
            ));
        }
        Ok((status.status, data))
    }

    /// Run a command, turning CHECK CONDITION into an error that carries the sense data.
    fn execute(&mut self, block: &CommandBlock, data_out: Option<&[u8]>) -> Result<Vec<u8>> {
        let (status, data) = self.transact(block, data_out)?;
        match status {
            CommandStatus::Passed => Ok(data),
            CommandStatus::PhaseError => Err(WinstickError::Other(format!(
                "{}: phase error on opcode {:#04x}; the device needs a reset",
                self.id,
                block.opcode()
            ))),
            CommandStatus::Failed => {
                let sense = match self.transact(&command::request_sense(), None) {
                    Ok((CommandStatus::Passed, data)) => command::parse_sense(&data),
                    _ => None,
                };
                Err(self.check_condition(block.opcode(), sense))
            }
        }
    }

    fn check_condition(&self, opcode: u8, sense: Option<Sense>) -> WinstickError {
        let Some(sense) = sense else {
            return WinstickError::Io {
                sectors: None,
                source: io::Error::new(
                    io::ErrorKind::Other,
                    format!("{}: opcode {:#04x} failed without sense data", self.id, opcode),
                ),
            };
        };
        let detail = format!(
            "{}: opcode {:#04x} failed, sense key {:#x} asc {:#04x} ascq {:#04x}",
            self.id, opcode, sense.key, sense.asc, sense.ascq
        );
        match sense.key {
            command::SENSE_DATA_PROTECT => WinstickError::PermissionDenied(format!(
                "{} (medium is write protected)",
                detail
            )),
            command::SENSE_NOT_READY => WinstickError::Io {
                sectors: None,
                source: io::Error::new(io::ErrorKind::NotConnected, detail),
            },
            _ => WinstickError::Io {
                sectors: None,
                source: io::Error::new(io::ErrorKind::Other, detail),
            },
        }
    }
}

impl<T: BulkTransport> BlockDevice for ScsiBlockDevice<T> {
    fn id(&self) -> &str {
        &self.id
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn lock_state(&self) -> LockState {
        if self.removal_prevented {
            LockState::ExclusivelyLocked
        } else {
            LockState::Unlocked
        }
    }

    fn read_sectors(&mut self, start: u64, count: u64) -> Result<Vec<u8>> {
        self.geometry.check_range(start, count)?;
        let block_size = self.geometry.sector_size;
        let mut out = Vec::with_capacity((count * block_size as u64) as usize);
        let mut lba = start;
        while lba < start + count {
            let blocks = self.blocks_per_transfer().min(start + count - lba);
            let block = command::read_10(lba as u32, blocks as u16, block_size);
            let data = self
                .execute(&block, None)
                .map_err(|e| e.with_sectors(lba..lba + blocks))?;
            if data.len() as u64 != blocks * block_size as u64 {
                return Err(WinstickError::io_at(
                    lba..lba + blocks,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "short READ(10) data phase"),
                ));
            }
            out.extend_from_slice(&data);
            lba += blocks;
        }
        Ok(out)
    }

    fn write_sectors(&mut self, start: u64, data: &[u8]) -> Result<()> {
        let count = self.geometry.check_write(start, data.len())?;
        let block_size = self.geometry.sector_size;
        let mut lba = start;
        for chunk in data.chunks((self.blocks_per_transfer() * block_size as u64) as usize) {
            let blocks = chunk.len() as u64 / block_size as u64;
            let block = command::write_10(lba as u32, blocks as u16, block_size);
            self.execute(&block, Some(chunk))
                .map_err(|e| e.with_sectors(lba..lba + blocks))?;
            lba += blocks;
        }
        debug_assert_eq!(lba, start + count);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.execute(&command::synchronize_cache_10(), None)
            .map(|_| ())
    }
}

impl<T: BulkTransport> Drop for ScsiBlockDevice<T> {
    fn drop(&mut self) {
        if self.removal_prevented {
            if let Err(e) = self.execute(&command::prevent_allow_medium_removal(false), None) {
                warn!("{}: could not re-allow medium removal: {}", self.id, e);
            }
            self.removal_prevented = false;
        }
    }
}
