//! USB mass-storage devices driven directly through their bulk endpoints.
//!
//! The operating system's block layer is bypassed: the mass-storage interface
//! is claimed with nusb, GET MAX LUN is issued on the control endpoint, and
//! [`ScsiBlockDevice`] speaks the bulk-only transport over the two bulk pipes.

use crate::scsi::{BulkTransport, ScsiBlockDevice};
use async_trait::async_trait;
use log::{debug, info, warn};
use nusb::descriptors::TransferType;
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, ControlIn, ControlType, In, Out, Recipient, TransferError};
use nusb::{DeviceInfo, MaybeFuture};
use std::io::{self, Read, Write};
use std::time::Duration;
use winstick_core::{BlockDevice, Device, DeviceManager, DeviceType, Result, WinstickError};

/// <https://www.usb.org/defined-class-codes>
pub const MASS_STORAGE_CLASS: u8 = 0x08;
/// SCSI transparent command set.
pub const SCSI_SUBCLASS: u8 = 0x06;
/// Bulk-only transport.
pub const BULK_ONLY_PROTOCOL: u8 = 0x50;

/// Class request on the interface (BOT 3.2).
const GET_MAX_LUN: u8 = 0xFE;
const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
/// Bytes per queued bulk transfer; a multiple of every bulk packet size.
const TRANSFER_BYTES: usize = 64 * 1024;
const QUEUED_TRANSFERS: usize = 4;

/// `(number, class, subclass, protocol)` of one interface.
pub type InterfaceClass = (u8, u8, u8, u8);

/// The mass-storage interface to claim, preferring SCSI over bulk-only transport.
pub fn storage_interface(interfaces: impl IntoIterator<Item = InterfaceClass>) -> Option<u8> {
    let storage: Vec<InterfaceClass> = interfaces
        .into_iter()
        .filter(|(_, class, _, _)| *class == MASS_STORAGE_CLASS)
        .collect();
    storage
        .iter()
        .find(|(_, _, subclass, protocol)| {
            *subclass == SCSI_SUBCLASS && *protocol == BULK_ONLY_PROTOCOL
        })
        .or_else(|| storage.first())
        .map(|(number, _, _, _)| *number)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub packet_size: usize,
}

/// Pick the first bulk IN and bulk OUT endpoint from `(address, is_bulk, max_packet_size)`.
pub fn bulk_endpoints(endpoints: &[(u8, bool, usize)]) -> Option<BulkEndpoints> {
    let bulk = || endpoints.iter().filter(|(_, is_bulk, _)| *is_bulk);
    let (bulk_in, packet_size) = bulk()
        .find(|(address, _, _)| address & 0x80 != 0)
        .map(|(address, _, size)| (*address, *size))?;
    let bulk_out = bulk()
        .find(|(address, _, _)| address & 0x80 == 0)
        .map(|(address, _, _)| *address)?;
    Some(BulkEndpoints {
        bulk_in,
        bulk_out,
        packet_size: packet_size.max(1),
    })
}

/// Highest LUN from a GET MAX LUN reply. Devices with a single unit may
/// stall the request instead of answering, which also means LUN 0.
pub fn decode_max_lun(reply: std::result::Result<Vec<u8>, TransferError>) -> Result<u8> {
    match reply {
        Ok(data) if data.len() == 1 => Ok(data[0] & 0x0F),
        Ok(data) => Err(WinstickError::Other(format!(
            "GET MAX LUN returned {} bytes",
            data.len()
        ))),
        Err(TransferError::Stall) => Ok(0),
        Err(e) => Err(WinstickError::Other(format!("GET MAX LUN failed: {}", e))),
    }
}

/// Bulk pipes seen as byte streams. A data phase ends when the buffer is
/// full or a short packet arrives.
pub struct StreamTransport<R, W> {
    reader: R,
    writer: W,
    packet_size: usize,
}

impl<R: Read + Send, W: Write + Send> StreamTransport<R, W> {
    pub fn new(reader: R, writer: W, packet_size: usize) -> Self {
        Self {
            reader,
            writer,
            packet_size: packet_size.max(1),
        }
    }
}

impl<R: Read + Send, W: Write + Send> BulkTransport for StreamTransport<R, W> {
    fn bulk_out(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn bulk_in(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..])?;
            filled += n;
            if n == 0 || n % self.packet_size != 0 {
                break;
            }
        }
        Ok(filled)
    }
}

/// The claimed interface has to outlive its endpoints' traffic.
struct UsbTransport {
    pipes: StreamTransport<EndpointRead<Bulk>, EndpointWrite<Bulk>>,
    _interface: nusb::Interface,
}

impl BulkTransport for UsbTransport {
    fn bulk_out(&mut self, data: &[u8]) -> io::Result<()> {
        self.pipes.bulk_out(data)
    }

    fn bulk_in(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pipes.bulk_in(buf)
    }
}

fn usb_error(context: &str, err: impl std::fmt::Display) -> WinstickError {
    WinstickError::Other(format!("{}: {}", context, err))
}

/// USB mass-storage devices reached through nusb instead of the OS block layer.
pub struct UsbDeviceManager;

impl UsbDeviceManager {
    fn device_id(info: &DeviceInfo) -> String {
        format!("usb:{}-{}", info.bus_id(), info.device_address())
    }

    fn interfaces(info: &DeviceInfo) -> Vec<InterfaceClass> {
        info.interfaces()
            .map(|i| (i.interface_number(), i.class(), i.subclass(), i.protocol()))
            .collect()
    }

    fn describe(info: &DeviceInfo) -> Option<Device> {
        let interfaces = Self::interfaces(info);
        if info.class() != MASS_STORAGE_CLASS && storage_interface(interfaces).is_none() {
            return None;
        }
        let name = match (info.manufacturer_string(), info.product_string()) {
            (Some(vendor), Some(product)) => format!("{} {}", vendor.trim(), product.trim()),
            (None, Some(product)) => product.trim().to_string(),
            _ => format!("USB {:04x}:{:04x}", info.vendor_id(), info.product_id()),
        };
        Some(Device {
            id: Self::device_id(info),
            name,
            // Capacity is only known after READ CAPACITY on open
            size: 0,
            sector_size: 512,
            device_type: DeviceType::USB,
            mount_points: vec![],
            // Medium removability is checked against INQUIRY when opened
            is_removable: true,
            is_system: false,
        })
    }

    fn find(device_id: &str) -> Result<DeviceInfo> {
        nusb::list_devices()
            .wait()
            .map_err(|e| usb_error("listing USB devices", e))?
            .find(|info| Self::device_id(info) == device_id)
            .ok_or_else(|| WinstickError::Other(format!("Device not found: {}", device_id)))
    }

    fn endpoints(usb: &nusb::Device, interface: u8) -> Result<BulkEndpoints> {
        let config = usb
            .active_configuration()
            .map_err(|e| usb_error("reading the active configuration", e))?;
        let endpoints: Vec<(u8, bool, usize)> = config
            .interface_alt_settings()
            .filter(|alt| alt.interface_number() == interface && alt.alternate_setting() == 0)
            .flat_map(|alt| {
                alt.endpoints()
                    .map(|ep| {
                        (
                            ep.address(),
                            ep.transfer_type() == TransferType::Bulk,
                            ep.max_packet_size(),
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        bulk_endpoints(&endpoints).ok_or_else(|| {
            WinstickError::Other(format!("interface {} has no bulk endpoint pair", interface))
        })
    }

    fn connect(device: &Device) -> Result<UsbTransport> {
        let info = Self::find(&device.id)?;
        let number = storage_interface(Self::interfaces(&info)).unwrap_or(0);
        let usb = info
            .open()
            .wait()
            .map_err(|e| usb_error(&format!("opening {}", device.id), e))?;
        let interface = usb.claim_interface(number).wait().map_err(|e| {
            WinstickError::DeviceBusy(format!(
                "{} interface {} is held by another driver (unbind usb-storage first): {}",
                device.id, number, e
            ))
        })?;

        let max_lun = decode_max_lun(
            interface
                .control_in(
                    ControlIn {
                        control_type: ControlType::Class,
                        recipient: Recipient::Interface,
                        request: GET_MAX_LUN,
                        value: 0,
                        index: number as u16,
                        length: 1,
                    },
                    CONTROL_TIMEOUT,
                )
                .wait(),
        )?;
        if max_lun > 0 {
            warn!("{} exposes {} units; only LUN 0 is used", device.id, max_lun + 1);
        }

        let endpoints = Self::endpoints(&usb, number)?;
        debug!(
            "{}: interface {}, bulk IN {:#04x}, bulk OUT {:#04x}, {}-byte packets",
            device.id, number, endpoints.bulk_in, endpoints.bulk_out, endpoints.packet_size
        );
        let reader = interface
            .endpoint::<Bulk, In>(endpoints.bulk_in)
            .map_err(|e| usb_error("claiming the bulk IN endpoint", e))?
            .reader(TRANSFER_BYTES)
            .with_num_transfers(QUEUED_TRANSFERS);
        let writer = interface
            .endpoint::<Bulk, Out>(endpoints.bulk_out)
            .map_err(|e| usb_error("claiming the bulk OUT endpoint", e))?
            .writer(TRANSFER_BYTES)
            .with_num_transfers(QUEUED_TRANSFERS);

        Ok(UsbTransport {
            pipes: StreamTransport::new(reader, writer, endpoints.packet_size),
            _interface: interface,
        })
    }
}

#[async_trait]
impl DeviceManager for UsbDeviceManager {
    async fn enumerate_devices(&self) -> Result<Vec<Device>> {
        let devices = nusb::list_devices()
            .await
            .map_err(|e| usb_error("listing USB devices", e))?;
        let mut storage: Vec<Device> = devices
            .filter_map(|info| {
                debug!("Scanning USB device {:?}", info);
                Self::describe(&info)
            })
            .collect();
        storage.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(storage)
    }

    fn open(&self, device: &Device, allow_non_removable: bool) -> Result<Box<dyn BlockDevice>> {
        if let Some(refusal) = device.refusal(allow_non_removable) {
            return Err(refusal);
        }
        let transport = Self::connect(device)?;
        let dev = ScsiBlockDevice::open(transport, &device.id, allow_non_removable)?;
        info!("Opened {} over the bulk-only transport", device.id);
        Ok(Box::new(dev))
    }
}
