use crate::descriptor::{
    DescriptorError, FUNCTIONAL_DESCRIPTOR_LEN, FunctionalDescriptor, Identification,
};
use crate::transport::{DfuTransport, TransportError};
use crate::wire::split_bcd;
use log::{debug, trace, warn};
use rusb::{Device, DeviceHandle, Direction, GlobalContext, Recipient, RequestType};
use std::time::Duration;
use thiserror::Error;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(3);

/// The DFU interface class triple: 0xFE/0x01, protocol 1 (runtime) or 2
/// (DFU mode).
const DFU_CLASS: u8 = 0xfe;
const DFU_SUBCLASS: u8 = 0x01;
const DFU_PROTOCOLS: [u8; 2] = [0x01, 0x02];

/// Standard GET_INTERFACE request, used when the alternate setting has
/// never been set through this handle.
const REQUEST_GET_INTERFACE: u8 = 0x0a;

/// Errors raised while finding and opening DFU devices.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UsbError {
    #[error("no DFU-capable device matches {vendor_id:04x}:{product_id:04x}")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("device has no DFU interface")]
    NoDfuInterface,

    #[error("DFU functional descriptor is invalid")]
    Descriptor(#[from] DescriptorError),

    #[error("USB enumeration failed")]
    Usb(#[from] rusb::Error),
}

/// A DFU interface found during enumeration, not yet opened.
pub struct DfuCandidate {
    device: Device<GlobalContext>,
    pub identification: Identification,
    pub iface: u8,
    pub functional: FunctionalDescriptor,
    /// True when the interface reports protocol 1: the application
    /// firmware is running and a detach is needed first.
    pub runtime: bool,
}

impl DfuCandidate {
    /// Open the device and claim its DFU interface.
    pub fn open(self) -> Result<UsbTransport, UsbError> {
        let mut handle = self.device.open()?;
        // Best effort; unsupported off Linux.
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.claim_interface(self.iface)?;
        debug!(
            "Opened {} on interface {}",
            self.identification, self.iface
        );
        Ok(UsbTransport {
            device: self.device,
            handle: Some(handle),
            iface: self.iface,
            current_alt: None,
        })
    }
}

/// Scan the bus for DFU interfaces: class 0xFE, subclass 0x01, protocol
/// 1 or 2, carrying the 9-byte DFU functional descriptor.
pub fn discover() -> Result<Vec<DfuCandidate>, UsbError> {
    let mut found = Vec::new();
    for device in rusb::devices()?.iter() {
        match inspect(&device) {
            Ok(Some(candidate)) => found.push(candidate),
            Ok(None) => {}
            // Unconfigured or permission-restricted devices are common;
            // they just aren't candidates.
            Err(e) => trace!(
                "Skipping device at bus {:03} addr {:03}: {e}",
                device.bus_number(),
                device.address()
            ),
        }
    }
    Ok(found)
}

fn inspect(device: &Device<GlobalContext>) -> Result<Option<DfuCandidate>, UsbError> {
    let descriptor = device.device_descriptor()?;
    let config = device.active_config_descriptor()?;

    for interface in config.interfaces() {
        for alt in interface.descriptors() {
            if alt.class_code() != DFU_CLASS
                || alt.sub_class_code() != DFU_SUBCLASS
                || !DFU_PROTOCOLS.contains(&alt.protocol_code())
            {
                continue;
            }
            if alt.extra().len() != FUNCTIONAL_DESCRIPTOR_LEN as usize {
                debug!(
                    "DFU interface without a functional descriptor on {:04x}:{:04x}",
                    descriptor.vendor_id(),
                    descriptor.product_id()
                );
                continue;
            }

            let functional = FunctionalDescriptor::parse(alt.extra())?;
            let version = descriptor.device_version();
            let identification = Identification {
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                product_version: (
                    version.major(),
                    version.minor() << 4 | version.sub_minor(),
                ),
                dfu_version: split_bcd(functional.bcd_dfu_version),
            };
            return Ok(Some(DfuCandidate {
                device: device.clone(),
                identification,
                iface: alt.interface_number(),
                functional,
                runtime: alt.protocol_code() == 0x01,
            }));
        }
    }
    Ok(None)
}

/// Pick the device to operate on. Exact `(vid, pid)` matches win; when
/// there are none, any DFU interface with the right vendor ID is
/// considered, because a device already in DFU mode usually reports a
/// different product ID. The first match is used.
pub fn select(vendor_id: u16, product_id: u16) -> Result<DfuCandidate, UsbError> {
    let (exact, rest): (Vec<_>, Vec<_>) = discover()?.into_iter().partition(|c| {
        c.identification.vendor_id == vendor_id && c.identification.product_id == product_id
    });

    let mut pool = if exact.is_empty() {
        rest.into_iter()
            .filter(|c| c.identification.vendor_id == vendor_id)
            .collect()
    } else {
        exact
    };

    if pool.is_empty() {
        // Distinguish "not plugged in" from "plugged in but not DFU".
        let present = rusb::devices()?.iter().any(|d| {
            d.device_descriptor().is_ok_and(|desc| {
                desc.vendor_id() == vendor_id && desc.product_id() == product_id
            })
        });
        if present {
            return Err(UsbError::NoDfuInterface);
        }
        return Err(UsbError::DeviceNotFound {
            vendor_id,
            product_id,
        });
    }
    if pool.len() > 1 {
        warn!(
            "{} devices match the specification; using the first",
            pool.len()
        );
    }
    Ok(pool.swap_remove(0))
}

/// The libusb-backed [DfuTransport]. Owns the claimed interface for the
/// lifetime of the operation.
pub struct UsbTransport {
    device: Device<GlobalContext>,
    handle: Option<DeviceHandle<GlobalContext>>,
    iface: u8,
    /// Alternate setting selected through this handle, if any. Lets
    /// queries be answered without bus traffic.
    current_alt: Option<u8>,
}

impl UsbTransport {
    fn handle(&self) -> Result<&DeviceHandle<GlobalContext>, TransportError> {
        self.handle.as_ref().ok_or(TransportError::Closed)
    }

    fn handle_mut(&mut self) -> Result<&mut DeviceHandle<GlobalContext>, TransportError> {
        self.handle.as_mut().ok_or(TransportError::Closed)
    }

    fn language(&self) -> Result<rusb::Language, TransportError> {
        self.handle()?
            .read_languages(CONTROL_TIMEOUT)
            .map_err(map_usb_err)?
            .first()
            .copied()
            .ok_or_else(|| TransportError::Io("device reports no string languages".into()))
    }
}

fn map_usb_err(e: rusb::Error) -> TransportError {
    match e {
        rusb::Error::Pipe => TransportError::Stall,
        e => TransportError::Io(e.to_string()),
    }
}

impl DfuTransport for UsbTransport {
    fn read_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize, TransportError> {
        let request_type = rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface);
        self.handle()?
            .read_control(request_type, request, value, index, buf, CONTROL_TIMEOUT)
            .map_err(map_usb_err)
    }

    fn write_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        let request_type =
            rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface);
        self.handle()?
            .write_control(request_type, request, value, index, data, CONTROL_TIMEOUT)
            .map_err(map_usb_err)
    }

    fn set_alt_setting(&mut self, iface: u8, alt: u8) -> Result<(), TransportError> {
        self.handle_mut()?
            .set_alternate_setting(iface, alt)
            .map_err(map_usb_err)?;
        self.current_alt = Some(alt);
        Ok(())
    }

    fn get_alt_setting(&mut self, iface: u8) -> Result<u8, TransportError> {
        if let Some(alt) = self.current_alt {
            return Ok(alt);
        }
        // Never set through this handle; ask the device.
        let request_type =
            rusb::request_type(Direction::In, RequestType::Standard, Recipient::Interface);
        let mut buf = [0u8; 1];
        let len = self
            .handle()?
            .read_control(
                request_type,
                REQUEST_GET_INTERFACE,
                0,
                iface as u16,
                &mut buf,
                CONTROL_TIMEOUT,
            )
            .map_err(map_usb_err)?;
        if len < 1 {
            return Err(TransportError::Stall);
        }
        self.current_alt = Some(buf[0]);
        Ok(buf[0])
    }

    fn string_descriptor(&mut self, index: u8) -> Result<String, TransportError> {
        let language = self.language()?;
        let text = self
            .handle()?
            .read_string_descriptor(language, index, CONTROL_TIMEOUT)
            .map_err(map_usb_err)?;
        Ok(text.trim_end_matches('\0').to_owned())
    }

    fn alt_string(&mut self, iface: u8, alt: u8) -> Result<String, TransportError> {
        let config = self
            .device
            .active_config_descriptor()
            .map_err(map_usb_err)?;
        let index = config
            .interfaces()
            .flat_map(|i| i.descriptors())
            .find(|d| d.interface_number() == iface && d.setting_number() == alt)
            .and_then(|d| d.description_string_index())
            .ok_or_else(|| {
                TransportError::Io(format!("alternate setting {alt} has no string descriptor"))
            })?;
        self.string_descriptor(index)
    }

    fn bus_reset(&mut self) -> Result<(), TransportError> {
        match self.handle_mut()?.reset() {
            Ok(()) => Ok(()),
            Err(rusb::Error::NotSupported) => Err(TransportError::ResetUnsupported),
            Err(e) => Err(map_usb_err(e)),
        }
    }

    fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            let _ = handle.release_interface(self.iface);
        }
        self.current_alt = None;
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}
