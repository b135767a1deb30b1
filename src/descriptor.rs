use crate::wire::{Reader, Truncated, split_bcd};
use std::fmt::Display;
use thiserror::Error;

/// Wire size of the DFU functional descriptor.
pub const FUNCTIONAL_DESCRIPTOR_LEN: u8 = 9;

/// bDescriptorType of the DFU functional descriptor.
pub const DFU_FUNCTIONAL: u8 = 0x21;

/// Parse failures for the DFU functional descriptor.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DescriptorError {
    #[error("descriptor length is {0}, not the 9 bytes of a DFU functional descriptor")]
    BadLength(u8),

    #[error("descriptor type {0:#04x} is not DFU functional (0x21)")]
    BadType(u8),

    #[error(transparent)]
    Truncated(#[from] Truncated),
}

/// The 9-byte DFU functional descriptor attached to a DFU interface:
/// device capabilities and the timing parameters the engine must honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    pub can_download: bool,
    pub can_upload: bool,
    /// Device stays on the bus after manifestation and accepts requests.
    pub manifestation_tolerant: bool,
    /// Device drops off the bus by itself after DFU_DETACH.
    pub will_detach: bool,
    pub detach_timeout_ms: u16,
    /// Maximum bytes per DNLOAD/UPLOAD control transaction.
    pub transfer_size: u16,
    /// Raw bcdDFUVersion. 0x011A is the DfuSe dialect.
    pub bcd_dfu_version: u16,
}

impl FunctionalDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let mut r = Reader::new(bytes);

        let length = r.u8()?;
        if length != FUNCTIONAL_DESCRIPTOR_LEN {
            return Err(DescriptorError::BadLength(length));
        }
        let descriptor_type = r.u8()?;
        if descriptor_type != DFU_FUNCTIONAL {
            return Err(DescriptorError::BadType(descriptor_type));
        }

        let attributes = r.u8()?;
        Ok(Self {
            can_download: attributes & 0x01 != 0,
            can_upload: attributes & 0x02 != 0,
            manifestation_tolerant: attributes & 0x04 != 0,
            will_detach: attributes & 0x08 != 0,
            detach_timeout_ms: r.u16()?,
            transfer_size: r.u16()?,
            bcd_dfu_version: r.u16()?,
        })
    }

    pub fn dfu_version(&self) -> (u8, u8) {
        split_bcd(self.bcd_dfu_version)
    }
}

/// Identity of a discovered DFU device, taken from its device descriptor
/// and DFU functional descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identification {
    pub vendor_id: u16,
    pub product_id: u16,
    /// `bcdDevice`, split as major.minor.
    pub product_version: (u8, u8),
    pub dfu_version: (u8, u8),
}

impl Display for Identification {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} v{}.{:02x} (DFU {}.{:02x})",
            self.vendor_id,
            self.product_id,
            self.product_version.0,
            self.product_version.1,
            self.dfu_version.0,
            self.dfu_version.1,
        )
    }
}
