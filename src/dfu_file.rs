use crate::memory::{NamedMemory, OverlapRejected, RawMemory, Segment};
use crate::wire::{self, Reader, Writer};
use log::warn;
use std::fmt::{Display, LowerHex, Write as _};
use thiserror::Error;

/// Minimum (and, in practice, universal) DFU suffix length.
const MIN_SUFFIX_LEN: u8 = 16;

/// "DFU" as it appears in the little-endian suffix tail.
const SUFFIX_SIGNATURE: &[u8; 3] = b"UFD";
const DFUSE_SIGNATURE: &[u8; 5] = b"DfuSe";
const TARGET_SIGNATURE: &[u8; 6] = b"Target";

/// bcdDFU values this tool understands.
pub const BCD_DFU_1_0: u16 = 0x0100;
pub const BCD_DFU_1_1: u16 = 0x0110;
pub const BCD_DFUSE_1_1A: u16 = 0x011a;

/// Sentinel start address for the single segment of a plain DFU payload,
/// which carries no address information.
pub const NO_ADDRESS: u64 = 0xffff_ffff;

/// A 16-bit ID that may be wildcarded (0xFFFF in the suffix). Has
/// functions for pretty-printing and wildcard matching.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OptionalId(pub Option<u16>);

impl OptionalId {
    pub fn matches(&self, cmp: u16) -> bool {
        match self.0 {
            None => true,
            Some(id) => id == cmp,
        }
    }

    fn fmt_helper<F>(&self, f: &mut std::fmt::Formatter, delegate: F) -> std::fmt::Result
    where
        F: FnOnce(&u16, &mut std::fmt::Formatter) -> std::fmt::Result,
    {
        match self.0 {
            Some(id) => delegate(&id, f),
            None => {
                for _ in 0..f.width().unwrap_or(4) {
                    f.write_char('?')?
                }
                Ok(())
            }
        }
    }
}

impl Display for OptionalId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.fmt_helper(f, Display::fmt)
    }
}

impl LowerHex for OptionalId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.fmt_helper(f, LowerHex::fmt)
    }
}

impl From<u16> for OptionalId {
    fn from(val: u16) -> Self {
        OptionalId(match val {
            0xffff => None,
            i => Some(i),
        })
    }
}

impl From<OptionalId> for u16 {
    fn from(val: OptionalId) -> u16 {
        val.0.unwrap_or(0xffff)
    }
}

/// All errors that can happen while decoding a firmware update file.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum FileError {
    #[error("DFU signature is not present; are you sure this is a DFU file?")]
    BadSignature,

    #[error("file is shorter than the DFU suffix")]
    FileTooShort,

    #[error("DFU suffix length field is invalid ({0} bytes)")]
    BadSuffixLength(u8),

    #[error("bad CRC32 checksum: expected {expected:#010x}, got {actual:#010x}")]
    BadCrc { expected: u32, actual: u32 },

    #[error("unsupported DFU specification version {0:#06x}")]
    UnsupportedVersion(u16),

    #[error("DfuSe container is malformed: {0}")]
    BadFormat(&'static str),

    #[error("DfuSe container truncated")]
    Truncated(#[from] wire::Truncated),

    #[error("firmware image is inconsistent")]
    Overlap(#[from] OverlapRejected),
}

/// The identity fields of a DFU file suffix. The CRC and length fields
/// are consumed during parsing and regenerated during serialization.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Suffix {
    /// Firmware release the payload carries (`bcdDevice`).
    pub product_version: OptionalId,
    pub product_id: OptionalId,
    pub vendor_id: OptionalId,
    /// Raw `bcdDFU` field. 0x011A marks a DfuSe container.
    pub dfu_version: u16,
}

impl Suffix {
    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == BCD_DFUSE_1_1A
    }

    /// Parse the suffix from the tail of `file`. Returns the suffix and
    /// the payload length (everything before the suffix).
    pub fn parse(file: &[u8]) -> Result<(Suffix, usize), FileError> {
        if file.len() < MIN_SUFFIX_LEN as usize {
            return Err(FileError::FileTooShort);
        }

        let mut r = Reader::new(&file[file.len() - MIN_SUFFIX_LEN as usize..]);
        let product_version = r.u16()?.into();
        let product_id = r.u16()?.into();
        let vendor_id = r.u16()?.into();
        let dfu_version = r.u16()?;

        if r.bytes(3)? != SUFFIX_SIGNATURE {
            return Err(FileError::BadSignature);
        }

        let suffix_len = r.u8()?;
        if suffix_len < MIN_SUFFIX_LEN || suffix_len as usize > file.len() {
            return Err(FileError::BadSuffixLength(suffix_len));
        }
        if suffix_len > MIN_SUFFIX_LEN {
            warn!(
                "Got {} extra bytes in DFU suffix; continuing",
                suffix_len - MIN_SUFFIX_LEN
            );
        }

        // The CRC covers everything before its own four bytes.
        let expected = r.u32()?;
        let actual = suffix_crc(&file[..file.len() - 4]);
        if expected != actual {
            return Err(FileError::BadCrc { expected, actual });
        }

        Ok((
            Suffix {
                product_version,
                product_id,
                vendor_id,
                dfu_version,
            },
            file.len() - suffix_len as usize,
        ))
    }

    /// Append this suffix (with a freshly computed CRC) to a firmware
    /// payload, turning it into a valid DFU file.
    pub fn append_to(&self, file: &mut Vec<u8>) {
        let mut w = Writer::new();
        w.u16(self.product_version.into())
            .u16(self.product_id.into())
            .u16(self.vendor_id.into())
            .u16(self.dfu_version)
            .bytes(SUFFIX_SIGNATURE)
            .u8(MIN_SUFFIX_LEN);
        file.extend_from_slice(&w.into_vec());
        let crc = suffix_crc(file);
        file.extend_from_slice(&crc.to_le_bytes());
    }
}

/// Compute the CRC used by USB DFU 1.1: the bitwise NOT of the IEEE
/// CRC-32 over the given bytes.
pub fn suffix_crc(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    !hasher.finalize()
}

/// A fully decoded firmware update file: the suffix identity plus one
/// memory image per alt-setting, in the order the file declares them.
/// Plain DFU payloads become a single unnamed image for alt-setting 0.
#[derive(Debug, PartialEq, Eq)]
pub struct FirmwareFile {
    pub suffix: Suffix,
    pub images: Vec<(u8, NamedMemory)>,
}

/// Validate the suffix and decode the payload of a `.dfu` file.
pub fn parse(file: &[u8]) -> Result<FirmwareFile, FileError> {
    let (suffix, payload_len) = Suffix::parse(file)?;
    let payload = &file[..payload_len];

    let images = match suffix.dfu_version {
        BCD_DFUSE_1_1A => parse_dfuse(payload)?,
        BCD_DFU_1_0 | BCD_DFU_1_1 => {
            let mut memory = RawMemory::new();
            if !payload.is_empty() {
                memory.add(Segment::new(NO_ADDRESS, payload.to_vec()))?;
            }
            vec![(
                0,
                NamedMemory {
                    name: String::new(),
                    memory,
                },
            )]
        }
        other => return Err(FileError::UnsupportedVersion(other)),
    };

    Ok(FirmwareFile { suffix, images })
}

/// Decode the DfuSe prefix/target/element tree. The decode is strict:
/// every size field must agree with the bytes present, and nothing may
/// trail the last target.
fn parse_dfuse(payload: &[u8]) -> Result<Vec<(u8, NamedMemory)>, FileError> {
    let mut r = Reader::new(payload);

    if r.bytes(5)? != DFUSE_SIGNATURE {
        return Err(FileError::BadFormat("bad DfuSe signature"));
    }
    if r.u8()? != 0x01 {
        return Err(FileError::BadFormat("unsupported DfuSe prefix version"));
    }
    let image_size = r.u32()?;
    if image_size as usize != payload.len() {
        return Err(FileError::BadFormat("image size disagrees with payload"));
    }
    let target_count = r.u8()?;

    let mut images = Vec::with_capacity(target_count as usize);
    for _ in 0..target_count {
        if r.bytes(6)? != TARGET_SIGNATURE {
            return Err(FileError::BadFormat("bad target signature"));
        }
        let alt_setting = r.u8()?;
        let named = r.u32()? != 0;
        let name_field = r.bytes(255)?;
        let name = if named {
            let raw = name_field.split(|&b| b == 0).next().unwrap();
            std::str::from_utf8(raw)
                .map_err(|_| FileError::BadFormat("target name is not valid UTF-8"))?
                .to_owned()
        } else {
            String::new()
        };

        let target_size = r.u32()?;
        let element_count = r.u32()?;

        let before = r.remaining();
        let mut memory = RawMemory::new();
        for _ in 0..element_count {
            let address = r.u32()?;
            let size = r.u32()?;
            if size == 0 {
                return Err(FileError::BadFormat("zero-length element"));
            }
            let data = r.bytes(size as usize)?;
            memory.add(Segment::new(address as u64, data.to_vec()))?;
        }
        if before - r.remaining() != target_size as usize {
            return Err(FileError::BadFormat("target size disagrees with elements"));
        }

        images.push((alt_setting, NamedMemory { name, memory }));
    }

    if !r.is_empty() {
        return Err(FileError::BadFormat("trailing data after last target"));
    }
    Ok(images)
}
