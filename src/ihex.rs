use crate::memory::RawMemory;
use crate::records::{RecordAccumulator, RecordError, hex_bytes};

const TYPE_DATA: u8 = 0x00;
const TYPE_EOF: u8 = 0x01;
const TYPE_EXT_SEGMENT: u8 = 0x02;
const TYPE_START_SEGMENT: u8 = 0x03;
const TYPE_EXT_LINEAR: u8 = 0x04;
const TYPE_START_LINEAR: u8 = 0x05;

/// Decode an Intel HEX image. Data records are coalesced into segments
/// while their absolute addresses stay contiguous; the file must end with
/// an EOF record.
pub fn parse(input: &str) -> Result<RawMemory, RecordError> {
    let mut acc = RecordAccumulator::new();
    let mut terminated = false;

    for raw in input.lines() {
        let line = acc.next_line();
        let text = raw.trim();
        if text.is_empty() {
            continue;
        }
        if terminated {
            return Err(RecordError::BadRecord {
                line,
                reason: "record after EOF record",
            });
        }

        let body = text.strip_prefix(':').ok_or(RecordError::BadRecord {
            line,
            reason: "missing ':' start code",
        })?;
        let bytes = hex_bytes(body, line)?;
        if bytes.len() < 5 {
            return Err(RecordError::BadRecord {
                line,
                reason: "record too short",
            });
        }

        let count = bytes[0] as usize;
        if bytes.len() != count + 5 {
            return Err(RecordError::BadRecord {
                line,
                reason: "byte count disagrees with record length",
            });
        }

        // Two's-complement checksum: all record bytes sum to zero.
        let sum = bytes[..bytes.len() - 1]
            .iter()
            .fold(0u8, |sum, b| sum.wrapping_add(*b));
        let expected = sum.wrapping_neg();
        let actual = bytes[bytes.len() - 1];
        if expected != actual {
            return Err(RecordError::BadChecksum {
                line,
                expected,
                actual,
            });
        }

        let addr = u16::from_be_bytes([bytes[1], bytes[2]]) as u64;
        let data = &bytes[4..4 + count];

        match bytes[3] {
            TYPE_DATA => acc.push(addr, data)?,
            TYPE_EOF => {
                if count != 0 {
                    return Err(RecordError::BadRecord {
                        line,
                        reason: "EOF record carries data",
                    });
                }
                terminated = true;
            }
            TYPE_EXT_SEGMENT => {
                let base = extension_value(data, line)?;
                acc.set_offset(base << 4);
            }
            TYPE_EXT_LINEAR => {
                let base = extension_value(data, line)?;
                acc.set_offset(base << 16);
            }
            TYPE_START_SEGMENT | TYPE_START_LINEAR => {
                // Entry-point records: verified, not part of the image.
                if count != 4 {
                    return Err(RecordError::BadRecord {
                        line,
                        reason: "start-address record is not 4 bytes",
                    });
                }
            }
            _ => {
                return Err(RecordError::BadRecord {
                    line,
                    reason: "unknown record type",
                });
            }
        }
    }

    if !terminated {
        return Err(RecordError::MissingTerminator);
    }
    acc.into_memory()
}

fn extension_value(data: &[u8], line: u32) -> Result<u64, RecordError> {
    match data {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo]) as u64),
        _ => Err(RecordError::BadRecord {
            line,
            reason: "address extension record is not 2 bytes",
        }),
    }
}
