use crate::memory::RawMemory;
use crate::records::{RecordAccumulator, RecordError, hex_bytes};

/// Decode a Motorola S-record image. S1/S2/S3 records contribute data,
/// header and count records are verified only, and the start-address
/// records S7/S8/S9 flush the accumulated segment.
pub fn parse(input: &str) -> Result<RawMemory, RecordError> {
    let mut acc = RecordAccumulator::new();
    let mut data_records: u32 = 0;

    for raw in input.lines() {
        let line = acc.next_line();
        let text = raw.trim();
        if text.is_empty() {
            continue;
        }

        let body = text.strip_prefix('S').ok_or(RecordError::BadRecord {
            line,
            reason: "missing 'S' signature",
        })?;
        let (kind, rest) = body.split_at_checked(1).ok_or(RecordError::BadRecord {
            line,
            reason: "record too short",
        })?;
        let kind: u8 = kind.parse().map_err(|_| RecordError::BadRecord {
            line,
            reason: "record type is not a digit",
        })?;

        let bytes = hex_bytes(rest, line)?;
        if bytes.len() < 4 {
            return Err(RecordError::BadRecord {
                line,
                reason: "record too short",
            });
        }
        let count = bytes[0] as usize;
        if bytes.len() != count + 1 {
            return Err(RecordError::BadRecord {
                line,
                reason: "byte count disagrees with record length",
            });
        }

        // One's-complement checksum over count, address and data.
        let sum = bytes[..bytes.len() - 1]
            .iter()
            .fold(0u8, |sum, b| sum.wrapping_add(*b));
        let expected = !sum;
        let actual = bytes[bytes.len() - 1];
        if expected != actual {
            return Err(RecordError::BadChecksum {
                line,
                expected,
                actual,
            });
        }

        let addr_len = match kind {
            0 | 1 | 5 | 9 => 2,
            2 | 6 | 8 => 3,
            3 | 7 => 4,
            _ => {
                return Err(RecordError::BadRecord {
                    line,
                    reason: "unknown record type",
                });
            }
        };
        if count < addr_len + 1 {
            return Err(RecordError::BadRecord {
                line,
                reason: "record shorter than its address field",
            });
        }
        let addr = bytes[1..1 + addr_len]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64);
        let data = &bytes[1 + addr_len..bytes.len() - 1];

        match kind {
            // Header: vendor text, not part of the image.
            0 => {}
            1 | 2 | 3 => {
                acc.push(addr, data)?;
                data_records += 1;
            }
            5 | 6 => {
                if addr as u32 != data_records {
                    return Err(RecordError::BadRecord {
                        line,
                        reason: "record count disagrees with data records seen",
                    });
                }
            }
            // Start address: flushes the image, execution entry not stored.
            7 | 8 | 9 => acc.flush()?,
            _ => unreachable!(),
        }
    }

    acc.into_memory()
}
