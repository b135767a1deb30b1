use dfu_flash::protocol::DfuState;
use dfu_flash::transport::{DfuTransport, TransportError};
use std::collections::HashMap;

/// One observed request, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Detach,
    Dnload { block: u16, len: usize },
    Upload { block: u16 },
    StatusPolled(DfuState),
    ClrStatus,
    StatePolled,
    Abort,
    SetAlt(u8),
    BusReset,
    Closed,
}

/// A scripted DFU device behind the transport trait. It follows the DFU
/// state chart far enough to exercise the engine: busy polling, the
/// DfuSe command channel, manifestation, uploads, and a handful of fault
/// injections.
pub struct MockDfu {
    pub events: Vec<Event>,

    state: DfuState,
    error_code: u8,
    open: bool,
    dead: bool,
    alt: u8,
    pub alt_strings: Vec<String>,
    pub strings: HashMap<u8, String>,
    /// Index reported in the GETSTATUS iString field.
    pub i_string: u8,

    /// DfuSe dialect: block 0 is the command channel.
    pub dfuse: bool,
    next_write_addr: u32,
    pub set_addresses: Vec<u32>,
    pub erases: Vec<u32>,
    /// Firmware bytes in arrival order with their absolute addresses
    /// (DfuSe) and raw block payloads (both dialects).
    pub writes: Vec<(u32, Vec<u8>)>,
    pub blocks: Vec<(u16, Vec<u8>)>,
    blocks_seen: usize,

    /// GETSTATUS polls answered DnloadBusy after each block or command.
    pub busy_polls_per_op: u32,
    pending_busy: u32,
    pub poll_timeout_ms: u32,

    /// GETSTATUS polls answered Manifest after the zero-length DNLOAD.
    pub manifest_polls: u32,
    manifest_pending: u32,
    pub manifestation_tolerant: bool,
    /// Stop answering entirely once manifestation starts, like a device
    /// that tears down its USB stack by itself.
    pub die_at_manifest: bool,

    /// Stall every DFU_DETACH, like a device that drops off the bus
    /// before completing the transfer.
    pub detach_stalls: bool,
    /// Enter the error state after this many firmware blocks.
    pub error_after_blocks: Option<(usize, u8)>,

    pub upload_image: Vec<u8>,
    upload_pos: usize,
}

impl MockDfu {
    pub fn new(initial_state: DfuState) -> Self {
        Self {
            events: Vec::new(),
            state: initial_state,
            error_code: 0,
            open: true,
            dead: false,
            alt: 0,
            alt_strings: Vec::new(),
            strings: HashMap::new(),
            i_string: 0,
            dfuse: false,
            next_write_addr: 0,
            set_addresses: Vec::new(),
            erases: Vec::new(),
            writes: Vec::new(),
            blocks: Vec::new(),
            blocks_seen: 0,
            busy_polls_per_op: 0,
            pending_busy: 0,
            poll_timeout_ms: 0,
            manifest_polls: 0,
            manifest_pending: 0,
            manifestation_tolerant: true,
            die_at_manifest: false,
            detach_stalls: false,
            error_after_blocks: None,
            upload_image: Vec::new(),
            upload_pos: 0,
        }
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    pub fn force_error(&mut self, code: u8) {
        self.state = DfuState::Error;
        self.error_code = code;
    }

    pub fn force_state(&mut self, state: DfuState) {
        self.state = state;
    }

    fn begin_busy(&mut self) {
        self.pending_busy = self.busy_polls_per_op;
        self.state = DfuState::DnloadBusy;
    }

    fn check_alive(&self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        if self.dead {
            return Err(TransportError::Io("device dropped off the bus".into()));
        }
        Ok(())
    }

    fn handle_dnload(&mut self, block: u16, data: &[u8]) -> Result<usize, TransportError> {
        self.events.push(Event::Dnload {
            block,
            len: data.len(),
        });

        if data.is_empty() {
            // End of transfer phase; manifestation begins.
            self.manifest_pending = self.manifest_polls;
            self.state = DfuState::Manifest;
            if self.die_at_manifest {
                self.dead = true;
            }
            return Ok(0);
        }

        if self.dfuse && block == 0 {
            match (data[0], data.len()) {
                (0x21, 5) => {
                    let addr = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                    self.set_addresses.push(addr);
                    self.next_write_addr = addr;
                    self.begin_busy();
                }
                (0x41, 5) => {
                    let addr = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                    self.erases.push(addr);
                    self.begin_busy();
                }
                (0x00 | 0x92, 1) => self.begin_busy(),
                _ => {
                    self.error_code = 0x0f; // errSTALLEDPKT
                    self.state = DfuState::Error;
                }
            }
            return Ok(data.len());
        }

        // Firmware block.
        self.blocks_seen += 1;
        if let Some((after, code)) = self.error_after_blocks {
            if self.blocks_seen > after {
                self.force_error(code);
                return Ok(data.len());
            }
        }
        if self.dfuse {
            self.writes.push((self.next_write_addr, data.to_vec()));
            self.next_write_addr += data.len() as u32;
        }
        self.blocks.push((block, data.to_vec()));
        self.begin_busy();
        Ok(data.len())
    }

    fn poll_status(&mut self) -> (u8, u32, DfuState) {
        let reported = match self.state {
            DfuState::DnloadBusy => {
                if self.pending_busy > 0 {
                    self.pending_busy -= 1;
                    DfuState::DnloadBusy
                } else {
                    self.state = DfuState::DnloadIdle;
                    DfuState::DnloadIdle
                }
            }
            DfuState::Manifest => {
                if self.manifest_pending > 0 {
                    self.manifest_pending -= 1;
                    DfuState::Manifest
                } else {
                    self.state = if self.manifestation_tolerant {
                        DfuState::Idle
                    } else {
                        DfuState::ManifestWaitReset
                    };
                    self.state
                }
            }
            s => s,
        };
        (self.error_code, self.poll_timeout_ms, reported)
    }

    fn handle_upload(&mut self, block: u16, buf: &mut [u8]) -> usize {
        self.events.push(Event::Upload { block });
        let remaining = self.upload_image.len() - self.upload_pos;
        let n = buf.len().min(remaining);
        buf[..n].copy_from_slice(&self.upload_image[self.upload_pos..self.upload_pos + n]);
        self.upload_pos += n;
        self.state = if n > 0 && n == buf.len() {
            DfuState::UploadIdle
        } else {
            DfuState::Idle
        };
        n
    }
}

impl DfuTransport for MockDfu {
    fn read_control(
        &mut self,
        request: u8,
        value: u16,
        _index: u16,
        buf: &mut [u8],
    ) -> Result<usize, TransportError> {
        self.check_alive()?;
        match request {
            // DFU_UPLOAD
            2 => Ok(self.handle_upload(value, buf)),
            // DFU_GETSTATUS
            3 => {
                let (error, timeout, state) = self.poll_status();
                self.events.push(Event::StatusPolled(state));
                let response = [
                    error,
                    (timeout & 0xff) as u8,
                    ((timeout >> 8) & 0xff) as u8,
                    ((timeout >> 16) & 0xff) as u8,
                    state as u8,
                    self.i_string,
                ];
                let n = buf.len().min(6);
                buf[..n].copy_from_slice(&response[..n]);
                Ok(n)
            }
            // DFU_GETSTATE
            5 => {
                self.events.push(Event::StatePolled);
                if buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.state as u8;
                Ok(1)
            }
            _ => Err(TransportError::Stall),
        }
    }

    fn write_control(
        &mut self,
        request: u8,
        value: u16,
        _index: u16,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        self.check_alive()?;
        match request {
            // DFU_DETACH
            0 => {
                self.events.push(Event::Detach);
                if self.detach_stalls {
                    return Err(TransportError::Stall);
                }
                self.state = DfuState::AppDetach;
                Ok(0)
            }
            // DFU_DNLOAD
            1 => self.handle_dnload(value, data),
            // DFU_CLRSTATUS
            4 => {
                self.events.push(Event::ClrStatus);
                self.error_code = 0;
                self.state = DfuState::Idle;
                Ok(0)
            }
            // DFU_ABORT
            6 => {
                self.events.push(Event::Abort);
                self.state = DfuState::Idle;
                Ok(0)
            }
            _ => Err(TransportError::Stall),
        }
    }

    fn set_alt_setting(&mut self, _iface: u8, alt: u8) -> Result<(), TransportError> {
        self.check_alive()?;
        self.events.push(Event::SetAlt(alt));
        self.alt = alt;
        Ok(())
    }

    fn get_alt_setting(&mut self, _iface: u8) -> Result<u8, TransportError> {
        self.check_alive()?;
        Ok(self.alt)
    }

    fn string_descriptor(&mut self, index: u8) -> Result<String, TransportError> {
        self.check_alive()?;
        self.strings
            .get(&index)
            .cloned()
            .ok_or_else(|| TransportError::Io(format!("no string descriptor {index}")))
    }

    fn alt_string(&mut self, _iface: u8, alt: u8) -> Result<String, TransportError> {
        self.check_alive()?;
        self.alt_strings
            .get(alt as usize)
            .cloned()
            .ok_or_else(|| TransportError::Io(format!("no layout string for alt {alt}")))
    }

    fn bus_reset(&mut self) -> Result<(), TransportError> {
        self.check_alive()?;
        self.events.push(Event::BusReset);
        Ok(())
    }

    fn close(&mut self) {
        self.events.push(Event::Closed);
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
