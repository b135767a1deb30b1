use crate::descriptor::FunctionalDescriptor;
use crate::layout::{LayoutError, NamedLayout};
use crate::memory::{NamedMemory, RawMemory, Segment};
use crate::transport::{DfuTransport, TransportError};
use crate::wire;
use log::{debug, info, trace, warn};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;

/// Transient control-transfer failures are absorbed here: each request is
/// retried this many times with [RETRY_BACKOFF] between attempts.
const RETRY_LIMIT: u32 = 10;
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Extra settle time after a detach, covering OS re-enumeration and
/// driver mount on top of the device's own detach timeout.
const REENUMERATION_GRACE: Duration = Duration::from_millis(500);

/// DfuSe firmware blocks are numbered from 2; 0 carries commands.
const DFUSE_FIRST_BLOCK: u16 = 2;

/// Requests of the DFU interface class, taken from the USB DFU 1.1 spec.
#[repr(u8)]
enum DfuRequest {
    Detach = 0,
    Dnload = 1,
    Upload = 2,
    GetStatus = 3,
    ClrStatus = 4,
    GetState = 5,
    Abort = 6,
}

/// States a DFU device can be in, taken from the USB DFU 1.1 spec.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    Idle = 2,
    DnloadSync = 3,
    DnloadBusy = 4,
    DnloadIdle = 5,
    ManifestSync = 6,
    Manifest = 7,
    ManifestWaitReset = 8,
    UploadIdle = 9,
    Error = 10,
}

impl DfuState {
    /// True while the device still runs its application firmware.
    pub fn is_app_state(self) -> bool {
        (self as u8) < (DfuState::Idle as u8)
    }

    /// True in the states DFU_ABORT may be sent from.
    pub fn abortable(self) -> bool {
        matches!(
            self,
            DfuState::DnloadSync
                | DfuState::DnloadIdle
                | DfuState::ManifestSync
                | DfuState::UploadIdle
        )
    }

    fn ensure(self, expected: Self) -> Result<(), ProtocolError> {
        if self != expected {
            Err(ProtocolError::InvalidState {
                expected,
                actual: self,
            })
        } else {
            Ok(())
        }
    }
}

/// Status codes a DFU device can return. Codes past the end of the DFU
/// 1.1 table round-trip through [ErrorCode::Unknown].
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum ErrorCode {
    Ok = 0x00,
    ErrTarget = 0x01,
    ErrFile = 0x02,
    ErrWrite = 0x03,
    ErrErase = 0x04,
    ErrCheckErased = 0x05,
    ErrProg = 0x06,
    ErrVerify = 0x07,
    ErrAddress = 0x08,
    ErrNotDone = 0x09,
    ErrFirmware = 0x0a,
    ErrVendor = 0x0b,
    ErrUsbr = 0x0c,
    ErrPor = 0x0d,
    ErrUnknown = 0x0e,
    ErrStalledPkt = 0x0f,
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl ErrorCode {
    pub fn description(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            Ok => "No error condition is present.",
            ErrTarget => "File is not targeted for use by this device.",
            ErrFile => "File is for this device but fails some vendor-specific verification test.",
            ErrWrite => "Device is unable to write memory.",
            ErrErase => "Memory erase function failed.",
            ErrCheckErased => "Memory erase check failed.",
            ErrProg => "Program memory function failed.",
            ErrVerify => "Programmed memory failed verification.",
            ErrAddress => "Cannot program memory due to received address that is out of range.",
            ErrNotDone => {
                "Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet."
            }
            ErrFirmware => {
                "Device's firmware is corrupt. It cannot return to run-time (non-DFU) operations."
            }
            ErrVendor => "iString indicates a vendor-specific error.",
            ErrUsbr => "Device detected unexpected USB reset signaling.",
            ErrPor => "Device detected unexpected power on reset.",
            ErrUnknown => "Something went wrong, but the device does not know what it was.",
            ErrStalledPkt => "Device stalled an unexpected request.",
            Unknown(_) => "Device reported a status code that is not in the DFU spec.",
        }
    }
}

/// A decoded 6-byte DFU_GETSTATUS response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub error: ErrorCode,
    /// Minimum wait before the next GETSTATUS, dictated by the device.
    pub poll_timeout_ms: u32,
    pub state: DfuState,
    /// Descriptor index of a vendor-specific error string, or 0.
    pub i_string: u8,
}

impl Status {
    fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = wire::Reader::new(bytes);
        let error = ErrorCode::from(r.u8()?);
        let poll_timeout_ms = r.u24()?;
        let state =
            DfuState::try_from(r.u8()?).map_err(|e| ProtocolError::UnknownState(e.number))?;
        let i_string = r.u8()?;
        Ok(Self {
            error,
            poll_timeout_ms,
            state,
            i_string,
        })
    }

    fn ensure_state(&self, expected: DfuState) -> Result<(), ProtocolError> {
        self.state.ensure(expected)
    }
}

/// Commands DfuSe tunnels through DNLOAD with block number 0. Kept as a
/// dedicated type so a firmware block can never be mistaken for a
/// command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuseCommand {
    GetCommands,
    /// Anchor subsequent block numbers at this address.
    SetAddress(u32),
    /// Erase the block starting at this address.
    Erase(u32),
    ReadUnprotect,
}

impl DfuseCommand {
    fn encode(self) -> Vec<u8> {
        match self {
            DfuseCommand::GetCommands => vec![0x00],
            DfuseCommand::SetAddress(addr) => {
                let mut payload = vec![0x21];
                payload.extend_from_slice(&addr.to_le_bytes());
                payload
            }
            DfuseCommand::Erase(addr) => {
                let mut payload = vec![0x41];
                payload.extend_from_slice(&addr.to_le_bytes());
                payload
            }
            DfuseCommand::ReadUnprotect => vec![0x92],
        }
    }
}

/// Observer for engine events, delivered synchronously on the calling
/// thread.
pub trait DfuListener {
    /// Download progress against the current target's total byte count.
    fn progress(&mut self, percent: u8, transferred: u64) {
        let _ = (percent, transferred);
    }

    /// A GETSTATUS response revealed a device-reported error.
    fn device_error(&mut self, message: &str) {
        let _ = message;
    }
}

/// The no-op listener.
impl DfuListener for () {}

/// All errors (protocol and I/O) that can happen during a DFU operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("DFU protocol error")]
    Protocol(#[from] ProtocolError),

    #[error("USB transfer error while {action}")]
    Transfer {
        #[source]
        source: TransportError,
        action: &'static str,
    },

    #[error("USB transfers kept failing while {action}")]
    PersistentTransfer {
        #[source]
        source: TransportError,
        action: &'static str,
    },
}

impl Error {
    /// True for the I/O failures a disappearing device produces, which
    /// some phases are allowed to swallow.
    fn is_transfer(&self) -> bool {
        matches!(
            self,
            Error::Transfer { .. } | Error::PersistentTransfer { .. }
        )
    }
}

/// Failure modes that can happen even when all I/O succeeds.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("device reported state ({0}) that is not in the DFU spec")]
    UnknownState(u8),

    #[error("device reported an error: {code:?} ({message})")]
    DeviceError { code: ErrorCode, message: String },

    #[error("device entered unexpected state: expected {expected:?}, got {actual:?}")]
    InvalidState {
        expected: DfuState,
        actual: DfuState,
    },

    #[error("device cannot download firmware")]
    DownloadNotSupported,

    #[error("device cannot upload firmware")]
    UploadNotSupported,

    #[error("device advertises a zero transfer size")]
    ZeroTransferSize,

    #[error("image too large: overflowed the 16-bit block number")]
    BlockNumberOverflow,

    #[error(
        "image {image_start:#010x}..={image_end:#010x} lies outside the target layout {layout_start:#010x}..{layout_end:#010x}"
    )]
    OutOfRange {
        image_start: u64,
        image_end: u64,
        layout_start: u64,
        layout_end: u64,
    },

    #[error("target block at {0:#010x} is not writeable")]
    ReadOnlyTarget(u64),

    #[error("target block at {0:#010x} is not readable")]
    ReadProtectedTarget(u64),

    #[error("target block at {0:#010x} does not support erase")]
    EraseNotSupported(u64),

    #[error("firmware file requires DFU version {file:#06x}, device implements {device:#06x}")]
    VersionMismatch { file: u16, device: u16 },

    #[error("device DFU version {0:#06x} is not supported")]
    UnsupportedDfuVersion(u16),

    #[error("device response too short")]
    ResponseTooShort(#[from] wire::Truncated),

    #[error("bad memory layout string")]
    Layout(#[from] LayoutError),
}

/// A DFU device under the engine's control: the class-request layer plus
/// the state machine that sequences downloads, uploads, manifestation and
/// mode changes over an abstract transport.
pub struct DfuDevice<T: DfuTransport> {
    transport: T,
    iface: u8,
    descriptor: FunctionalDescriptor,
}

impl<T: DfuTransport> DfuDevice<T> {
    pub fn new(transport: T, iface: u8, descriptor: FunctionalDescriptor) -> Result<Self, Error> {
        match descriptor.bcd_dfu_version {
            crate::dfu_file::BCD_DFU_1_0
            | crate::dfu_file::BCD_DFU_1_1
            | crate::dfu_file::BCD_DFUSE_1_1A => {}
            other => return Err(ProtocolError::UnsupportedDfuVersion(other).into()),
        }
        if descriptor.transfer_size == 0 {
            return Err(ProtocolError::ZeroTransferSize.into());
        }
        Ok(Self {
            transport,
            iface,
            descriptor,
        })
    }

    pub fn descriptor(&self) -> &FunctionalDescriptor {
        &self.descriptor
    }

    pub fn is_dfuse(&self) -> bool {
        self.descriptor.bcd_dfu_version == crate::dfu_file::BCD_DFUSE_1_1A
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Give the transport back, e.g. to re-open after a reconfigure.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Reject a firmware file whose suffix declares a different DFU
    /// dialect than the device implements.
    pub fn verify_file_version(&self, file_bcd: u16) -> Result<(), Error> {
        if file_bcd != self.descriptor.bcd_dfu_version {
            return Err(ProtocolError::VersionMismatch {
                file: file_bcd,
                device: self.descriptor.bcd_dfu_version,
            }
            .into());
        }
        Ok(())
    }

    // ----- request layer -----------------------------------------------

    /// Run one control transfer with the retry policy: transient failures
    /// are retried up to [RETRY_LIMIT] times, then escalated.
    fn retried<R>(
        &mut self,
        action: &'static str,
        mut op: impl FnMut(&mut T) -> Result<R, TransportError>,
    ) -> Result<R, Error> {
        let mut failures = 0;
        loop {
            match op(&mut self.transport) {
                Ok(v) => return Ok(v),
                Err(source @ (TransportError::Closed | TransportError::ResetUnsupported)) => {
                    return Err(Error::Transfer { source, action });
                }
                Err(source) => {
                    failures += 1;
                    if failures >= RETRY_LIMIT {
                        return Err(Error::PersistentTransfer { source, action });
                    }
                    trace!("Retrying control transfer while {action} ({failures}/{RETRY_LIMIT})");
                    sleep(RETRY_BACKOFF);
                }
            }
        }
    }

    fn detach(&mut self, timeout_ms: u16) -> Result<(), Error> {
        let iface = self.iface as u16;
        self.retried("requesting detach", |t| {
            t.write_control(DfuRequest::Detach as u8, timeout_ms, iface, &[])
                .map(drop)
        })
    }

    fn dnload(&mut self, block: u16, data: &[u8]) -> Result<(), Error> {
        let iface = self.iface as u16;
        self.retried("sending download block", |t| {
            t.write_control(DfuRequest::Dnload as u8, block, iface, data)
                .map(drop)
        })
    }

    fn upload_chunk(&mut self, block: u16, buf: &mut [u8]) -> Result<usize, Error> {
        let iface = self.iface as u16;
        self.retried("reading upload block", |t| {
            t.read_control(DfuRequest::Upload as u8, block, iface, buf)
        })
    }

    fn get_status(&mut self) -> Result<Status, Error> {
        let iface = self.iface as u16;
        let mut buf = [0u8; 6];
        let len = self.retried("querying status", |t| {
            t.read_control(DfuRequest::GetStatus as u8, 0, iface, &mut buf)
        })?;
        let status = Status::parse(&buf[..len])?;
        trace!("Device status: {status:?}");
        Ok(status)
    }

    fn clr_status(&mut self) -> Result<(), Error> {
        let iface = self.iface as u16;
        self.retried("clearing status", |t| {
            t.write_control(DfuRequest::ClrStatus as u8, 0, iface, &[])
                .map(drop)
        })
    }

    fn get_state(&mut self) -> Result<DfuState, Error> {
        let iface = self.iface as u16;
        let mut buf = [0u8; 1];
        let len = self.retried("querying state", |t| {
            t.read_control(DfuRequest::GetState as u8, 0, iface, &mut buf)
        })?;
        if len < 1 {
            return Err(ProtocolError::ResponseTooShort(wire::Truncated {
                needed: 1,
                have: 0,
            })
            .into());
        }
        DfuState::try_from(buf[0])
            .map_err(|e| ProtocolError::UnknownState(e.number).into())
    }

    fn abort(&mut self) -> Result<(), Error> {
        let iface = self.iface as u16;
        self.retried("sending abort", |t| {
            t.write_control(DfuRequest::Abort as u8, 0, iface, &[])
                .map(drop)
        })
    }

    // ----- shared state-machine pieces ---------------------------------

    /// Resolve the human-readable text for a device-reported error.
    /// Vendor-specific errors point at a string descriptor; everything
    /// else uses the DFU 1.1 wording.
    fn device_error_message(&mut self, status: &Status) -> String {
        if status.error == ErrorCode::ErrVendor && status.i_string != 0 {
            let index = status.i_string;
            if let Ok(text) = self.retried("reading error description", |t| {
                t.string_descriptor(index)
            }) {
                return text;
            }
        }
        status.error.description().to_owned()
    }

    /// Fan a device-reported error out to the listener, clear it on the
    /// device, and convert it into the raised error.
    fn report_device_error<L: DfuListener>(&mut self, listener: &mut L, status: &Status) -> Error {
        let message = self.device_error_message(status);
        warn!("Device reported error {:?}: {message}", status.error);
        listener.device_error(&message);
        if let Err(e) = self.clr_status() {
            debug!("Failed to clear device error status: {e}");
        }
        ProtocolError::DeviceError {
            code: status.error,
            message,
        }
        .into()
    }

    /// Poll GETSTATUS until the device leaves the given busy states,
    /// sleeping the device-dictated poll timeout between polls.
    fn await_status<L: DfuListener>(
        &mut self,
        listener: &mut L,
        busy: &[DfuState],
    ) -> Result<Status, Error> {
        loop {
            let status = self.get_status()?;
            if busy.contains(&status.state) {
                trace!(
                    "Device busy in {:?}; waiting {} ms as requested",
                    status.state, status.poll_timeout_ms
                );
                sleep(Duration::from_millis(status.poll_timeout_ms as u64));
                continue;
            }
            if status.state == DfuState::Error {
                return Err(self.report_device_error(listener, &status));
            }
            return Ok(status);
        }
    }

    /// The wait that follows every download block and every DfuSe
    /// command: poll through DnloadBusy and require DnloadIdle.
    fn await_download_idle<L: DfuListener>(&mut self, listener: &mut L) -> Result<(), Error> {
        let status = self.await_status(listener, &[DfuState::DnloadBusy, DfuState::DnloadSync])?;
        status.ensure_state(DfuState::DnloadIdle).map_err(Into::into)
    }

    /// Best-effort DFU_ABORT on a failure path, leaving the device
    /// recoverable if it still answers.
    fn abort_if_possible(&mut self) {
        if !self.transport.is_open() {
            return;
        }
        if let Ok(status) = self.get_status() {
            if status.state.abortable() {
                debug!("Aborting interrupted transfer from state {:?}", status.state);
                let _ = self.abort();
            }
        }
    }

    fn issue_dfuse_command<L: DfuListener>(
        &mut self,
        command: DfuseCommand,
        listener: &mut L,
    ) -> Result<(), Error> {
        trace!("Issuing DfuSe command {command:?}");
        self.dnload(0, &command.encode())?;
        self.await_download_idle(listener)
    }

    /// Select the interface alt-setting, skipping the request entirely if
    /// it is already active.
    fn select_alt_setting(&mut self, alt: u8) -> Result<(), Error> {
        let iface = self.iface;
        let current = self.retried("querying alternate setting", |t| t.get_alt_setting(iface))?;
        if current == alt {
            trace!("Alternate setting {alt} already selected");
            return Ok(());
        }
        debug!("Selecting alternate setting {alt}");
        self.retried("selecting alternate setting", |t| {
            t.set_alt_setting(iface, alt)
        })
    }

    /// Fetch and parse the memory layout advertised by an alt-setting's
    /// string descriptor. Re-read on every selection; the map is
    /// device-owned metadata.
    fn target_layout(&mut self, alt: u8) -> Result<NamedLayout, Error> {
        let iface = self.iface;
        let raw = self.retried("reading memory layout string", |t| t.alt_string(iface, alt))?;
        let parsed: NamedLayout = raw.parse().map_err(ProtocolError::Layout)?;
        debug!(
            "Target {:?}: {} blocks at {:#010x}, {} bytes",
            parsed.name,
            parsed.layout.blocks().len(),
            parsed.layout.start_address().unwrap_or(0),
            parsed.layout.size()
        );
        Ok(parsed)
    }

    // ----- operations --------------------------------------------------

    /// Drive an application-mode device into its DFU mode: DFU_DETACH
    /// plus either the device's own detach-attach cycle or a host-side
    /// bus reset. The handle is closed either way; the caller re-opens
    /// the re-enumerated device.
    pub fn reconfigure(&mut self) -> Result<(), Error> {
        let state = self.get_state()?;
        if !state.is_app_state() {
            return Err(ProtocolError::InvalidState {
                expected: DfuState::AppIdle,
                actual: state,
            }
            .into());
        }

        if state == DfuState::AppIdle {
            let timeout = self.descriptor.detach_timeout_ms;
            info!("Requesting detach with timeout {timeout} ms");
            match self.detach(timeout) {
                // A self-detaching device may drop off the bus before the
                // transfer completes; the stall carries no information.
                Err(e) if self.descriptor.will_detach && e.is_transfer() => {
                    debug!("Ignoring detach error from a self-detaching device: {e}");
                }
                other => other?,
            }
        }

        if !self.descriptor.will_detach {
            // The device waits for us; reset errors mean it left already.
            if let Err(e) = self.transport.bus_reset() {
                debug!("Ignoring bus reset error during reconfigure: {e}");
            }
        }
        self.transport.close();

        let settle =
            Duration::from_millis(self.descriptor.detach_timeout_ms as u64) + REENUMERATION_GRACE;
        info!("Waiting {settle:?} for the device to re-enumerate");
        sleep(settle);
        Ok(())
    }

    /// Bring the device to dfuIDLE from wherever it is: clear a reported
    /// error (notifying the listener), abort a stale transfer, and verify
    /// the result.
    pub fn reset_to_idle<L: DfuListener>(&mut self, listener: &mut L) -> Result<(), Error> {
        let mut status = self.get_status()?;

        if status.state == DfuState::Error {
            let message = self.device_error_message(&status);
            info!(
                "Device in error state ({:?}: {message}); sending DFU_CLRSTATUS",
                status.error
            );
            listener.device_error(&message);
            self.clr_status()?;
            status = self.get_status()?;
        }

        if status.state.abortable() {
            info!("Device not idle, state = {:?}; sending DFU_ABORT", status.state);
            self.abort()?;
            status = self.get_status()?;
        }

        status.ensure_state(DfuState::Idle).map_err(Into::into)
    }

    /// Plain DFU 1.1 download of one contiguous image. The device decides
    /// where the bytes land; the wire carries no addresses.
    pub fn download<L: DfuListener>(&mut self, bytes: &[u8], listener: &mut L) -> Result<(), Error> {
        if !self.descriptor.can_download {
            return Err(ProtocolError::DownloadNotSupported.into());
        }
        self.reset_to_idle(listener)?;

        info!("Downloading {} bytes", bytes.len());
        let result = self.download_blocks(bytes, listener);
        if let Err(e) = result {
            self.abort_if_possible();
            return Err(e);
        }
        Ok(())
    }

    fn download_blocks<L: DfuListener>(
        &mut self,
        bytes: &[u8],
        listener: &mut L,
    ) -> Result<(), Error> {
        let chunk_size = self.descriptor.transfer_size as usize;
        let total = bytes.len() as u64;
        let mut block: u16 = 0;
        let mut transferred = 0usize;

        while transferred < bytes.len() {
            let chunk = chunk_size.min(bytes.len() - transferred);
            self.dnload(block, &bytes[transferred..transferred + chunk])?;
            self.await_download_idle(listener)?;

            transferred += chunk;
            trace!("Downloaded block {block:#06x} ({chunk} bytes)");
            block = block
                .checked_add(1)
                .ok_or(ProtocolError::BlockNumberOverflow)?;
            emit_progress(listener, transferred as u64, total);
        }
        Ok(())
    }

    /// DfuSe download: per-target alt-setting selection, layout and
    /// permission checks, erase, and address-anchored block transfer.
    /// Targets are flashed in the order the file declares them.
    pub fn download_dfuse<L: DfuListener>(
        &mut self,
        images: &[(u8, NamedMemory)],
        listener: &mut L,
    ) -> Result<(), Error> {
        if !self.descriptor.can_download {
            return Err(ProtocolError::DownloadNotSupported.into());
        }
        for (alt, image) in images {
            let result = self.download_dfuse_target(*alt, image, listener);
            if let Err(e) = result {
                self.abort_if_possible();
                return Err(e);
            }
        }
        Ok(())
    }

    fn download_dfuse_target<L: DfuListener>(
        &mut self,
        alt: u8,
        image: &NamedMemory,
        listener: &mut L,
    ) -> Result<(), Error> {
        let Some((image_start, image_end)) = image.memory.span() else {
            warn!("Target {:?} carries no data; skipping", image.name);
            return Ok(());
        };

        self.select_alt_setting(alt)?;
        let target = self.target_layout(alt)?;
        info!(
            "Flashing {} bytes to target {:?} (alt {alt})",
            image.memory.byte_len(),
            if image.name.is_empty() { &target.name } else { &image.name },
        );

        let out_of_range = || ProtocolError::OutOfRange {
            image_start,
            image_end,
            layout_start: target.layout.start_address().unwrap_or(0),
            layout_end: target.layout.end_address().unwrap_or(0),
        };
        let covered = target
            .layout
            .blocks_covering(image_start, image_end)
            .ok_or_else(out_of_range)?
            .to_vec();

        self.reset_to_idle(listener)?;

        for block in &covered {
            if !block.permissions.writeable() {
                return Err(ProtocolError::ReadOnlyTarget(block.start).into());
            }
        }
        for block in &covered {
            if block.permissions.eraseable() {
                debug!("Erasing block at {:#010x}", block.start);
                let addr = u32::try_from(block.start).map_err(|_| out_of_range())?;
                self.issue_dfuse_command(DfuseCommand::Erase(addr), listener)?;
            }
        }

        let total = image.memory.byte_len();
        let mut transferred: u64 = 0;
        let chunk_size = self.descriptor.transfer_size as usize;

        for seg in image.memory.segments() {
            let anchor = u32::try_from(seg.start()).map_err(|_| out_of_range())?;
            self.issue_dfuse_command(DfuseCommand::SetAddress(anchor), listener)?;

            let data = seg.data();
            let mut block = DFUSE_FIRST_BLOCK;
            let mut offset = 0usize;
            while offset < data.len() {
                let chunk = chunk_size.min(data.len() - offset);
                self.dnload(block, &data[offset..offset + chunk])?;
                self.await_download_idle(listener)?;

                offset += chunk;
                transferred += chunk as u64;
                emit_progress(listener, transferred, total);

                block = block.wrapping_add(1);
                if block == 0 && offset < data.len() {
                    // 0xFFFF blocks sent since the last anchor; re-anchor
                    // so block numbering can restart.
                    let anchor = seg.start() + offset as u64;
                    debug!("Block number wrapped; re-anchoring at {anchor:#010x}");
                    let anchor = u32::try_from(anchor).map_err(|_| out_of_range())?;
                    self.issue_dfuse_command(DfuseCommand::SetAddress(anchor), listener)?;
                    block = DFUSE_FIRST_BLOCK;
                }
            }
        }
        Ok(())
    }

    /// End the transfer phase and see the device through manifestation.
    /// Closes the handle; the device is re-enumerating afterwards.
    pub fn manifest(&mut self) -> Result<(), Error> {
        // A device that neither tolerates manifestation nor waits for our
        // reset tears its USB stack down by itself; I/O errors from it
        // carry no information.
        let tolerate_errors = !self.descriptor.manifestation_tolerant && self.descriptor.will_detach;

        match self.manifest_inner() {
            Err(e) if tolerate_errors && e.is_transfer() => {
                info!("Ignoring transfer error from a detaching device during manifestation: {e}");
            }
            other => other?,
        }
        self.transport.close();
        Ok(())
    }

    fn manifest_inner(&mut self) -> Result<(), Error> {
        info!("Requesting manifestation");
        self.dnload(0, &[])?;

        let status = loop {
            let status = self.get_status()?;
            if matches!(status.state, DfuState::Manifest | DfuState::ManifestSync) {
                trace!(
                    "Device manifesting; waiting {} ms as requested",
                    status.poll_timeout_ms
                );
                sleep(Duration::from_millis(status.poll_timeout_ms as u64));
                continue;
            }
            break status;
        };

        if self.descriptor.manifestation_tolerant {
            status.ensure_state(DfuState::Idle)?;
            // Still in DFU mode; a reset brings the runtime firmware up.
            self.retried("resetting device", |t| t.bus_reset())?;
        } else {
            status.ensure_state(DfuState::ManifestWaitReset)?;
            if !self.descriptor.will_detach {
                self.retried("resetting device", |t| t.bus_reset())?;
            }
        }
        Ok(())
    }

    /// Plain DFU 1.1 upload: read the whole image back, block 0 onwards,
    /// until the device sends a short frame.
    pub fn upload<L: DfuListener>(&mut self, listener: &mut L) -> Result<Vec<u8>, Error> {
        if !self.descriptor.can_upload {
            return Err(ProtocolError::UploadNotSupported.into());
        }
        self.reset_to_idle(listener)?;
        self.upload_blocks(0, None)
    }

    /// DfuSe upload of one target: anchor at the layout base, then read
    /// blocks from 2 up to the layout size. Every block of the target
    /// must be readable.
    pub fn upload_dfuse<L: DfuListener>(
        &mut self,
        alt: u8,
        listener: &mut L,
    ) -> Result<NamedMemory, Error> {
        if !self.descriptor.can_upload {
            return Err(ProtocolError::UploadNotSupported.into());
        }

        self.select_alt_setting(alt)?;
        let target = self.target_layout(alt)?;
        for block in target.layout.blocks() {
            if !block.permissions.readable() {
                return Err(ProtocolError::ReadProtectedTarget(block.start).into());
            }
        }

        let start = target.layout.start_address().ok_or(ProtocolError::Layout(
            LayoutError::Malformed("no blocks declared"),
        ))?;
        let limit = target.layout.size();

        self.reset_to_idle(listener)?;
        let anchor = u32::try_from(start).map_err(|_| {
            ProtocolError::Layout(LayoutError::Malformed("layout exceeds 32-bit addressing"))
        })?;
        self.issue_dfuse_command(DfuseCommand::SetAddress(anchor), listener)?;
        // SetAddress leaves the device in dfuDNLOAD-IDLE; abort back to
        // idle before switching direction.
        self.abort()?;
        self.get_status()?.ensure_state(DfuState::Idle)?;

        info!("Uploading up to {limit} bytes from target {:?}", target.name);
        let data = self.upload_blocks(DFUSE_FIRST_BLOCK, Some(limit))?;

        let mut memory = RawMemory::new();
        if !data.is_empty() {
            // The image is one contiguous run at the layout base; overlap
            // is impossible in a fresh RawMemory.
            let added = memory.try_add(Segment::new(start, data));
            debug_assert!(added);
        }
        Ok(NamedMemory {
            name: target.name,
            memory,
        })
    }

    fn upload_blocks(&mut self, first_block: u16, limit: Option<u64>) -> Result<Vec<u8>, Error> {
        let chunk_size = self.descriptor.transfer_size as usize;
        let mut image = Vec::new();
        let mut block = first_block;

        loop {
            let mut buf = vec![0u8; chunk_size];
            let len = self.upload_chunk(block, &mut buf)?;
            image.extend_from_slice(&buf[..len]);
            trace!("Uploaded block {block:#06x} ({len} bytes)");

            if len < chunk_size {
                break;
            }
            block = block
                .checked_add(1)
                .ok_or(ProtocolError::BlockNumberOverflow)?;

            if limit.is_some_and(|l| image.len() as u64 >= l) {
                // The last read was full-sized, so the session is still
                // open; a zero-length UPLOAD closes it.
                self.upload_chunk(block, &mut [])?;
                break;
            }
        }
        Ok(image)
    }
}

fn emit_progress<L: DfuListener>(listener: &mut L, transferred: u64, total: u64) {
    let percent = if total == 0 {
        100
    } else {
        (transferred * 100 / total) as u8
    };
    listener.progress(percent, transferred);
}
