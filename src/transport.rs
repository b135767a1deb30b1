use thiserror::Error;

/// Failures a transport implementation can report. [TransportError::Stall]
/// and [TransportError::Io] are treated as possibly transient and retried
/// by the request layer; the others end the operation immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// The endpoint stalled the request or the transfer came up short.
    #[error("control transfer stalled")]
    Stall,

    #[error("USB I/O failed: {0}")]
    Io(String),

    #[error("device handle is closed")]
    Closed,

    #[error("bus reset is not available on this transport")]
    ResetUnsupported,
}

/// The USB surface the DFU engine drives. Implemented by the libusb-backed
/// transport and by the scripted transport the integration tests use; the
/// engine itself owns no USB code.
///
/// Control transfers are class-typed requests addressed to the DFU
/// interface; the implementation supplies the matching bmRequestType.
pub trait DfuTransport {
    /// IN control transfer. Returns the number of bytes the device sent.
    fn read_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize, TransportError>;

    /// OUT control transfer. Returns the number of bytes accepted.
    fn write_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<usize, TransportError>;

    fn set_alt_setting(&mut self, iface: u8, alt: u8) -> Result<(), TransportError>;

    /// Currently selected alternate setting. Implementations may answer
    /// from local state or fall back to a GET_INTERFACE request.
    fn get_alt_setting(&mut self, iface: u8) -> Result<u8, TransportError>;

    /// Fetch a string descriptor, with trailing NULs trimmed.
    fn string_descriptor(&mut self, index: u8) -> Result<String, TransportError>;

    /// The string descriptor attached to the given alternate setting; for
    /// DfuSe devices this carries the memory layout.
    fn alt_string(&mut self, iface: u8, alt: u8) -> Result<String, TransportError>;

    /// Reset the device's USB connection. Transports without that
    /// capability return [TransportError::ResetUnsupported].
    fn bus_reset(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}
