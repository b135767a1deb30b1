/// Fixed-layout little-endian record readers and writers.
pub mod wire;

/// Firmware images as ordered, auto-merging, address-keyed segments.
pub mod memory;

/// Device-side block maps, permissions, and the DfuSe layout-string parser.
pub mod layout;

/// Line-oriented parser state shared by the text firmware formats.
pub mod records;

/// Decode Intel HEX images.
pub mod ihex;

/// Decode Motorola S-record images.
pub mod srec;

/// Load and validate firmware update files containing suffixes as defined by the DFU spec.
pub mod dfu_file;

/// The DFU functional descriptor and device identification.
pub mod descriptor;

/// The USB surface the engine drives, implemented per transport.
pub mod transport;

/// Perform firmware operations on a connected device: DFU class requests and the state machine.
pub mod protocol;

/// libusb-backed transport and DFU device discovery.
pub mod usb;
