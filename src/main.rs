use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use dfu_flash::dfu_file::{self, FirmwareFile};
use dfu_flash::memory::{NamedMemory, RawMemory};
use dfu_flash::protocol::{DfuDevice, DfuListener};
use dfu_flash::usb::{self, DfuCandidate, UsbTransport};
use dfu_flash::wire::split_bcd;
use dfu_flash::{ihex, srec};
use log::{info, warn};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Flash or read firmware on a USB DFU / DfuSe device.
#[derive(Parser, Debug)]
#[command(name = "dfu-flash", version)]
struct Opt {
    /// Firmware image to download (.dfu, .hex, .s19/.srec)
    #[arg(short = 'i', long = "image", value_name = "FILE")]
    image: Option<PathBuf>,

    /// Device to operate on, as hexadecimal vid:pid
    #[arg(short = 'd', long = "device", value_name = "VID:PID")]
    device: Option<UsbId>,

    /// Firmware version a raw image carries, as major.minor (enables
    /// skipping downloads the device already has)
    #[arg(short = 'v', long = "fw-version", value_name = "MAJOR.MINOR", value_parser = parse_version)]
    version: Option<(u8, u8)>,

    /// List DFU-capable devices and exit
    #[arg(short = 'l', long)]
    list: bool,

    /// Read the device's firmware into FILE instead of flashing
    #[arg(short = 'u', long, value_name = "FILE", conflicts_with = "image")]
    upload: Option<PathBuf>,
}

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq)]
struct UsbId {
    vid: u16,
    pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

impl FromStr for UsbId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (vid, pid) = s
            .split_once(':')
            .context("expected hexadecimal vid:pid, e.g. 0483:df11")?;
        Ok(UsbId {
            vid: u16::from_str_radix(vid, 16).context("vendor ID is not hexadecimal")?,
            pid: u16::from_str_radix(pid, 16).context("product ID is not hexadecimal")?,
        })
    }
}

fn parse_version(s: &str) -> Result<(u8, u8)> {
    let (major, minor) = s
        .split_once('.')
        .context("expected a version of the form major.minor")?;
    Ok((
        major.parse().context("major version is not a number")?,
        minor.parse().context("minor version is not a number")?,
    ))
}

/// Decoded `-i` file contents.
enum Payload {
    /// Suffixed DFU file; identity and dialect come from the suffix.
    Dfu(FirmwareFile),
    /// Bare memory image from a text format; identity comes from flags.
    Memory(RawMemory),
}

/// Prints transfer progress and device-reported errors as they arrive.
#[derive(Default)]
struct ConsoleListener {
    last_decile: u64,
}

impl DfuListener for ConsoleListener {
    fn progress(&mut self, percent: u8, transferred: u64) {
        let decile = percent as u64 / 10;
        if decile != self.last_decile {
            self.last_decile = decile;
            info!("Transferred {percent}% ({transferred} bytes)");
        }
    }

    fn device_error(&mut self, message: &str) {
        log::error!("Device reported: {message}");
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("DFU_FLASH_LOG", "info")
            .write_style("DFU_FLASH_LOG_STYLE"),
    )
    .init();

    let opt = Opt::parse();

    if opt.list {
        return list();
    }
    if let Some(path) = opt.upload {
        let id = opt.device.context("no device specified; use -d <vid>:<pid>")?;
        return upload(id, &path);
    }

    let Some(ref path) = opt.image else {
        bail!("nothing to do; use -i <file>, --upload <file> or --list");
    };
    let payload = load_image(path)?;

    let target = resolve_target(opt.device, &payload)?;
    let file_version = match &payload {
        Payload::Dfu(file) => {
            if opt.version.is_some() {
                warn!("-v ignored; the DFU suffix is authoritative");
            }
            file.suffix.product_version.0.map(split_bcd)
        }
        Payload::Memory(_) => opt.version,
    };

    let Some(mut dfu) = open_in_dfu_mode(target, file_version)? else {
        println!("Device firmware is already up to date; nothing to do.");
        return Ok(());
    };
    let mut listener = ConsoleListener::default();

    match payload {
        Payload::Dfu(file) => {
            dfu.verify_file_version(file.suffix.dfu_version)?;
            if file.suffix.is_dfuse() {
                dfu.download_dfuse(&file.images, &mut listener)?;
            } else {
                let bytes = contiguous_bytes(&file.images[0].1.memory)?;
                dfu.download(&bytes, &mut listener)?;
            }
        }
        Payload::Memory(memory) => {
            if dfu.is_dfuse() {
                let images = vec![(
                    0u8,
                    NamedMemory {
                        name: String::new(),
                        memory,
                    },
                )];
                dfu.download_dfuse(&images, &mut listener)?;
            } else {
                let bytes = contiguous_bytes(&memory)?;
                dfu.download(&bytes, &mut listener)?;
            }
        }
    }

    dfu.manifest()?;
    println!("Firmware update complete.");
    Ok(())
}

fn list() -> Result<()> {
    for candidate in usb::discover()? {
        println!(
            "{} [{}]",
            candidate.identification,
            if candidate.runtime {
                "runtime, detach required"
            } else {
                "in DFU mode"
            }
        );
    }
    Ok(())
}

fn upload(id: UsbId, path: &Path) -> Result<()> {
    let mut dfu = open_in_dfu_mode(id, None)?.expect("no skip without a file version");
    let mut listener = ConsoleListener::default();

    let bytes = if dfu.is_dfuse() {
        let image = dfu.upload_dfuse(0, &mut listener)?;
        image
            .memory
            .segments()
            .iter()
            .flat_map(|s| s.data())
            .copied()
            .collect()
    } else {
        dfu.upload(&mut listener)?
    };

    std::fs::write(path, &bytes)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Read {} bytes into {}", bytes.len(), path.display());
    Ok(())
}

fn load_image(path: &Path) -> Result<Payload> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("dfu") => Ok(Payload::Dfu(dfu_file::parse(&raw)?)),
        Some("hex" | "ihex") => {
            let text = std::str::from_utf8(&raw).context("HEX file is not ASCII")?;
            Ok(Payload::Memory(ihex::parse(text)?))
        }
        Some("s19" | "s28" | "s37" | "srec" | "mot") => {
            let text = std::str::from_utf8(&raw).context("S-record file is not ASCII")?;
            Ok(Payload::Memory(srec::parse(text)?))
        }
        _ => bail!(
            "unrecognized image format {}; expected .dfu, .hex or an S-record extension",
            path.display()
        ),
    }
}

/// Work out which USB IDs to look for. For DFU files the suffix is
/// authoritative; flags only fill in wildcarded fields.
fn resolve_target(flag: Option<UsbId>, payload: &Payload) -> Result<UsbId> {
    let (suffix_vid, suffix_pid) = match payload {
        Payload::Dfu(file) => (file.suffix.vendor_id.0, file.suffix.product_id.0),
        Payload::Memory(_) => (None, None),
    };

    if let (Some(vid), Some(pid)) = (suffix_vid, suffix_pid) {
        if flag.is_some_and(|f| f.vid != vid || f.pid != pid) {
            warn!("-d ignored; the DFU suffix names {vid:04x}:{pid:04x}");
        }
        return Ok(UsbId { vid, pid });
    }

    let vid = suffix_vid
        .or(flag.map(|f| f.vid))
        .context("no device specified; use -d <vid>:<pid>")?;
    // An unknown product ID never matches exactly, which sends device
    // selection down its vendor-only fallback.
    let pid = suffix_pid.or(flag.map(|f| f.pid)).unwrap_or(0xffff);
    Ok(UsbId { vid, pid })
}

/// Select and open the target. A device still running its application is
/// detached and re-opened once it re-enumerates in DFU mode. Returns
/// [None] when the file version shows the device is already current.
fn open_in_dfu_mode(
    id: UsbId,
    file_version: Option<(u8, u8)>,
) -> Result<Option<DfuDevice<UsbTransport>>> {
    let candidate = usb::select(id.vid, id.pid)?;
    info!("Found device {}", candidate.identification);

    if candidate.runtime {
        let device_version = candidate.identification.product_version;
        if file_version.is_some_and(|fv| fv <= device_version) {
            info!(
                "Device firmware v{}.{:02x} is not older than the image; skipping",
                device_version.0, device_version.1
            );
            return Ok(None);
        }
        let mut dfu = into_engine(candidate)?;
        info!("Device is in runtime mode; switching to DFU mode");
        dfu.reconfigure()?;

        let candidate = usb::select(id.vid, id.pid)
            .context("device did not come back after detach")?;
        info!("Re-opened {} in DFU mode", candidate.identification);
        return into_engine(candidate).map(Some);
    }

    into_engine(candidate).map(Some)
}

fn into_engine(candidate: DfuCandidate) -> Result<DfuDevice<UsbTransport>> {
    let iface = candidate.iface;
    let functional = candidate.functional;
    let transport = candidate.open()?;
    Ok(DfuDevice::new(transport, iface, functional)?)
}

fn contiguous_bytes(memory: &RawMemory) -> Result<Vec<u8>> {
    let segments = memory.segments();
    ensure!(!segments.is_empty(), "image carries no data");
    ensure!(
        segments.len() == 1,
        "image has {} disjoint segments; a plain DFU device needs one contiguous image",
        segments.len()
    );
    Ok(segments[0].data().to_vec())
}
