//! OpenULINK firmware images and their download to the adapter's EZ-USB
//! microcontroller.
//!
//! The EZ-USB boots with a bare loader that accepts vendor control requests
//! writing directly into its 8 kB code RAM.  Download holds the CPU in reset
//! through the CPUCS register, streams the firmware sections in, releases the
//! CPU and lets the device re-enumerate with the new identity.

use std::fs;
use std::path::Path;
use std::time::Duration;

use ihex::Record;

use crate::error::{Error, Result};
use crate::usb::{Transport, USB_TIMEOUT};

/// EZ-USB CPU control and status register.
const CPUCS_REG: u16 = 0x7f92;
/// Vendor request writing to EZ-USB memory.
const REQUEST_FIRMWARE_LOAD: u8 = 0xa0;
/// CPUCS value holding the CPU in reset.
const CPU_RESET: u8 = 0x01;
/// CPUCS value releasing the CPU.
const CPU_START: u8 = 0x00;

/// Largest chunk a single firmware-load control transfer may carry.
const DOWNLOAD_CHUNK: usize = 64;

/// How long the device takes to drop off the bus and come back after the
/// firmware starts.
pub const RENUMERATION_DELAY: Duration = Duration::from_millis(1500);

/// A contiguous run of firmware bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct Section {
    pub base: u16,
    pub data: Vec<u8>,
}

/// A parsed firmware image.
#[derive(Debug)]
pub struct FirmwareImage {
    sections: Vec<Section>,
}

impl FirmwareImage {
    /// Read and parse an Intel HEX firmware file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(Error::FirmwareRead)?;
        Self::parse(&text)
    }

    /// Parse Intel HEX text.  Contiguous data records coalesce into one
    /// section; every address must fit the EZ-USB's 16-bit code space.
    pub fn parse(text: &str) -> Result<Self> {
        let mut sections: Vec<Section> = Vec::new();
        let mut base: u32 = 0;

        for record in ihex::Reader::new(text) {
            match record.map_err(|e| Error::FirmwareParse(e.to_string()))? {
                Record::Data { offset, value } => {
                    if value.is_empty() {
                        continue;
                    }
                    let address = base + offset as u32;
                    let end = address + value.len() as u32;
                    if end > u16::MAX as u32 + 1 {
                        return Err(Error::FirmwareParse(format!(
                            "data at {address:#x} falls outside the 16-bit code space"
                        )));
                    }
                    match sections.last_mut() {
                        Some(section)
                            if section.base as u32 + section.data.len() as u32 == address =>
                        {
                            section.data.extend_from_slice(&value);
                        }
                        _ => sections.push(Section {
                            base: address as u16,
                            data: value,
                        }),
                    }
                }
                Record::ExtendedSegmentAddress(segment) => base = (segment as u32) * 16,
                Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
                Record::EndOfFile => break,
                Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {}
            }
        }

        if sections.is_empty() {
            return Err(Error::FirmwareParse("image contains no data".into()));
        }
        Ok(Self { sections })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }
}

/// Write `value` to CPUCS, putting the CPU into or out of reset.
fn cpu_reset<T: Transport>(transport: &mut T, value: u8) -> Result<()> {
    let written = transport.write_control(
        REQUEST_FIRMWARE_LOAD,
        CPUCS_REG,
        0,
        &[value],
        USB_TIMEOUT,
    )?;
    if written != 1 {
        return Err(Error::FirmwareDownload("CPUCS write was truncated"));
    }
    Ok(())
}

/// Send one section in chunks the loader accepts.
fn write_section<T: Transport>(transport: &mut T, section: &Section) -> Result<()> {
    log::debug!(
        "firmware section at {:#06x}, {} bytes",
        section.base,
        section.data.len()
    );

    let mut address = section.base;
    for chunk in section.data.chunks(DOWNLOAD_CHUNK) {
        let written = transport.write_control(
            REQUEST_FIRMWARE_LOAD,
            address,
            0,
            chunk,
            USB_TIMEOUT,
        )?;
        if written != chunk.len() {
            return Err(Error::FirmwareDownload("section write was truncated"));
        }
        address = address.wrapping_add(chunk.len() as u16);
    }
    Ok(())
}

/// Download `image` into the adapter.  The caller must wait
/// [`RENUMERATION_DELAY`] and re-open the device afterwards.
pub fn download<T: Transport>(transport: &mut T, image: &FirmwareImage) -> Result<()> {
    cpu_reset(transport, CPU_RESET)?;
    for section in image.sections() {
        write_section(transport, section)?;
    }
    cpu_reset(transport, CPU_START)
}
