//! USB access to the ULINK adapter.  The `Transport` trait is the seam
//! between the driver logic and the bus; `UsbDevice` is the rusb-backed
//! implementation talking to real hardware.

use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext};

use crate::error::{Error, Result};

/// USB vendor id of the ULINK, both in its unconfigured state and with the
/// OpenULINK firmware running.
pub const ULINK_VID: u16 = 0xc251;
/// USB product id of the ULINK.
pub const ULINK_PID: u16 = 0x2710;

/// The single interface the adapter exposes.
const USB_INTERFACE: u8 = 0;

/// Bulk command endpoint, OUT direction.
const EP_OUT: u8 = 0x02;
/// Bulk command endpoint, IN direction.
const EP_IN: u8 = 0x82;

/// Timeout for ordinary bulk transfers.
pub const USB_TIMEOUT: Duration = Duration::from_millis(5000);

/// Raw USB operations the driver needs.  Kept narrow so tests can script a
/// fake adapter.
pub trait Transport {
    /// Bulk write to the command endpoint, returning the bytes written.
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Bulk read from the command endpoint, returning the bytes read.
    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Vendor control write to the default endpoint.
    fn write_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Fetch a string descriptor, or `None` if the device has none at that
    /// index.
    fn string_descriptor(&mut self, index: u8) -> Option<String>;

    /// Re-open the device after it dropped off the bus and re-enumerated.
    fn reopen(&mut self) -> Result<()>;

    /// Release the device.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The ULINK on a real USB bus.
pub struct UsbDevice {
    handle: DeviceHandle<GlobalContext>,
}

fn open_handle() -> Result<DeviceHandle<GlobalContext>> {
    let mut handle =
        rusb::open_device_with_vid_pid(ULINK_VID, ULINK_PID).ok_or(Error::DeviceNotFound)?;
    handle.claim_interface(USB_INTERFACE)?;
    Ok(handle)
}

impl UsbDevice {
    /// Open the first ULINK on the bus and claim its interface.
    pub fn open() -> Result<Self> {
        Ok(Self {
            handle: open_handle()?,
        })
    }
}

impl Transport for UsbDevice {
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle.write_bulk(EP_OUT, data, timeout)?)
    }

    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle.read_bulk(EP_IN, buf, timeout)?)
    }

    fn write_control(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        Ok(self
            .handle
            .write_control(request_type, request, value, index, data, timeout)?)
    }

    fn string_descriptor(&mut self, index: u8) -> Option<String> {
        self.handle.read_string_descriptor_ascii(index).ok()
    }

    fn reopen(&mut self) -> Result<()> {
        // Dropping the old handle releases the claimed interface.
        self.handle = open_handle()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.handle.release_interface(USB_INTERFACE)?;
        Ok(())
    }
}
