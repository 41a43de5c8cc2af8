//! Host-side driver for the Keil ULINK JTAG adapter running the OpenULINK
//! firmware.  The adapter is a Cypress EZ-USB with two bulk endpoints; the
//! driver speaks its compact command language, where every exchange is one
//! bulk OUT packet of at most 64 bytes and, when commands capture data, one
//! bulk IN packet of the same ceiling.
//!
//! The layers, bottom up: `statemachine` knows the TAP state graph and the
//! TMS sequences between its steady states.  `command` models single wire
//! commands and the queue that packs them into packets, watching the byte
//! ceiling in both directions at once.  `driver` translates abstract JTAG requests (scans, state
//! moves, run-test loops, resets, sleeps) into wire commands, splitting long
//! scans across several commands through the pause states, and routes
//! captured TDO bits back into the requests.  `usb` and `firmware` get the
//! device on the bus in the first place: if the adapter still runs its stock
//! firmware, init downloads OpenULINK over the vendor control endpoint and
//! waits for the device to re-enumerate.
//!
//! # Example
//! ```no_run
//! use std::path::Path;
//! use openulink::{Request, ScanChain, ScanRequest, Ulink};
//! use openulink::statemachine::TapState;
//!
//! let mut ulink = Ulink::open(Path::new("ulink_firmware.hex")).unwrap();
//! ulink.init().unwrap();
//!
//! let mut requests = [
//!     Request::TlrReset,
//!     Request::Scan(ScanRequest::read(ScanChain::Dr, 32, TapState::Idle)),
//! ];
//! ulink.execute_queue(&mut requests).unwrap();
//! ```

pub mod command;
pub mod driver;
pub mod error;
pub mod firmware;
pub mod request;
pub mod statemachine;
pub mod usb;

pub use driver::Ulink;
pub use error::{Error, Result};
pub use request::{Request, ScanChain, ScanRequest};
