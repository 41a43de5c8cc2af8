//! The JTAG operations the driver accepts.  A higher-level JTAG engine builds
//! a list of these and hands it to [`Ulink::execute_queue`]; captured scan
//! data comes back in the requests themselves.
//!
//! [`Ulink::execute_queue`]: crate::driver::Ulink::execute_queue

use crate::statemachine::TapState;

/// Which register a scan shifts through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanChain {
    Ir,
    Dr,
}

/// Transfer direction of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    In,
    Out,
    Io,
}

/// What a scan shifts out, and whether it captures what shifts in.
#[derive(Debug)]
pub enum ScanData {
    /// Capture TDO only; TDI is left to the adapter.
    Read,
    /// Shift the given TDI bytes, discard TDO.
    Write(Vec<u8>),
    /// Shift the given TDI bytes and capture TDO.
    Transfer(Vec<u8>),
}

/// Shift `bits` bits through the instruction or data register, then park the
/// TAP in `end_state`.  TDI and TDO bytes are LSB first; the last byte holds
/// `((bits - 1) % 8) + 1` significant bits.
#[derive(Debug)]
pub struct ScanRequest {
    pub chain: ScanChain,
    pub bits: usize,
    pub data: ScanData,
    pub end_state: TapState,
    /// Captured TDO bytes, `ceil(bits / 8)` of them, filled in by the driver
    /// for `Read` and `Transfer` scans.
    pub tdo: Option<Vec<u8>>,
}

impl ScanRequest {
    pub fn read(chain: ScanChain, bits: usize, end_state: TapState) -> Self {
        Self {
            chain,
            bits,
            data: ScanData::Read,
            end_state,
            tdo: None,
        }
    }

    pub fn write(chain: ScanChain, bits: usize, tdi: Vec<u8>, end_state: TapState) -> Self {
        Self {
            chain,
            bits,
            data: ScanData::Write(tdi),
            end_state,
            tdo: None,
        }
    }

    pub fn transfer(chain: ScanChain, bits: usize, tdi: Vec<u8>, end_state: TapState) -> Self {
        Self {
            chain,
            bits,
            data: ScanData::Transfer(tdi),
            end_state,
            tdo: None,
        }
    }

    pub fn scan_type(&self) -> ScanType {
        match self.data {
            ScanData::Read => ScanType::In,
            ScanData::Write(_) => ScanType::Out,
            ScanData::Transfer(_) => ScanType::Io,
        }
    }

    /// Whether this scan captures TDO.
    pub fn captures(&self) -> bool {
        matches!(self.data, ScanData::Read | ScanData::Transfer(_))
    }

    pub fn tdi(&self) -> Option<&[u8]> {
        match &self.data {
            ScanData::Read => None,
            ScanData::Write(tdi) | ScanData::Transfer(tdi) => Some(tdi),
        }
    }
}

/// One abstract JTAG operation.
#[derive(Debug)]
pub enum Request {
    Scan(ScanRequest),
    /// Drive the TAP into Test-Logic-Reset with five TMS-high clocks.
    TlrReset,
    /// Clock TCK `cycles` times in Run-Test/Idle, then move to `end_state`.
    Runtest { cycles: u16, end_state: TapState },
    /// Assert or deassert the TRST and SRST lines.
    Reset { trst: bool, srst: bool },
    /// Pause command execution on the adapter.  The wait happens on the
    /// adapter because queued commands run long after the host queues them.
    Sleep { us: u32 },
    /// Walk the TAP through the given sequence of adjacent states.
    Pathmove { states: Vec<TapState> },
}
