//! The JTAG TAP state machine.  This keeps track of the state the target's TAP
//! is in and knows the TMS bit sequence that moves it from any steady state to
//! any other.  The driver consults it to prefix and suffix every scan with the
//! right TMS transitions, so the upper layers never deal with raw TMS bits.

use std::fmt;

use crate::error::{Error, Result};

/// The sixteen states of the JTAG TAP state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    Reset,
    Idle,
    SelectDr,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIr,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

impl TapState {
    /// Follow one clock edge with the given TMS level.
    pub fn step(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (Reset, false) => Idle,
            (Reset, true) => Reset,
            (Idle, false) => Idle,
            (Idle, true) => SelectDr,
            (SelectDr, false) => CaptureDr,
            (SelectDr, true) => SelectIr,
            (CaptureDr, false) => ShiftDr,
            (CaptureDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (Exit1Dr, false) => PauseDr,
            (Exit1Dr, true) => UpdateDr,
            (PauseDr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (Exit2Dr, false) => ShiftDr,
            (Exit2Dr, true) => UpdateDr,
            (UpdateDr, false) => Idle,
            (UpdateDr, true) => SelectDr,
            (SelectIr, false) => CaptureIr,
            (SelectIr, true) => Reset,
            (CaptureIr, false) => ShiftIr,
            (CaptureIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (Exit1Ir, false) => PauseIr,
            (Exit1Ir, true) => UpdateIr,
            (PauseIr, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (Exit2Ir, false) => ShiftIr,
            (Exit2Ir, true) => UpdateIr,
            (UpdateIr, false) => Idle,
            (UpdateIr, true) => SelectDr,
        }
    }

    /// A stable state is one a caller may ask the driver to park the TAP in.
    pub fn is_stable(self) -> bool {
        use TapState::*;
        matches!(self, Reset | Idle | PauseDr | PauseIr)
    }

    /// Index into the TMS path table, or `None` for transient states that
    /// cannot begin or end a canned path.
    fn steady_index(self) -> Option<usize> {
        use TapState::*;
        match self {
            Reset => Some(0),
            Idle => Some(1),
            ShiftDr => Some(2),
            PauseDr => Some(3),
            ShiftIr => Some(4),
            PauseIr => Some(5),
            _ => None,
        }
    }
}

impl fmt::Display for TapState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use TapState::*;
        let name = match self {
            Reset => "RESET",
            Idle => "IDLE",
            SelectDr => "DRSELECT",
            CaptureDr => "DRCAPTURE",
            ShiftDr => "DRSHIFT",
            Exit1Dr => "DREXIT1",
            PauseDr => "DRPAUSE",
            Exit2Dr => "DREXIT2",
            UpdateDr => "DRUPDATE",
            SelectIr => "IRSELECT",
            CaptureIr => "IRCAPTURE",
            ShiftIr => "IRSHIFT",
            Exit1Ir => "IREXIT1",
            PauseIr => "IRPAUSE",
            Exit2Ir => "IREXIT2",
            UpdateIr => "IRUPDATE",
        };
        f.write_str(name)
    }
}

/// TMS sequences between the six steady states, indexed by
/// [`TapState::steady_index`] as `[from][to]`.  Each entry is
/// `(sequence, clock count)`; sequences are clocked out LSB first.
/// Moves into Reset clock a full seven ones so the entry is valid no matter
/// where the target TAP actually is.
#[rustfmt::skip]
const TMS_PATHS: [[(u8, u8); 6]; 6] = [
    // to:  Reset    Idle       ShiftDr         PauseDr         ShiftIr         PauseIr
    [(0x7f, 7), (0x00, 7), (0b0010111, 7), (0b0001010, 7), (0b0011011, 7), (0b0010110, 7)], // from Reset
    [(0x7f, 7), (0x00, 7), (0b001, 3),     (0b0101, 4),    (0b0011, 4),    (0b01011, 5)],  // from Idle
    [(0x7f, 7), (0b011, 3), (0b00111, 5),  (0b01, 2),      (0b001111, 6),  (0b0101111, 7)],// from ShiftDr
    [(0x7f, 7), (0b011, 3), (0b01, 2),     (0b0, 1),       (0b001111, 6),  (0b0101111, 7)],// from PauseDr
    [(0x7f, 7), (0b011, 3), (0b00111, 5),  (0b010111, 6),  (0b001111, 6),  (0b01, 2)],     // from ShiftIr
    [(0x7f, 7), (0b011, 3), (0b00111, 5),  (0b010111, 6),  (0b01, 2),      (0b0, 1)],      // from PauseIr
];

/// TMS bit sequence driving the TAP from `from` to `to`, as
/// `(sequence, clock count)`.  Both states must be steady.
pub fn tms_path(from: TapState, to: TapState) -> Result<(u8, u8)> {
    let f = from.steady_index().ok_or(Error::NoTmsPath(from, to))?;
    let t = to.steady_index().ok_or(Error::NoTmsPath(from, to))?;
    Ok(TMS_PATHS[f][t])
}

/// Number of clocks in the TMS path from `from` to `to`.  Never more than 7.
pub fn tms_path_len(from: TapState, to: TapState) -> Result<u8> {
    tms_path(from, to).map(|(_, count)| count)
}

/// Follows the state the target TAP is in, plus the state the current
/// operation wants to leave it in.
pub struct StateFollower {
    pub current: TapState,
    pub end: TapState,
}

impl StateFollower {
    pub fn new() -> Self {
        Self {
            current: TapState::Reset,
            end: TapState::Reset,
        }
    }

    /// Record the state the current operation should finish in.  Only stable
    /// states are accepted.
    pub fn set_end_state(&mut self, state: TapState) -> Result<()> {
        if !state.is_stable() {
            return Err(Error::UnstableState(state));
        }
        self.end = state;
        Ok(())
    }
}

impl Default for StateFollower {
    fn default() -> Self {
        Self::new()
    }
}
