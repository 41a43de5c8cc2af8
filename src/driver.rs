//! The ULINK driver.  `Ulink` takes a list of abstract JTAG requests,
//! translates each into one or more wire commands, batches them into 64-byte
//! bulk packets, runs the USB round trips and hands captured TDO data back to
//! the requests that asked for it.
//!
//! The driver is generic over [`Transport`] the same way a state machine can
//! sit on top of any cable: `Ulink<UsbDevice>` talks to real hardware, tests
//! run against a scripted transport.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use crate::command::{
    Command, CommandId, CommandQueue, MAX_SCAN_BITS, PACKET_SIZE, SCAN_CHUNK_BYTES,
    SCAN_HEADER_BYTES, SIG_RESET, SIG_TCK, SIG_TDI, SIG_TDO, SIG_TMS, SIG_TRST,
};
use crate::error::{Error, Result};
use crate::firmware::{self, FirmwareImage};
use crate::request::{Request, ScanChain, ScanType};
use crate::statemachine::{tms_path, StateFollower, TapState};
use crate::usb::{Transport, UsbDevice, USB_TIMEOUT};

/// Timeout for the init-time probe exchanges.  Short, so a wedged adapter is
/// detected quickly instead of stalling startup for the full bulk timeout.
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Maximum TCK rate the adapter can produce, in kHz.
const MAX_TCK_KHZ: u16 = 150;

/// A TMS transition: `count` clocks with the levels in `sequence`, LSB first.
#[derive(Debug, Clone, Copy)]
struct TmsMove {
    count: u8,
    sequence: u8,
}

impl TmsMove {
    fn between(from: TapState, to: TapState) -> Result<Self> {
        let (sequence, count) = tms_path(from, to)?;
        Ok(Self { count, sequence })
    }
}

/// Map a requested TCK rate to the adapter's speed index.  Rate zero would
/// mean adaptive clocking, which the hardware cannot do.
pub fn khz(khz: u16) -> Result<u8> {
    if khz == 0 {
        return Err(Error::RclkUnsupported);
    }
    if khz > MAX_TCK_KHZ {
        return Err(Error::UnsupportedTckRate(khz));
    }
    log::info!("TCK rate: {khz} kHz");
    Ok(0)
}

/// The TCK rate a speed index stands for, in kHz.
pub fn speed_div(index: u8) -> Result<u16> {
    match index {
        0 => Ok(150),
        1 => Ok(100),
        _ => Err(Error::UnknownSpeedIndex(index)),
    }
}

/// Report the signal levels returned by a get-signals command.  TRST and
/// RESET pass through inverting drivers on their way to the connector.
fn print_signal_states(input: u8, output: u8) {
    log::info!(
        "ULINK signals: TDI: {}, TDO: {}, TMS: {}, TCK: {}, TRST: {}, SRST: {}",
        u8::from(output & SIG_TDI != 0),
        u8::from(input & SIG_TDO != 0),
        u8::from(output & SIG_TMS != 0),
        u8::from(output & SIG_TCK != 0),
        u8::from(output & SIG_TRST == 0),
        u8::from(output & SIG_RESET == 0),
    );
}

/// One ULINK adapter.
pub struct Ulink<T> {
    transport: T,
    queue: CommandQueue,
    tap: StateFollower,
    firmware: FirmwareImage,
    renumeration_delay: Duration,
    timeout: Duration,
    speed_index: u8,
    signals: Option<(u8, u8)>,
}

impl Ulink<UsbDevice> {
    /// Open the adapter on the USB bus.  `firmware_path` names the OpenULINK
    /// Intel HEX image downloaded during [`init`](Self::init) when the device
    /// is not already running it.
    pub fn open(firmware_path: &Path) -> Result<Self> {
        let firmware = FirmwareImage::load(firmware_path)?;
        let transport = UsbDevice::open()?;
        Ok(Self::new(transport, firmware))
    }
}

impl<T: Transport> Ulink<T> {
    pub fn new(transport: T, firmware: FirmwareImage) -> Self {
        Self {
            transport,
            queue: CommandQueue::new(),
            tap: StateFollower::new(),
            firmware,
            renumeration_delay: firmware::RENUMERATION_DELAY,
            timeout: USB_TIMEOUT,
            speed_index: 0,
            signals: None,
        }
    }

    /// Bring the adapter up: make sure the OpenULINK firmware is running,
    /// probe it, and report the JTAG signal levels.
    pub fn init(&mut self) -> Result<()> {
        let descriptor = self.transport.string_descriptor(1);
        let running = descriptor
            .as_deref()
            .map_or(false, |s| s.starts_with("OpenULINK"));

        if running {
            log::info!("ULINK is already running the OpenULINK firmware");
        } else {
            log::info!("loading the OpenULINK firmware; power-cycle the adapter to undo");
            firmware::download(&mut self.transport, &self.firmware)?;
            thread::sleep(self.renumeration_delay);
            self.transport.reopen()?;
        }

        self.queue.clear();

        // One probe command with a short timeout tells a live adapter from a
        // wedged one.
        self.append_test(&mut [])?;
        if self.execute(PROBE_TIMEOUT).is_err() {
            // The adapter may still be waiting for the host to collect a bulk
            // IN packet left behind by a session that died.  Collect it.
            let mut stale = [0u8; PACKET_SIZE];
            if self.transport.read_bulk(&mut stale, PROBE_TIMEOUT).is_err() {
                self.queue.clear();
                return Err(Error::Unresponsive);
            }
            log::debug!("drained a stale bulk IN packet from a previous session");
        }
        self.queue.clear();

        self.append_get_signals(&mut [])?;
        self.execute(PROBE_TIMEOUT)?;
        self.post_process(&mut [])?;
        self.queue.clear();

        if let Some((input, output)) = self.signals {
            print_signal_states(input, output);
        }
        Ok(())
    }

    /// Release the adapter.
    pub fn quit(mut self) -> Result<()> {
        self.transport.close()
    }

    /// Run a list of JTAG requests.  Captured scan data lands in the
    /// requests' `tdo` fields.  The first failing request aborts the rest and
    /// discards anything still queued.
    pub fn execute_queue(&mut self, requests: &mut [Request]) -> Result<()> {
        for index in 0..requests.len() {
            let result = match requests[index] {
                Request::Scan(_) => self.queue_scan(index, requests),
                Request::TlrReset => self.queue_tlr_reset(requests),
                Request::Runtest { cycles, end_state } => {
                    self.queue_runtest(cycles, end_state, requests)
                }
                Request::Reset { trst, srst } => self.queue_reset(trst, srst, requests),
                Request::Sleep { us } => self.queue_sleep(us, requests),
                Request::Pathmove { .. } => self.queue_pathmove(index, requests),
            };
            if let Err(error) = result {
                self.queue.clear();
                return Err(error);
            }
        }
        self.flush(requests)
    }

    /// Select a speed index previously returned by [`khz`].
    pub fn set_speed(&mut self, index: u8) -> Result<()> {
        let rate = speed_div(index)?;
        log::debug!("speed index {index} ({rate} kHz)");
        self.speed_index = index;
        Ok(())
    }

    pub fn speed(&self) -> u8 {
        self.speed_index
    }

    /// Program the delay counters the firmware inserts into its scan, TCK and
    /// TMS loops.  Takes effect immediately.
    pub fn configure_tck(&mut self, delay_scan: u8, delay_tck: u8, delay_tms: u8) -> Result<()> {
        let mut command = Command::new(CommandId::ConfigureTckFreq);
        command.allocate_out(3)?;
        command
            .out_mut()
            .copy_from_slice(&[delay_scan, delay_tck, delay_tms]);
        self.append(command, &mut [])?;
        self.flush(&mut [])
    }

    /// Drive the COM and RUN LEDs.  Takes effect immediately.
    pub fn set_leds(&mut self, leds: u8) -> Result<()> {
        let mut command = Command::new(CommandId::SetLeds);
        command.allocate_out(1)?;
        command.out_mut()[0] = leds;
        self.append(command, &mut [])?;
        self.flush(&mut [])
    }

    /* Request translators. */

    /// Translate a scan request, splitting it into as many wire commands as
    /// its length demands.  Chunks after the first resume from the pause
    /// state the previous chunk parked the TAP in, so the shift is seamless
    /// from the target's point of view.
    fn queue_scan(&mut self, origin: usize, requests: &mut [Request]) -> Result<()> {
        let (chain, bits, tdi, scan_type, end_state) = match &requests[origin] {
            Request::Scan(scan) => (
                scan.chain,
                scan.bits,
                scan.tdi().map(<[u8]>::to_vec),
                scan.scan_type(),
                scan.end_state,
            ),
            _ => return Ok(()),
        };

        if bits == 0 {
            return Err(Error::EmptyScan);
        }
        let bytes = (bits + 7) / 8;
        if let Some(tdi) = &tdi {
            if tdi.len() < bytes {
                return Err(Error::ShortTdiBuffer {
                    have: tdi.len(),
                    need: bytes,
                });
            }
        }

        let (shift, pause_state) = match chain {
            ScanChain::Dr => (TapState::ShiftDr, TapState::PauseDr),
            ScanChain::Ir => (TapState::ShiftIr, TapState::PauseIr),
        };

        // Work out every transition before touching the follower, so a bad
        // end state leaves it tracking the TAP's real position.
        let first = TmsMove::between(self.tap.current, shift)?;
        self.tap.set_end_state(end_state)?;
        let last = TmsMove::between(shift, end_state)?;
        let pause = TmsMove::between(shift, pause_state)?;
        let resume = TmsMove::between(pause_state, shift)?;
        self.tap.current = shift;

        let tdo_buffer = if matches!(scan_type, ScanType::In | ScanType::Io) {
            Some(Rc::new(RefCell::new(vec![0u8; bytes])))
        } else {
            None
        };

        let mut offset = 0;
        while offset < bytes {
            let is_first = offset == 0;
            let is_last = bytes - offset <= SCAN_CHUNK_BYTES;
            let chunk = (bytes - offset).min(SCAN_CHUNK_BYTES);
            let chunk_bits = if is_last { bits - offset * 8 } else { chunk * 8 };

            self.append_scan(
                scan_type,
                chunk_bits,
                tdi.as_deref().map(|tdi| &tdi[offset..offset + chunk]),
                tdo_buffer.as_ref(),
                offset,
                if is_first { first } else { resume },
                if is_last { last } else { pause },
                origin,
                is_last,
                requests,
            )?;
            offset += chunk;
        }

        self.tap.current = end_state;
        Ok(())
    }

    /// Five TMS-high clocks put the TAP in Test-Logic-Reset from anywhere.
    fn queue_tlr_reset(&mut self, requests: &mut [Request]) -> Result<()> {
        self.append_clock_tms(5, 0xff, requests)?;
        self.tap.current = TapState::Reset;
        Ok(())
    }

    fn queue_runtest(
        &mut self,
        cycles: u16,
        end_state: TapState,
        requests: &mut [Request],
    ) -> Result<()> {
        if self.tap.current != TapState::Idle {
            self.tap.set_end_state(TapState::Idle)?;
            self.queue_statemove(requests)?;
        }

        self.append_clock_tck(cycles, requests)?;

        if end_state != self.tap.current {
            self.tap.set_end_state(end_state)?;
            self.queue_statemove(requests)?;
        }
        Ok(())
    }

    /// Drive the TRST and SRST lines.  Asserted TRST resets the TAP, so the
    /// follower moves with it.
    fn queue_reset(&mut self, trst: bool, srst: bool, requests: &mut [Request]) -> Result<()> {
        let mut low = 0;
        let mut high = 0;

        if trst {
            self.tap.current = TapState::Reset;
            high |= SIG_TRST;
        } else {
            low |= SIG_TRST;
        }

        if srst {
            high |= SIG_RESET;
        } else {
            low |= SIG_RESET;
        }

        self.append_set_signals(low, high, requests)
    }

    /// The wait must happen on the adapter: by the time it reaches this
    /// command the host has long since moved on.
    fn queue_sleep(&mut self, us: u32, requests: &mut [Request]) -> Result<()> {
        let mut us = us;
        let mut slept_ms = false;
        while us > u32::from(u16::MAX) {
            let ms = (us / 1000).min(u32::from(u16::MAX)) as u16;
            self.append_sleep_ms(ms, requests)?;
            us -= u32::from(ms) * 1000;
            slept_ms = true;
        }
        if us > 0 || !slept_ms {
            self.append_sleep_us(us as u16, requests)?;
        }
        Ok(())
    }

    /// Walk the TAP through a caller-chosen sequence of adjacent states,
    /// seven TMS bits per wire command.
    fn queue_pathmove(&mut self, origin: usize, requests: &mut [Request]) -> Result<()> {
        let states = match &requests[origin] {
            Request::Pathmove { states } => states.clone(),
            _ => return Ok(()),
        };

        // Check the whole walk before emitting anything.
        let mut state = self.tap.current;
        for &target in &states {
            if state.step(false) != target && state.step(true) != target {
                return Err(Error::InvalidPath(state, target));
            }
            state = target;
        }

        let mut state = self.tap.current;
        let mut sequence = 0u8;
        let mut count = 0u8;
        for &target in &states {
            if state.step(true) == target {
                sequence |= 1 << count;
            }
            count += 1;
            state = target;

            if count == 7 {
                self.append_clock_tms(count, sequence, requests)?;
                self.tap.current = state;
                sequence = 0;
                count = 0;
            }
        }
        if count > 0 {
            self.append_clock_tms(count, sequence, requests)?;
        }
        self.tap.current = state;
        Ok(())
    }

    /// Move from the current state to the follower's end state.
    fn queue_statemove(&mut self, requests: &mut [Request]) -> Result<()> {
        if self.tap.current == self.tap.end {
            return Ok(());
        }
        let path = TmsMove::between(self.tap.current, self.tap.end)?;
        self.append_clock_tms(path.count, path.sequence, requests)?;
        self.tap.current = self.tap.end;
        Ok(())
    }

    /* Wire command emitters. */

    #[allow(clippy::too_many_arguments)]
    fn append_scan(
        &mut self,
        scan_type: ScanType,
        bits: usize,
        tdi: Option<&[u8]>,
        tdo: Option<&Rc<RefCell<Vec<u8>>>>,
        tdo_offset: usize,
        start: TmsMove,
        end: TmsMove,
        origin: usize,
        last: bool,
        requests: &mut [Request],
    ) -> Result<()> {
        if bits > MAX_SCAN_BITS {
            return Err(Error::OversizedScan(bits));
        }
        let bytes = (bits + 7) / 8;
        let bits_last_byte = ((bits - 1) % 8 + 1) as u8;

        // TODO: pick the slow scan ids once a speed threshold for them exists
        let id = match scan_type {
            ScanType::In => CommandId::ScanIn,
            ScanType::Out => CommandId::ScanOut,
            ScanType::Io => CommandId::ScanIo,
        };
        let mut command = Command::new(id);

        let payload = match scan_type {
            ScanType::In => SCAN_HEADER_BYTES,
            ScanType::Out | ScanType::Io => SCAN_HEADER_BYTES + bytes,
        };
        command.allocate_out(payload)?;
        let out = command.out_mut();
        out[0] = bytes as u8;
        out[1] = bits_last_byte;
        out[2] = (start.count & 0x0f) << 4 | (end.count & 0x0f);
        out[3] = start.sequence;
        out[4] = end.sequence;
        if let Some(tdi) = tdi {
            out[SCAN_HEADER_BYTES..].copy_from_slice(&tdi[..bytes]);
        }

        if let Some(buffer) = tdo {
            command.attach_input(Rc::clone(buffer), tdo_offset, bytes, last)?;
        }
        if last {
            command.set_postprocessing();
        }
        command.set_origin(origin);

        self.append(command, requests)
    }

    fn append_clock_tms(
        &mut self,
        count: u8,
        sequence: u8,
        requests: &mut [Request],
    ) -> Result<()> {
        let mut command = Command::new(CommandId::ClockTms);
        command.allocate_out(2)?;
        command.out_mut().copy_from_slice(&[count, sequence]);
        self.append(command, requests)
    }

    fn append_clock_tck(&mut self, count: u16, requests: &mut [Request]) -> Result<()> {
        let mut command = Command::new(CommandId::ClockTck);
        command.allocate_out(2)?;
        command.out_mut().copy_from_slice(&count.to_le_bytes());
        self.append(command, requests)
    }

    fn append_sleep_us(&mut self, us: u16, requests: &mut [Request]) -> Result<()> {
        let mut command = Command::new(CommandId::SleepUs);
        command.allocate_out(2)?;
        command.out_mut().copy_from_slice(&us.to_le_bytes());
        self.append(command, requests)
    }

    fn append_sleep_ms(&mut self, ms: u16, requests: &mut [Request]) -> Result<()> {
        let mut command = Command::new(CommandId::SleepMs);
        command.allocate_out(2)?;
        command.out_mut().copy_from_slice(&ms.to_le_bytes());
        self.append(command, requests)
    }

    fn append_set_signals(&mut self, low: u8, high: u8, requests: &mut [Request]) -> Result<()> {
        let mut command = Command::new(CommandId::SetSignals);
        command.allocate_out(2)?;
        command.out_mut().copy_from_slice(&[low, high]);
        self.append(command, requests)
    }

    fn append_get_signals(&mut self, requests: &mut [Request]) -> Result<()> {
        let mut command = Command::new(CommandId::GetSignals);
        command.allocate_input(2)?;
        command.set_postprocessing();
        self.append(command, requests)
    }

    fn append_test(&mut self, requests: &mut [Request]) -> Result<()> {
        let mut command = Command::new(CommandId::Test);
        command.allocate_out(1)?;
        command.out_mut()[0] = 0xaa;
        self.append(command, requests)
    }

    /* Queue handling. */

    /// Queue one command, first flushing if it would overflow either
    /// direction of the packet.
    fn append(&mut self, command: Command, requests: &mut [Request]) -> Result<()> {
        if !self.queue.fits(&command) {
            self.flush(requests)?;
        }
        self.queue.push(command);
        Ok(())
    }

    /// Execute and post-process whatever is queued, then discard it.  The
    /// queue is discarded on failure too; half-executed state is useless.
    fn flush(&mut self, requests: &mut [Request]) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let result = self
            .execute(self.timeout)
            .and_then(|()| self.post_process(requests));
        self.queue.clear();
        result
    }

    /// One USB round trip: the packed OUT packet, then the IN packet iff any
    /// queued command captures data, scattered back over the commands.
    fn execute(&mut self, timeout: Duration) -> Result<()> {
        let packet = self.queue.serialize();
        let expected = self.queue.bytes_in();
        log::debug!(
            "executing {} commands, {} bytes out, {} bytes back",
            self.queue.len(),
            packet.len(),
            expected
        );

        let written = self.transport.write_bulk(&packet, timeout)?;
        if written != packet.len() {
            return Err(Error::ShortWrite {
                written,
                expected: packet.len(),
            });
        }

        if expected > 0 {
            let mut buffer = [0u8; PACKET_SIZE];
            let read = self.transport.read_bulk(&mut buffer, timeout)?;
            if read != expected {
                return Err(Error::ShortRead { read, expected });
            }
            self.queue.scatter(&buffer[..read]);
        }
        Ok(())
    }

    /// Hand captured data back to the requests that asked for it.
    fn post_process(&mut self, requests: &mut [Request]) -> Result<()> {
        for command in self.queue.commands() {
            if !command.needs_postprocessing() {
                continue;
            }

            if command.id() == CommandId::GetSignals {
                if let Some(data) = command.captured() {
                    self.signals = Some((data[0], data[1]));
                }
                continue;
            }

            let Some(origin) = command.origin() else {
                continue;
            };
            let Some(Request::Scan(scan)) = requests.get_mut(origin) else {
                continue;
            };
            if scan.captures() {
                scan.tdo = command.captured();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ScanRequest;
    use std::collections::VecDeque;

    /// A scripted adapter: records bulk and control writes, answers bulk
    /// reads from a canned list of packets.
    struct MockTransport {
        written: Vec<Vec<u8>>,
        responses: VecDeque<Vec<u8>>,
        control_writes: Vec<(u8, u16, Vec<u8>)>,
        descriptor: Option<String>,
        fail_writes: usize,
        reopened: bool,
    }

    impl MockTransport {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                written: Vec::new(),
                responses: responses.into(),
                control_writes: Vec::new(),
                descriptor: Some("OpenULINK adapter".into()),
                fail_writes: 0,
                reopened: false,
            }
        }
    }

    impl Transport for MockTransport {
        fn write_bulk(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
            if self.fail_writes > 0 {
                self.fail_writes -= 1;
                return Err(Error::Transport(rusb::Error::Timeout));
            }
            self.written.push(data.to_vec());
            Ok(data.len())
        }

        fn read_bulk(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let response = self
                .responses
                .pop_front()
                .ok_or(Error::Transport(rusb::Error::Timeout))?;
            buf[..response.len()].copy_from_slice(&response);
            Ok(response.len())
        }

        fn write_control(
            &mut self,
            request: u8,
            value: u16,
            _index: u16,
            data: &[u8],
            _timeout: Duration,
        ) -> Result<usize> {
            self.control_writes.push((request, value, data.to_vec()));
            Ok(data.len())
        }

        fn string_descriptor(&mut self, _index: u8) -> Option<String> {
            self.descriptor.clone()
        }

        fn reopen(&mut self) -> Result<()> {
            self.reopened = true;
            Ok(())
        }
    }

    fn test_firmware() -> FirmwareImage {
        let records = vec![
            ihex::Record::Data {
                offset: 0x0000,
                value: vec![0x02, 0x01, 0x00],
            },
            ihex::Record::EndOfFile,
        ];
        let text = ihex::create_object_file_representation(&records).unwrap();
        FirmwareImage::parse(&text).unwrap()
    }

    fn ulink(responses: Vec<Vec<u8>>) -> Ulink<MockTransport> {
        let mut ulink = Ulink::new(MockTransport::new(responses), test_firmware());
        ulink.renumeration_delay = Duration::ZERO;
        ulink
    }

    #[test]
    fn dr_transfer_of_16_bits() {
        let mut ulink = ulink(vec![vec![0x12, 0x34]]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::Scan(ScanRequest::transfer(
            ScanChain::Dr,
            16,
            vec![0xab, 0xcd],
            TapState::Idle,
        ))];
        ulink.execute_queue(&mut requests).unwrap();

        assert_eq!(
            ulink.transport.written,
            vec![vec![0x04, 2, 8, 0x33, 0b001, 0b011, 0xab, 0xcd]]
        );
        let Request::Scan(scan) = &requests[0] else {
            unreachable!()
        };
        assert_eq!(scan.tdo.as_deref(), Some(&[0x12, 0x34][..]));
        assert_eq!(ulink.tap.current, TapState::Idle);
    }

    #[test]
    fn dr_write_of_512_bits_splits_at_58_bytes() {
        let mut ulink = ulink(vec![]);
        ulink.tap.current = TapState::Idle;
        let tdi: Vec<u8> = (0..64).collect();

        let mut requests = [Request::Scan(ScanRequest::write(
            ScanChain::Dr,
            512,
            tdi.clone(),
            TapState::Idle,
        ))];
        ulink.execute_queue(&mut requests).unwrap();

        let written = &ulink.transport.written;
        assert_eq!(written.len(), 2);

        // First chunk fills the whole packet and parks the TAP in DRPAUSE.
        assert_eq!(written[0].len(), PACKET_SIZE);
        assert_eq!(&written[0][..6], &[0x02, 58, 8, 0x32, 0b001, 0b01]);
        assert_eq!(&written[0][6..], &tdi[..58]);

        // Second chunk resumes from DRPAUSE and exits to Idle.
        assert_eq!(&written[1][..6], &[0x02, 6, 8, 0x23, 0b01, 0b011]);
        assert_eq!(&written[1][6..], &tdi[58..]);

        assert_eq!(ulink.tap.current, TapState::Idle);
    }

    #[test]
    fn dr_read_of_512_bits_fits_one_packet() {
        // Two read chunks capture 58 + 6 bytes; the OUT side is only twelve
        // bytes, so a single round trip carries both.
        let mut response = vec![0x11u8; 58];
        response.extend_from_slice(&[0x22; 6]);
        let mut ulink = ulink(vec![response.clone()]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::Scan(ScanRequest::read(
            ScanChain::Dr,
            512,
            TapState::Idle,
        ))];
        ulink.execute_queue(&mut requests).unwrap();

        let written = &ulink.transport.written;
        assert_eq!(written.len(), 1);
        assert_eq!(
            written[0],
            vec![
                0x00, 58, 8, 0x32, 0b001, 0b01, // shift and pause
                0x00, 6, 8, 0x23, 0b01, 0b011, // resume and exit
            ]
        );

        let Request::Scan(scan) = &requests[0] else {
            unreachable!()
        };
        assert_eq!(scan.tdo.as_deref(), Some(&response[..]));
    }

    #[test]
    fn split_transfer_reassembles_across_flushes() {
        let mut ulink = ulink(vec![vec![0x11; 58], vec![0x22; 6]]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::Scan(ScanRequest::transfer(
            ScanChain::Dr,
            512,
            vec![0u8; 64],
            TapState::Idle,
        ))];
        ulink.execute_queue(&mut requests).unwrap();

        assert_eq!(ulink.transport.written.len(), 2);
        let Request::Scan(scan) = &requests[0] else {
            unreachable!()
        };
        let mut expected = vec![0x11u8; 58];
        expected.extend_from_slice(&[0x22; 6]);
        assert_eq!(scan.tdo.as_deref(), Some(&expected[..]));
    }

    #[test]
    fn chunk_boundary_scan_is_a_single_command() {
        let mut ulink = ulink(vec![]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::Scan(ScanRequest::write(
            ScanChain::Dr,
            SCAN_CHUNK_BYTES * 8,
            vec![0u8; SCAN_CHUNK_BYTES],
            TapState::Idle,
        ))];
        ulink.execute_queue(&mut requests).unwrap();

        let written = &ulink.transport.written;
        assert_eq!(written.len(), 1);
        assert_eq!(&written[0][..6], &[0x02, 58, 8, 0x33, 0b001, 0b011]);
    }

    #[test]
    fn ir_scan_enters_the_ir_column() {
        let mut ulink = ulink(vec![]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::Scan(ScanRequest::write(
            ScanChain::Ir,
            6,
            vec![0x2b],
            TapState::Idle,
        ))];
        ulink.execute_queue(&mut requests).unwrap();

        // Idle to IRSHIFT is four clocks, IRSHIFT back to Idle three.
        assert_eq!(
            ulink.transport.written,
            vec![vec![0x02, 1, 6, 0x43, 0b0011, 0b011, 0x2b]]
        );
    }

    #[test]
    fn partial_last_byte_is_declared() {
        let mut ulink = ulink(vec![vec![0x05]]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::Scan(ScanRequest::read(
            ScanChain::Dr,
            3,
            TapState::Idle,
        ))];
        ulink.execute_queue(&mut requests).unwrap();

        assert_eq!(
            ulink.transport.written,
            vec![vec![0x00, 1, 3, 0x33, 0b001, 0b011]]
        );
    }

    #[test]
    fn zero_bit_scan_is_rejected() {
        let mut ulink = ulink(vec![]);
        let mut requests = [Request::Scan(ScanRequest::read(
            ScanChain::Dr,
            0,
            TapState::Idle,
        ))];
        assert!(matches!(
            ulink.execute_queue(&mut requests),
            Err(Error::EmptyScan)
        ));
        assert!(ulink.transport.written.is_empty());
        assert!(ulink.queue.is_empty());
    }

    #[test]
    fn short_tdi_buffer_is_rejected() {
        let mut ulink = ulink(vec![]);
        let mut requests = [Request::Scan(ScanRequest::write(
            ScanChain::Dr,
            16,
            vec![0xff],
            TapState::Idle,
        ))];
        assert!(matches!(
            ulink.execute_queue(&mut requests),
            Err(Error::ShortTdiBuffer { have: 1, need: 2 })
        ));
    }

    #[test]
    fn unstable_end_state_is_rejected() {
        let mut ulink = ulink(vec![]);
        ulink.tap.current = TapState::Idle;
        let mut requests = [Request::Scan(ScanRequest::read(
            ScanChain::Dr,
            8,
            TapState::ShiftDr,
        ))];
        assert!(matches!(
            ulink.execute_queue(&mut requests),
            Err(Error::UnstableState(TapState::ShiftDr))
        ));
        // Nothing went on the wire, so the follower must still be where the
        // TAP really is.
        assert_eq!(ulink.tap.current, TapState::Idle);
        assert!(ulink.transport.written.is_empty());
    }

    #[test]
    fn tlr_reset_is_five_ones() {
        let mut ulink = ulink(vec![]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::TlrReset];
        ulink.execute_queue(&mut requests).unwrap();

        assert_eq!(ulink.transport.written, vec![vec![0x06, 5, 0xff]]);
        assert_eq!(ulink.tap.current, TapState::Reset);
    }

    #[test]
    fn runtest_from_shiftdr_ending_in_idle() {
        let mut ulink = ulink(vec![]);
        ulink.tap.current = TapState::ShiftDr;

        let mut requests = [Request::Runtest {
            cycles: 100,
            end_state: TapState::Idle,
        }];
        ulink.execute_queue(&mut requests).unwrap();

        // Move to Idle, clock 100 cycles, no trailing move.
        assert_eq!(
            ulink.transport.written,
            vec![vec![0x06, 3, 0b011, 0x08, 100, 0]]
        );
        assert_eq!(ulink.tap.current, TapState::Idle);
    }

    #[test]
    fn runtest_moves_to_requested_end_state() {
        let mut ulink = ulink(vec![]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::Runtest {
            cycles: 1,
            end_state: TapState::PauseDr,
        }];
        ulink.execute_queue(&mut requests).unwrap();

        assert_eq!(
            ulink.transport.written,
            vec![vec![0x08, 1, 0, 0x06, 4, 0b0101]]
        );
        assert_eq!(ulink.tap.current, TapState::PauseDr);
    }

    #[test]
    fn trst_assertion_resets_the_follower() {
        let mut ulink = ulink(vec![]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::Reset {
            trst: true,
            srst: false,
        }];
        ulink.execute_queue(&mut requests).unwrap();

        assert_eq!(
            ulink.transport.written,
            vec![vec![0x0c, SIG_RESET, SIG_TRST]]
        );
        assert_eq!(ulink.tap.current, TapState::Reset);
    }

    #[test]
    fn srst_assertion_leaves_the_follower_alone() {
        let mut ulink = ulink(vec![]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::Reset {
            trst: false,
            srst: true,
        }];
        ulink.execute_queue(&mut requests).unwrap();

        assert_eq!(
            ulink.transport.written,
            vec![vec![0x0c, SIG_TRST, SIG_RESET]]
        );
        assert_eq!(ulink.tap.current, TapState::Idle);
    }

    #[test]
    fn sleep_is_a_single_adapter_side_command() {
        let mut ulink = ulink(vec![]);
        let mut requests = [Request::Sleep { us: 1234 }];
        ulink.execute_queue(&mut requests).unwrap();

        assert_eq!(ulink.transport.written, vec![vec![0x09, 0xd2, 0x04]]);
    }

    #[test]
    fn long_sleep_uses_milliseconds() {
        let mut ulink = ulink(vec![]);
        let mut requests = [Request::Sleep { us: 70_500 }];
        ulink.execute_queue(&mut requests).unwrap();

        assert_eq!(
            ulink.transport.written,
            vec![vec![0x0a, 70, 0, 0x09, 0xf4, 0x01]]
        );
    }

    #[test]
    fn zero_sleep_still_reaches_the_adapter() {
        let mut ulink = ulink(vec![]);
        let mut requests = [Request::Sleep { us: 0 }];
        ulink.execute_queue(&mut requests).unwrap();

        assert_eq!(ulink.transport.written, vec![vec![0x09, 0, 0]]);
    }

    #[test]
    fn pathmove_walks_adjacent_states() {
        let mut ulink = ulink(vec![]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::Pathmove {
            states: vec![
                TapState::SelectDr,
                TapState::CaptureDr,
                TapState::ShiftDr,
                TapState::Exit1Dr,
                TapState::PauseDr,
            ],
        }];
        ulink.execute_queue(&mut requests).unwrap();

        assert_eq!(ulink.transport.written, vec![vec![0x06, 5, 0b01001]]);
        assert_eq!(ulink.tap.current, TapState::PauseDr);
    }

    #[test]
    fn pathmove_groups_seven_bits_per_command() {
        let mut ulink = ulink(vec![]);
        ulink.tap.current = TapState::Idle;

        use TapState::*;
        let mut requests = [Request::Pathmove {
            states: vec![
                SelectDr, CaptureDr, ShiftDr, Exit1Dr, PauseDr, Exit2Dr, UpdateDr, Idle,
            ],
        }];
        ulink.execute_queue(&mut requests).unwrap();

        // TMS 1,0,0,1,0,1,1 then 0.
        assert_eq!(
            ulink.transport.written,
            vec![vec![0x06, 7, 0b1101001, 0x06, 1, 0]]
        );
        assert_eq!(ulink.tap.current, TapState::Idle);
    }

    #[test]
    fn pathmove_rejects_non_adjacent_states() {
        let mut ulink = ulink(vec![]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::Pathmove {
            states: vec![TapState::CaptureDr],
        }];
        assert!(matches!(
            ulink.execute_queue(&mut requests),
            Err(Error::InvalidPath(TapState::Idle, TapState::CaptureDr))
        ));
        assert!(ulink.transport.written.is_empty());
    }

    #[test]
    fn queue_splits_when_out_bytes_run_out() {
        let mut ulink = ulink(vec![]);
        // Each reset is a three-byte record; 21 fill 63 of 64 bytes.
        let mut requests: Vec<Request> = (0..30).map(|_| Request::TlrReset).collect();
        ulink.execute_queue(&mut requests).unwrap();

        let written = &ulink.transport.written;
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].len(), 63);
        assert_eq!(written[1].len(), 27);
        for packet in written {
            assert!(packet.len() <= PACKET_SIZE);
        }
    }

    #[test]
    fn short_read_is_a_protocol_error() {
        let mut ulink = ulink(vec![vec![0x12]]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [Request::Scan(ScanRequest::read(
            ScanChain::Dr,
            16,
            TapState::Idle,
        ))];
        assert!(matches!(
            ulink.execute_queue(&mut requests),
            Err(Error::ShortRead {
                read: 1,
                expected: 2
            })
        ));
        assert!(ulink.queue.is_empty());
    }

    #[test]
    fn mixed_queue_preserves_order_and_results() {
        let mut ulink = ulink(vec![vec![0xa5]]);
        ulink.tap.current = TapState::Idle;

        let mut requests = [
            Request::Sleep { us: 10 },
            Request::Scan(ScanRequest::transfer(
                ScanChain::Dr,
                8,
                vec![0x3c],
                TapState::Idle,
            )),
            Request::Runtest {
                cycles: 2,
                end_state: TapState::Idle,
            },
        ];
        ulink.execute_queue(&mut requests).unwrap();

        assert_eq!(
            ulink.transport.written,
            vec![vec![
                0x09, 10, 0, // sleep
                0x04, 1, 8, 0x33, 0b001, 0b011, 0x3c, // transfer
                0x08, 2, 0, // runtest
            ]]
        );
        let Request::Scan(scan) = &requests[1] else {
            unreachable!()
        };
        assert_eq!(scan.tdo.as_deref(), Some(&[0xa5][..]));
    }

    #[test]
    fn init_with_running_firmware_probes_and_reads_signals() {
        let mut ulink = ulink(vec![vec![SIG_TDO, SIG_TDI | SIG_TRST]]);
        ulink.init().unwrap();

        let transport = &ulink.transport;
        assert!(!transport.reopened);
        assert!(transport.control_writes.is_empty());
        assert_eq!(
            transport.written,
            vec![vec![0x0f, 0xaa], vec![0x0b]]
        );
        assert_eq!(ulink.signals, Some((SIG_TDO, SIG_TDI | SIG_TRST)));
    }

    #[test]
    fn init_downloads_firmware_onto_a_stock_device() {
        let mut ulink = ulink(vec![vec![0, 0]]);
        ulink.transport.descriptor = Some("ULINK".into());
        ulink.init().unwrap();

        let transport = &ulink.transport;
        assert!(transport.reopened);
        // CPUCS hold, one section, CPUCS release.
        assert_eq!(transport.control_writes.len(), 3);
        assert_eq!(transport.control_writes[0].1, 0x7f92);
        assert_eq!(transport.control_writes[2].1, 0x7f92);
        assert_eq!(
            transport.written,
            vec![vec![0x0f, 0xaa], vec![0x0b]]
        );
    }

    #[test]
    fn init_drains_a_stranded_packet() {
        // The probe write fails; a stale IN packet is waiting and the drain
        // picks it up, then init carries on with get-signals.
        let mut ulink = ulink(vec![vec![0u8; 64], vec![0, 0]]);
        ulink.transport.fail_writes = 1;
        ulink.init().unwrap();

        assert_eq!(ulink.transport.written, vec![vec![0x0b]]);
        assert_eq!(ulink.signals, Some((0, 0)));
    }

    #[test]
    fn init_gives_up_when_the_drain_fails_too() {
        let mut ulink = ulink(vec![]);
        ulink.transport.fail_writes = 1;
        assert!(matches!(ulink.init(), Err(Error::Unresponsive)));
    }

    #[test]
    fn speed_surface() {
        assert!(matches!(khz(0), Err(Error::RclkUnsupported)));
        assert!(matches!(khz(151), Err(Error::UnsupportedTckRate(151))));
        assert_eq!(khz(150).unwrap(), 0);
        assert_eq!(khz(1).unwrap(), 0);

        assert_eq!(speed_div(0).unwrap(), 150);
        assert_eq!(speed_div(1).unwrap(), 100);
        assert!(matches!(speed_div(2), Err(Error::UnknownSpeedIndex(2))));

        let mut ulink = ulink(vec![]);
        ulink.set_speed(1).unwrap();
        assert_eq!(ulink.speed(), 1);
        assert!(ulink.set_speed(7).is_err());
        assert_eq!(ulink.speed(), 1);
    }

    #[test]
    fn configure_tck_and_leds_flush_immediately() {
        let mut ulink = ulink(vec![]);
        ulink.configure_tck(10, 20, 30).unwrap();
        ulink.set_leds(crate::command::LED_RUN_ON).unwrap();

        assert_eq!(
            ulink.transport.written,
            vec![vec![0x0d, 10, 20, 30], vec![0x0e, 0x02]]
        );
    }
}
