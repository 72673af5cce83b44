//! In-process EtherCAT chain for tests and hardware-free runs.
//!
//! Each simulated slave is an ESC register file. Frames handed to
//! [`SimulatedChain::send`] are processed by every slave in chain order the
//! way real hardware does it (auto-increment addressing, station matching,
//! FMMU translation, work counters) and the reply is queued for
//! [`SimulatedChain::read`]. Writing outputs loops the first bytes of each
//! slave's output window back into its input window.

use crate::ethercat::{
    reg, Command, DatagramHeader, EcState, Fmmu, SyncManager, DATAGRAM_HEADER_SIZE,
    FIRST_DATAGRAM_OFFSET, WKC_SIZE,
};
use crate::ethercat::frame::is_ethercat_frame;
use crate::ethercat::records::{FMMU_TYPE_READ, FMMU_TYPE_WRITE};
use crate::transport::FrameTransport;
use emem_common::error::{EmemError, EmemResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, trace};

const ESC_MEMORY: usize = 0x1_0000;
const FMMU_COUNT: usize = 16;
/// Cable plus ESC forwarding delay between neighbours.
pub const SIM_HOP_DELAY_NS: u32 = 50;
const SIM_PORT_BASE_NS: u32 = 1_000_000;

struct SimSlave {
    mem: Box<[u8]>,
    muted: bool,
}

impl SimSlave {
    fn new(last: bool, dc: bool) -> Self {
        let mut s = Self {
            mem: vec![0u8; ESC_MEMORY].into_boxed_slice(),
            muted: false,
        };
        s.write_u16(reg::TYPE, 0x0011);
        s.write_u16(reg::ESC_SUP, if dc { 0x0004 } else { 0 });
        s.write_u16(reg::DL_STAT, if last { 0x0200 } else { 0x0A00 });
        s.write_u16(reg::AL_STAT, EcState::INIT.bits());
        s
    }

    fn read_u16(&self, at: u16) -> u16 {
        let at = usize::from(at);
        u16::from_le_bytes([self.mem[at], self.mem[at + 1]])
    }

    fn write_u16(&mut self, at: u16, v: u16) {
        let at = usize::from(at);
        self.mem[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn station(&self) -> u16 {
        self.read_u16(reg::STADR)
    }

    fn has_dc(&self) -> bool {
        self.read_u16(reg::ESC_SUP) & 0x0004 != 0
    }

    fn range(ado: u16, len: usize) -> std::ops::Range<usize> {
        let start = usize::from(ado);
        start..(start + len).min(ESC_MEMORY)
    }

    fn read(&self, ado: u16, data: &mut [u8], or: bool) {
        let r = Self::range(ado, data.len());
        for (d, m) in data.iter_mut().zip(&self.mem[r]) {
            *d = if or { *d | *m } else { *m };
        }
    }

    fn write(&mut self, ado: u16, data: &[u8]) {
        let r = Self::range(ado, data.len());
        let n = r.len();
        self.mem[r].copy_from_slice(&data[..n]);
        let end = usize::from(ado) + n;
        if usize::from(reg::AL_CTL) >= usize::from(ado) && usize::from(reg::AL_CTL) < end {
            let ctl = self.read_u16(reg::AL_CTL);
            // The error flag clears on acknowledge or on any new request.
            let state = ctl & 0x0F;
            if state != 0 {
                self.write_u16(reg::AL_STAT, state);
            }
        }
    }

    fn refresh_time(&mut self, now_ns: u64) {
        let offset = u64::from_le_bytes(self.mem_array(reg::DC_SYS_OFFSET));
        let t = now_ns.wrapping_add(offset);
        let at = usize::from(reg::DC_SYS_TIME);
        self.mem[at..at + 8].copy_from_slice(&t.to_le_bytes());
    }

    fn mem_array<const N: usize>(&self, at: u16) -> [u8; N] {
        let mut b = [0u8; N];
        let at = usize::from(at);
        b.copy_from_slice(&self.mem[at..at + N]);
        b
    }

    fn fmmus(&self) -> impl Iterator<Item = Fmmu> + '_ {
        (0..FMMU_COUNT).map(move |k| {
            let at = reg::FMMU0 + u16::try_from(k * Fmmu::SIZE).unwrap_or(0);
            Fmmu::from_bytes(&self.mem_array(at))
        })
    }

    fn sm(&self, k: u16) -> SyncManager {
        SyncManager::from_bytes(&self.mem_array(reg::SM0 + k * 8))
    }

    /// Apply logical addressing. Returns whether any FMMU matched.
    fn logical(&mut self, command: Command, logical: u32, data: &mut [u8]) -> bool {
        let wanted = if command == Command::Lwr { FMMU_TYPE_WRITE } else { FMMU_TYPE_READ };
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let fmmus: Vec<Fmmu> = self
            .fmmus()
            .filter(|f| f.fmmu_type == wanted && f.overlaps(logical, len))
            .collect();
        for f in &fmmus {
            let start = logical.max(f.log_start);
            let end = (logical + len).min(f.log_start + u32::from(f.log_length));
            for addr in start..end {
                let d = (addr - logical) as usize;
                let m = usize::from(f.phys_start) + (addr - f.log_start) as usize;
                if m >= ESC_MEMORY {
                    continue;
                }
                if command == Command::Lwr {
                    self.mem[m] = data[d];
                } else {
                    data[d] = self.mem[m];
                }
            }
        }
        !fmmus.is_empty()
    }

    fn loopback(&mut self) {
        let out = self.sm(2);
        let inp = self.sm(3);
        if out.activate & 1 == 0 || inp.activate & 1 == 0 {
            return;
        }
        let n = usize::from(out.length.min(inp.length));
        let (src, dst) = (usize::from(out.start_addr), usize::from(inp.start_addr));
        if src + n <= ESC_MEMORY && dst + n <= ESC_MEMORY {
            self.mem.copy_within(src..src + n, dst);
        }
    }
}

struct SimState {
    slaves: Vec<SimSlave>,
    replies: VecDeque<Vec<u8>>,
    reorder: bool,
    frames: u64,
    epoch: Instant,
    closed: bool,
}

impl SimState {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn latch_port_times(&mut self) {
        let n = self.slaves.len();
        let last = u32::try_from(n.saturating_sub(1)).unwrap_or(0) * SIM_HOP_DELAY_NS;
        let now = self.now_ns();
        for (k, slave) in self.slaves.iter_mut().enumerate() {
            if !slave.has_dc() {
                continue;
            }
            let t = u32::try_from(k).unwrap_or(0) * SIM_HOP_DELAY_NS;
            let port0 = SIM_PORT_BASE_NS + t;
            let port1 = if k + 1 < n { SIM_PORT_BASE_NS + 2 * last - t } else { 0 };
            let at = usize::from(reg::DC_TIME0);
            slave.mem[at..at + 4].copy_from_slice(&port0.to_le_bytes());
            slave.mem[at + 4..at + 8].copy_from_slice(&port1.to_le_bytes());
            let sof = at + 0x18;
            slave.mem[sof..sof + 8].copy_from_slice(&now.to_le_bytes());
        }
    }

    /// Run one datagram through the chain. Returns the work counter.
    fn process(&mut self, header: &DatagramHeader, addr: &mut [u8; 4], data: &mut [u8]) -> u16 {
        let mut wkc = 0u16;
        let mut adp = u16::from_le_bytes([addr[0], addr[1]]);
        let ado = u16::from_le_bytes([addr[2], addr[3]]);
        let logical = u32::from_le_bytes(*addr);
        let command = header.command;
        let now = self.now_ns();
        let mut frmw_read = false;
        let covers = |reg_at: u16, len: usize| {
            let (a, r) = (usize::from(ado), usize::from(reg_at));
            a <= r && r < a + len
        };
        let latch = command.writes() && covers(reg::DC_TIME0, data.len());
        let reads_time = covers(reg::DC_SYS_TIME, data.len());

        for slave in &mut self.slaves {
            if slave.muted {
                if matches!(command, Command::Aprd | Command::Apwr | Command::Aprw | Command::Armw) {
                    adp = adp.wrapping_add(1);
                }
                continue;
            }
            if reads_time {
                slave.refresh_time(now);
            }
            match command {
                Command::Nop => {}
                Command::Aprd | Command::Apwr | Command::Aprw | Command::Armw => {
                    if adp == 0 {
                        if command == Command::Apwr {
                            slave.write(ado, data);
                        } else {
                            slave.read(ado, data, false);
                        }
                        wkc += 1;
                    }
                    adp = adp.wrapping_add(1);
                }
                Command::Fprd | Command::Fpwr | Command::Fprw => {
                    if slave.station() == adp {
                        if command == Command::Fpwr {
                            slave.write(ado, data);
                        } else {
                            slave.read(ado, data, false);
                        }
                        wkc += 1;
                    }
                }
                Command::Frmw => {
                    if slave.station() == adp {
                        slave.read(ado, data, false);
                        frmw_read = true;
                        wkc += 1;
                    } else if frmw_read {
                        slave.write(ado, data);
                    }
                }
                Command::Brd | Command::Brw => {
                    slave.read(ado, data, true);
                    wkc += 1;
                }
                Command::Bwr => {
                    slave.write(ado, data);
                    wkc += 1;
                }
                Command::Lrd | Command::Lwr | Command::Lrw => {
                    if slave.logical(command, logical, data) {
                        wkc += 1;
                    }
                    if command == Command::Lwr {
                        slave.loopback();
                    }
                }
            }
        }
        if latch {
            self.latch_port_times();
        }
        if matches!(command, Command::Aprd | Command::Apwr | Command::Aprw | Command::Armw) {
            addr[..2].copy_from_slice(&adp.to_le_bytes());
        }
        wkc
    }

    fn process_frame(&mut self, frame: &[u8]) -> Vec<u8> {
        let mut reply = frame.to_vec();
        let mut offset = FIRST_DATAGRAM_OFFSET;
        while let Some(header) = reply.get(offset..).and_then(DatagramHeader::decode) {
            let payload = offset + DATAGRAM_HEADER_SIZE;
            let wkc_at = payload + usize::from(header.length);
            if wkc_at + WKC_SIZE > reply.len() {
                break;
            }
            let mut addr = [reply[offset + 2], reply[offset + 3], reply[offset + 4], reply[offset + 5]];
            let (head, tail) = reply.split_at_mut(wkc_at);
            let wkc = self.process(&header, &mut addr, &mut head[payload..]);
            let prev = u16::from_le_bytes([tail[0], tail[1]]);
            tail[..2].copy_from_slice(&prev.wrapping_add(wkc).to_le_bytes());
            reply[offset + 2..offset + 6].copy_from_slice(&addr);
            offset = wkc_at + WKC_SIZE;
            if !header.more {
                break;
            }
        }
        reply
    }
}

/// Simulated slave chain implementing [`FrameTransport`].
pub struct SimulatedChain {
    name: String,
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimulatedChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedChain").field("name", &self.name).finish_non_exhaustive()
    }
}

impl SimulatedChain {
    /// Chain of `count` DC capable slaves.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self::with_dc(&vec![true; count])
    }

    /// Chain with one slave per entry; `true` marks DC support.
    #[must_use]
    pub fn with_dc(dc: &[bool]) -> Self {
        let n = dc.len();
        let slaves = dc
            .iter()
            .enumerate()
            .map(|(k, &dc)| SimSlave::new(k + 1 == n, dc))
            .collect();
        debug!(slaves = n, "Simulated chain created");
        Self {
            name: format!("sim{n}"),
            state: Arc::new(Mutex::new(SimState {
                slaves,
                replies: VecDeque::new(),
                reorder: false,
                frames: 0,
                epoch: Instant::now(),
                closed: false,
            })),
        }
    }

    /// Fault injection handle sharing this chain.
    #[must_use]
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> EmemResult<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| EmemError::Io("simulated chain poisoned".into()))
    }
}

impl FrameTransport for SimulatedChain {
    fn send(&mut self, frame: &[u8]) -> EmemResult<()> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(EmemError::SendFailed("simulated chain closed".into()));
        }
        state.frames += 1;
        if !is_ethercat_frame(frame) {
            return Ok(());
        }
        let reply = state.process_frame(frame);
        trace!(len = reply.len(), "Simulated reply queued");
        if state.reorder {
            state.replies.push_front(reply);
        } else {
            state.replies.push_back(reply);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> EmemResult<usize> {
        let frame = self.lock()?.replies.pop_front().ok_or(EmemError::NoFrame)?;
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }

    fn close(&mut self) -> EmemResult<()> {
        let mut state = self.lock()?;
        state.closed = true;
        state.replies.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Cloneable handle for injecting faults into a [`SimulatedChain`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHandle").finish_non_exhaustive()
    }
}

impl SimHandle {
    fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Stop slave `i` from answering; frames still pass through it.
    pub fn mute(&self, i: usize, muted: bool) {
        self.with(|s| {
            if let Some(slave) = s.slaves.get_mut(i) {
                slave.muted = muted;
            }
        });
    }

    /// Put slave `i` into SafeOp with the error flag and `code`.
    pub fn inject_safe_op_error(&self, i: usize, code: u16) {
        self.with(|s| {
            if let Some(slave) = s.slaves.get_mut(i) {
                slave.write_u16(reg::AL_STAT, (EcState::SAFE_OP | EcState::ERROR).bits());
                slave.write_u16(reg::AL_STAT_CODE, code);
            }
        });
    }

    /// Simulate a power cycle of slave `i`: station address and state reset.
    pub fn power_cycle(&self, i: usize) {
        self.with(|s| {
            if let Some(slave) = s.slaves.get_mut(i) {
                slave.write_u16(reg::STADR, 0);
                slave.write_u16(reg::AL_STAT, EcState::INIT.bits());
                slave.mem[usize::from(reg::FMMU0)..usize::from(reg::FMMU0) + Fmmu::SIZE * FMMU_COUNT].fill(0);
            }
        });
    }

    /// Deliver replies newest first.
    pub fn set_reorder(&self, reorder: bool) {
        self.with(|s| s.reorder = reorder);
    }

    /// AL state of slave `i`.
    #[must_use]
    pub fn al_state(&self, i: usize) -> Option<EcState> {
        self.with(|s| s.slaves.get(i).map(|sl| EcState::from_bits(sl.read_u16(reg::AL_STAT))))
    }

    /// Station address of slave `i`.
    #[must_use]
    pub fn station(&self, i: usize) -> Option<u16> {
        self.with(|s| s.slaves.get(i).map(SimSlave::station))
    }

    /// `len` bytes of slave `i`'s register file starting at `at`.
    #[must_use]
    pub fn peek(&self, i: usize, at: u16, len: usize) -> Vec<u8> {
        self.with(|s| {
            s.slaves.get(i).map_or_else(Vec::new, |sl| {
                let mut v = vec![0u8; len];
                sl.read(at, &mut v, false);
                v
            })
        })
    }

    /// Overwrite slave `i`'s register file at `at`.
    pub fn poke(&self, i: usize, at: u16, data: &[u8]) {
        self.with(|s| {
            if let Some(slave) = s.slaves.get_mut(i) {
                let r = SimSlave::range(at, data.len());
                let n = r.len();
                slave.mem[r].copy_from_slice(&data[..n]);
            }
        });
    }

    /// Frames received so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.with(|s| s.frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethercat::{setup_datagram, Address, DatagramIter, EC_MAX_FRAME_SIZE};

    fn exchange(chain: &mut SimulatedChain, command: Command, address: Address, data: &[u8], len: u16) -> (Vec<u8>, u16) {
        let mut frame = [0u8; EC_MAX_FRAME_SIZE];
        let n = setup_datagram(&mut frame, command, 0, address, len, data);
        chain.send(&frame[..n]).unwrap();
        let mut rx = [0u8; EC_MAX_FRAME_SIZE];
        let m = chain.read(&mut rx).unwrap();
        let dg = DatagramIter::new(&rx[..m]).next().unwrap();
        (dg.payload.to_vec(), dg.wkc)
    }

    #[test]
    fn test_broadcast_counts_slaves() {
        let mut chain = SimulatedChain::new(3);
        let (data, wkc) = exchange(&mut chain, Command::Brd, Address::Broadcast { ado: reg::TYPE }, &[], 2);
        assert_eq!(wkc, 3);
        assert_eq!(data, vec![0x11, 0x00]);
    }

    #[test]
    fn test_position_then_node_addressing() {
        let mut chain = SimulatedChain::new(3);
        let (_, wkc) = exchange(&mut chain, Command::Apwr, Address::position(1, reg::STADR), &0x1002u16.to_le_bytes(), 2);
        assert_eq!(wkc, 1);
        assert_eq!(chain.handle().station(1), Some(0x1002));
        assert_eq!(chain.handle().station(0), Some(0));

        let (data, wkc) = exchange(&mut chain, Command::Fprd, Address::Node { adp: 0x1002, ado: reg::DL_STAT }, &[], 2);
        assert_eq!(wkc, 1);
        assert_eq!(data, vec![0x00, 0x0A]);
    }

    #[test]
    fn test_al_control_sets_status() {
        let mut chain = SimulatedChain::new(2);
        let h = chain.handle();
        exchange(&mut chain, Command::Bwr, Address::Broadcast { ado: reg::AL_CTL }, &EcState::PRE_OP.bits().to_le_bytes(), 2);
        assert_eq!(h.al_state(1), Some(EcState::PRE_OP));

        h.inject_safe_op_error(0, 0x001B);
        assert_eq!(h.al_state(0), Some(EcState::SAFE_OP | EcState::ERROR));
        let ack = (EcState::SAFE_OP | EcState::ACK).bits().to_le_bytes();
        exchange(&mut chain, Command::Bwr, Address::Broadcast { ado: reg::AL_CTL }, &ack, 2);
        assert_eq!(h.al_state(0), Some(EcState::SAFE_OP));
    }

    #[test]
    fn test_muted_slave_passes_frames() {
        let mut chain = SimulatedChain::new(3);
        chain.handle().mute(0, true);
        let (_, wkc) = exchange(&mut chain, Command::Brd, Address::Broadcast { ado: reg::TYPE }, &[], 2);
        assert_eq!(wkc, 2);
        // Position 1 is still reached through the muted slave.
        let (_, wkc) = exchange(&mut chain, Command::Aprd, Address::position(1, reg::TYPE), &[], 2);
        assert_eq!(wkc, 1);
    }

    #[test]
    fn test_reorder_reverses_replies() {
        let mut chain = SimulatedChain::new(1);
        chain.handle().set_reorder(true);
        let mut frame = [0u8; EC_MAX_FRAME_SIZE];
        for idx in [1u8, 2] {
            let n = setup_datagram(&mut frame, Command::Brd, idx, Address::Broadcast { ado: 0 }, 1, &[]);
            chain.send(&frame[..n]).unwrap();
        }
        let mut rx = [0u8; EC_MAX_FRAME_SIZE];
        let m = chain.read(&mut rx).unwrap();
        assert_eq!(crate::ethercat::frame_index(&rx[..m]), Some(2));
    }
}
