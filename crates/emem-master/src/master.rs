//! EtherCAT master: discovery, state machine, process image mapping,
//! distributed clocks, cyclic exchange and slave recovery.
//!
//! The bring-up sequence is [`Master::initialize`], [`Master::config`],
//! [`Master::config_dc`], optionally [`Master::config_sync0`], then
//! [`Master::request_operational`]. After that the owner alternates
//! [`Master::send_process_data`] and [`Master::receive_process_data`] every
//! cycle and calls [`Master::error_handle`] whenever the work counter drops.

use crate::buffer::EC_MAX_BUF;
use crate::dc::{compute_propagation_delays, master_time_ns, sync0_start_time, system_time_offset};
use crate::driver::{EcDriver, ProcessDataReply};
use crate::ethercat::records::{FMMU_TYPE_READ, FMMU_TYPE_WRITE, SM_CTRL_MBX_IN, SM_CTRL_MBX_OUT, SM_CTRL_PD_IN, SM_CTRL_PD_OUT};
use crate::ethercat::{
    reg, AlStatus, EcState, Fmmu, SmRole, SyncManager, EC_NODE_OFFSET, EC_SLAVE_MAX, EC_TEMP_NODE,
    MAX_FPRD_MULTI, MAX_IO_SEGMENTS, MAX_SEGMENT_SIZE,
};
use crate::nic::{Port, EC_TIMEOUT_RET};
use crate::slave::{find_parent, PreSafeHook, Slave, SlaveInfo};
use emem_common::config::{LinkConfig, SlaveProfile};
use emem_common::error::{EmemError, EmemResult};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Timeout for discovery broadcasts.
pub const EC_TIMEOUT_SAFE: Duration = Duration::from_millis(20);

const STATE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Timeouts and slave layout used by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterSettings {
    /// Process data and mailbox layout of every slave.
    pub profile: SlaveProfile,
    /// Timeout of a single blocking transaction.
    pub timeout: Duration,
    /// Timeout of a state transition.
    pub state_timeout: Duration,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            profile: SlaveProfile::default(),
            timeout: EC_TIMEOUT_RET,
            state_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&LinkConfig> for MasterSettings {
    fn from(config: &LinkConfig) -> Self {
        Self {
            profile: config.profile,
            timeout: config.timeout,
            state_timeout: config.state_timeout,
        }
    }
}

/// Which slaves a state operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTarget {
    /// Every slave, via broadcast.
    All,
    /// One slave by index.
    Slave(usize),
}

impl std::fmt::Display for StateTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all slaves"),
            Self::Slave(i) => write!(f, "slave {i}"),
        }
    }
}

/// Chain-wide status, kept apart from the per-slave records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupStatus {
    /// Lowest state among all slaves at the last read.
    pub lowest_state: EcState,
    /// State last requested by broadcast.
    pub requested_state: EcState,
    /// AL status code of the last slave found in error.
    pub al_status_code: u16,
}

/// One logical datagram of the cyclic exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Logical start address.
    pub logical: u32,
    /// Byte length.
    pub length: usize,
    /// Offset into the output or input image.
    pub image_offset: usize,
}

/// Outcome of one [`Master::error_handle`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Human readable description of every action taken.
    pub messages: Vec<String>,
    /// Slaves that stopped answering since the last pass.
    pub newly_lost: Vec<usize>,
    /// Slaves brought back.
    pub recovered: Vec<usize>,
}

impl HealthReport {
    /// Whether the pass found nothing to do.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Split an image made of per-slave `chunks` into logical segments.
///
/// Segments break at slave boundaries where possible; a single chunk larger
/// than `limit` is cut into `limit`-sized pieces.
///
/// # Errors
///
/// Returns a configuration error if more than [`MAX_IO_SEGMENTS`] are needed.
pub fn plan_segments(chunks: &[usize], base: u32, limit: usize) -> EmemResult<Vec<Segment>> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut offset = 0usize;
    let mut open: Option<Segment> = None;

    for &chunk in chunks.iter().filter(|&&c| c > 0) {
        if let Some(seg) = open.as_mut() {
            if seg.length + chunk <= limit {
                seg.length += chunk;
                offset += chunk;
                continue;
            }
        }
        segments.extend(open.take());
        let mut remaining = chunk;
        while remaining > 0 {
            let length = remaining.min(limit);
            let logical = base
                + u32::try_from(offset).map_err(|_| EmemError::Config("process image too large".into()))?;
            open = Some(Segment {
                logical,
                length,
                image_offset: offset,
            });
            offset += length;
            remaining -= length;
            if remaining > 0 {
                segments.extend(open.take());
            }
        }
    }
    segments.extend(open);

    if segments.len() > MAX_IO_SEGMENTS {
        return Err(EmemError::Config(format!(
            "process image needs {} segments, at most {MAX_IO_SEGMENTS} supported",
            segments.len()
        )));
    }
    Ok(segments)
}

fn position(i: usize) -> u16 {
    u16::try_from(i).unwrap_or(u16::MAX)
}

fn station_address(i: usize) -> u16 {
    EC_NODE_OFFSET + position(i) + 1
}

/// The EtherCAT master.
pub struct Master {
    driver: EcDriver,
    settings: MasterSettings,
    slaves: Vec<Slave>,
    group: GroupStatus,
    outputs: Vec<u8>,
    inputs: Vec<u8>,
    output_segments: Vec<Segment>,
    input_segments: Vec<Segment>,
    expected_wkc: u16,
    dc_reference: Option<usize>,
    dc_time: u64,
    flushed: Option<ProcessDataReply>,
    pre_safe_hook: Option<PreSafeHook>,
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("adapter", &self.driver.adapter())
            .field("slave_count", &self.slaves.len())
            .field("group", &self.group)
            .field("expected_wkc", &self.expected_wkc)
            .field("dc_reference", &self.dc_reference)
            .finish_non_exhaustive()
    }
}

impl Master {
    /// Master on an opened port.
    #[must_use]
    pub fn new(port: Port, settings: MasterSettings) -> Self {
        Self {
            driver: EcDriver::new(port),
            settings,
            slaves: Vec::new(),
            group: GroupStatus::default(),
            outputs: Vec::new(),
            inputs: Vec::new(),
            output_segments: Vec::new(),
            input_segments: Vec::new(),
            expected_wkc: 0,
            dc_reference: None,
            dc_time: 0,
            flushed: None,
            pre_safe_hook: None,
        }
    }

    /// Hook run on every slave between PreOp and SafeOp.
    pub fn set_pre_safe_hook(&mut self, hook: PreSafeHook) {
        for slave in &mut self.slaves {
            slave.pre_safe_hook = Some(hook.clone());
        }
        self.pre_safe_hook = Some(hook);
    }

    /// Number of discovered slaves.
    #[must_use]
    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    /// Slave records.
    #[must_use]
    pub fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    /// Display snapshot of every slave.
    #[must_use]
    pub fn slave_infos(&self) -> Vec<SlaveInfo> {
        self.slaves.iter().enumerate().map(|(i, s)| s.info(i)).collect()
    }

    /// Chain-wide status.
    #[must_use]
    pub fn group_status(&self) -> GroupStatus {
        self.group
    }

    /// Output image, sent by the next [`Master::send_process_data`].
    pub fn outputs_mut(&mut self) -> &mut [u8] {
        &mut self.outputs
    }

    /// Output image.
    #[must_use]
    pub fn outputs(&self) -> &[u8] {
        &self.outputs
    }

    /// Input image as of the last receive.
    #[must_use]
    pub fn inputs(&self) -> &[u8] {
        &self.inputs
    }

    /// Output segments.
    #[must_use]
    pub fn output_segments(&self) -> &[Segment] {
        &self.output_segments
    }

    /// Input segments.
    #[must_use]
    pub fn input_segments(&self) -> &[Segment] {
        &self.input_segments
    }

    /// Work counter of a healthy cycle.
    #[must_use]
    pub fn expected_wkc(&self) -> u16 {
        self.expected_wkc
    }

    /// Reference clock system time from the last cycle.
    #[must_use]
    pub fn dc_time(&self) -> u64 {
        self.dc_time
    }

    /// Index of the reference clock slave.
    #[must_use]
    pub fn dc_reference(&self) -> Option<usize> {
        self.dc_reference
    }

    /// Underlying driver, for raw register access.
    pub fn driver(&mut self) -> &mut EcDriver {
        &mut self.driver
    }

    /// Count the slaves on the chain.
    ///
    /// Clears alias addressing, forces Init and counts the answers to a
    /// broadcast read of the type register.
    ///
    /// # Errors
    ///
    /// [`EmemError::NoSlaves`], [`EmemError::TooManySlaves`], or transport errors.
    pub fn detect_slaves(&mut self) -> EmemResult<usize> {
        self.driver.bwr(reg::DL_ALIAS, &[0], EC_TIMEOUT_SAFE)?;
        let init_ack = (EcState::INIT | EcState::ACK).bits();
        // Some ESCs drop the first AL control write after power-up.
        self.driver.bwrw(reg::AL_CTL, init_ack, EC_TIMEOUT_SAFE)?;
        self.driver.bwrw(reg::AL_CTL, init_ack, EC_TIMEOUT_SAFE)?;
        let (_, wkc) = self.driver.brdw(reg::TYPE, EC_TIMEOUT_SAFE)?;
        let found = usize::from(wkc);
        if found == 0 {
            return Err(EmemError::NoSlaves);
        }
        if found > EC_SLAVE_MAX {
            return Err(EmemError::TooManySlaves {
                found,
                max: EC_SLAVE_MAX,
            });
        }
        debug!(found, "Slaves detected");
        Ok(found)
    }

    /// Broadcast the ESC defaults the master relies on.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub fn reset_slaves(&mut self) -> EmemResult<()> {
        let t = self.settings.timeout;
        let d = &mut self.driver;
        let zero = [0u8; 64];
        d.bwr(reg::DL_PORT, &[0], t)?;
        d.bwrw(reg::IRQ_MASK, 0x0004, t)?;
        d.bwr(reg::RX_ERR, &zero[..8], t)?;
        d.bwr(reg::FMMU0, &zero[..Fmmu::SIZE * 3], t)?;
        d.bwr(reg::SM0, &zero[..SyncManager::SIZE * 4], t)?;
        d.bwr(reg::DC_SYNC_ACT, &[0], t)?;
        d.bwr(reg::DC_SYS_TIME, &zero[..4], t)?;
        d.bwrw(reg::DC_SPEED_CNT, 0x1000, t)?;
        d.bwrw(reg::DC_TIME_FILT, 0x0C00, t)?;
        d.bwr(reg::DL_ALIAS, &[0], t)?;
        d.bwrw(reg::AL_CTL, (EcState::INIT | EcState::ACK).bits(), t)?;
        d.bwr(reg::EEP_CFG, &[2], t)?;
        d.bwr(reg::EEP_CFG, &[0], t)?;
        Ok(())
    }

    /// Discover, address and bring every slave to PreOp.
    ///
    /// Returns the slave count.
    ///
    /// # Errors
    ///
    /// Fails on the first wire error, or if the chain does not reach PreOp.
    pub fn initialize(&mut self) -> EmemResult<usize> {
        self.slaves.clear();
        self.outputs.clear();
        self.inputs.clear();
        self.output_segments.clear();
        self.input_segments.clear();
        self.expected_wkc = 0;
        self.dc_reference = None;
        self.group = GroupStatus::default();

        let count = self.detect_slaves()?;
        self.reset_slaves()?;

        let t = self.settings.timeout;
        let profile = self.settings.profile;
        for i in 0..count {
            let pos = position(i);
            let station = station_address(i);
            self.driver.apwrw(pos, reg::STADR, station, t)?;
            let confirmed = self.driver.fprdw(station, reg::STADR, t)?;
            if confirmed != station {
                return Err(EmemError::Protocol(format!(
                    "slave {i} reports station address {confirmed:#06x}, expected {station:#06x}"
                )));
            }
            let alias_addr = self.driver.fprdw(station, reg::ALIAS, t)?;
            let esc_features = self.driver.fprdw(station, reg::ESC_SUP, t)?;
            let dl_status = self.driver.fprdw(station, reg::DL_STAT, t)?;

            let mut slave = Slave {
                config_addr: station,
                alias_addr,
                has_dc: esc_features & 0x0004 != 0,
                pre_safe_hook: self.pre_safe_hook.clone(),
                ..Slave::default()
            };
            slave.apply_dl_status(dl_status);
            self.slaves.push(slave);
            let parent = find_parent(&self.slaves, i);
            self.slaves[i].parent = parent;

            self.program_mailbox(i, &profile)?;
            trace!(slave = i, station, alias_addr, dl_status, ?parent, "Slave addressed");
        }

        self.write_state(StateTarget::All, EcState::PRE_OP)?;
        self.require_state(StateTarget::All, EcState::PRE_OP)?;
        info!(slave_count = count, adapter = %self.driver.adapter(), "Slaves in PRE_OP");
        Ok(count)
    }

    fn program_mailbox(&mut self, i: usize, profile: &SlaveProfile) -> EmemResult<()> {
        let t = self.settings.timeout;
        let slave = &mut self.slaves[i];
        slave.mbx_wo = profile.mailbox_out.start;
        slave.mbx_l = profile.mailbox_out.length;
        slave.mbx_ro = profile.mailbox_in.start;
        slave.mbx_rl = profile.mailbox_in.length;
        if profile.mailbox_out.length > 0 {
            slave.sm[0] = SyncManager::enabled(slave.mbx_wo, slave.mbx_l, SM_CTRL_MBX_OUT);
            slave.sm_role[0] = SmRole::MailboxOut;
        }
        if profile.mailbox_in.length > 0 {
            slave.sm[1] = SyncManager::enabled(slave.mbx_ro, slave.mbx_rl, SM_CTRL_MBX_IN);
            slave.sm_role[1] = SmRole::MailboxIn;
        }
        let station = slave.config_addr;
        let sms = [slave.sm[0], slave.sm[1]];
        for (k, sm) in sms.iter().enumerate().filter(|(_, sm)| sm.start_addr != 0) {
            self.driver.fpwr(station, sm_register(k), &sm.to_bytes(), t)?;
        }
        Ok(())
    }

    /// Map every slave's process data into the logical image and bring the
    /// chain to SafeOp.
    ///
    /// Outputs come first, inputs follow. Returns the total image size.
    ///
    /// # Errors
    ///
    /// A configuration error if the image needs too many segments, a hook
    /// error, transport errors, or SafeOp not reached.
    pub fn config(&mut self) -> EmemResult<usize> {
        let t = self.settings.timeout;
        let profile = self.settings.profile;
        let out_bytes = usize::from(profile.output_bytes);
        let in_bytes = usize::from(profile.input_bytes);

        let mut logical: u32 = 0;
        let mut output_chunks = Vec::with_capacity(self.slaves.len());
        for i in 0..self.slaves.len() {
            let slave = &mut self.slaves[i];
            slave.fmmu_unused = 0;
            slave.output_bytes = out_bytes;
            slave.output_bits = u32::from(profile.output_bytes) * 8;
            slave.output_offset = logical as usize;
            output_chunks.push(out_bytes);
            if out_bytes == 0 {
                continue;
            }
            slave.sm[2] = SyncManager::enabled(profile.output_sm_start, profile.output_bytes, SM_CTRL_PD_OUT);
            slave.sm_role[2] = SmRole::Outputs;
            let fmmu = Fmmu {
                log_start: logical,
                log_length: profile.output_bytes,
                log_start_bit: 0,
                log_end_bit: 7,
                phys_start: profile.output_sm_start,
                phys_start_bit: 0,
                fmmu_type: FMMU_TYPE_WRITE,
                active: 1,
            };
            self.map_slave(i, 2, fmmu, t)?;
            logical += u32::from(profile.output_bytes);
        }
        let output_size = logical as usize;

        let mut input_chunks = Vec::with_capacity(self.slaves.len());
        for i in 0..self.slaves.len() {
            let slave = &mut self.slaves[i];
            slave.input_bytes = in_bytes;
            slave.input_bits = u32::from(profile.input_bytes) * 8;
            slave.input_offset = logical as usize - output_size;
            input_chunks.push(in_bytes);
            if in_bytes == 0 {
                continue;
            }
            slave.sm[3] = SyncManager::enabled(profile.input_sm_start, profile.input_bytes, SM_CTRL_PD_IN);
            slave.sm_role[3] = SmRole::Inputs;
            let fmmu = Fmmu {
                log_start: logical,
                log_length: profile.input_bytes,
                log_start_bit: 0,
                log_end_bit: 7,
                phys_start: profile.input_sm_start,
                phys_start_bit: 0,
                fmmu_type: FMMU_TYPE_READ,
                active: 1,
            };
            self.map_slave(i, 3, fmmu, t)?;
            logical += u32::from(profile.input_bytes);
        }
        let input_size = logical as usize - output_size;

        let limit = MAX_SEGMENT_SIZE;
        self.output_segments = plan_segments(&output_chunks, 0, limit)?;
        self.input_segments = plan_segments(&input_chunks, u32::try_from(output_size).unwrap_or(u32::MAX), limit)?;
        self.outputs = vec![0; output_size];
        self.inputs = vec![0; input_size];

        let outputs_slaves = self.slaves.iter().filter(|s| s.output_bytes > 0).count();
        let inputs_slaves = self.slaves.iter().filter(|s| s.input_bytes > 0).count();
        self.expected_wkc = u16::try_from(outputs_slaves * 2 + inputs_slaves).unwrap_or(u16::MAX);

        for i in 0..self.slaves.len() {
            self.run_pre_safe_hook(i)?;
        }

        self.write_state(StateTarget::All, EcState::SAFE_OP)?;
        self.require_state(StateTarget::All, EcState::SAFE_OP)?;
        info!(
            output_size,
            input_size,
            output_segments = self.output_segments.len(),
            input_segments = self.input_segments.len(),
            expected_wkc = self.expected_wkc,
            "Process image mapped, slaves in SAFE_OP"
        );
        Ok(output_size + input_size)
    }

    fn map_slave(&mut self, i: usize, sm_index: usize, fmmu: Fmmu, t: Duration) -> EmemResult<()> {
        let slave = &mut self.slaves[i];
        let station = slave.config_addr;
        let sm = slave.sm[sm_index];
        let k = slave.fmmu_unused;
        if k >= slave.fmmu.len() {
            return Err(EmemError::Config(format!("slave {i} has no free FMMU")));
        }
        slave.fmmu[k] = fmmu;
        slave.fmmu_unused += 1;
        self.driver.fpwr(station, sm_register(sm_index), &sm.to_bytes(), t)?;
        self.driver.fpwr(station, fmmu_register(k), &fmmu.to_bytes(), t)?;
        Ok(())
    }

    fn run_pre_safe_hook(&mut self, i: usize) -> EmemResult<()> {
        if let Some(hook) = self.slaves[i].pre_safe_hook.clone() {
            hook(&mut self.driver, &self.slaves[i])?;
        }
        Ok(())
    }

    /// Measure propagation delays and align every DC slave's clock.
    ///
    /// Returns whether any slave supports distributed clocks.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub fn config_dc(&mut self) -> EmemResult<bool> {
        let t = self.settings.timeout;
        self.driver.bwr(reg::DC_TIME0, &[0; 4], t)?;
        let master_time = master_time_ns();

        for i in 0..self.slaves.len() {
            if !self.slaves[i].has_dc {
                continue;
            }
            let station = self.slaves[i].config_addr;
            let mut times = [0u8; 16];
            self.driver.fprd(station, reg::DC_TIME0, &mut times, t)?;
            for (port, chunk) in times.chunks_exact(4).enumerate() {
                self.slaves[i].port_times[port] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            let mut sof = [0u8; 8];
            self.driver.fprd(station, reg::DC_SOF, &mut sof, t)?;
            let offset = system_time_offset(master_time, u64::from_le_bytes(sof));
            self.driver.fpwr(station, reg::DC_SYS_OFFSET, &offset.to_le_bytes(), t)?;
        }

        self.dc_reference = compute_propagation_delays(&mut self.slaves);

        for i in 0..self.slaves.len() {
            if self.slaves[i].has_dc {
                let station = self.slaves[i].config_addr;
                let delay = self.slaves[i].delay.to_le_bytes();
                self.driver.fpwr(station, reg::DC_SYS_DELAY, &delay, t)?;
            }
        }

        match self.dc_reference {
            Some(reference) => info!(reference, "Distributed clocks configured"),
            None => warn!("No DC capable slaves"),
        }
        Ok(self.dc_reference.is_some())
    }

    /// Start SYNC0 on every DC slave with period `cycle`, offset by `shift_ns`.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub fn config_sync0(&mut self, cycle: Duration, shift_ns: i64) -> EmemResult<()> {
        let t = self.settings.timeout;
        let cycle_ns = u64::try_from(cycle.as_nanos()).unwrap_or(u64::MAX);
        let cycle_reg = u32::try_from(cycle_ns).map_err(|_| EmemError::Config(format!("sync0 cycle {cycle:?} too long")))?;

        for i in 0..self.slaves.len() {
            if !self.slaves[i].has_dc {
                continue;
            }
            let station = self.slaves[i].config_addr;
            self.driver.fpwr(station, reg::DC_SYNC_ACT, &[0], t)?;
            self.driver.fpwr(station, reg::DC_CUC, &[0], t)?;
            let mut now = [0u8; 8];
            self.driver.fprd(station, reg::DC_SYS_TIME, &mut now, t)?;
            let start = sync0_start_time(u64::from_le_bytes(now), cycle_ns, shift_ns);
            self.driver.fpwr(station, reg::DC_START0, &start.to_le_bytes(), t)?;
            self.driver.fpwr(station, reg::DC_CYCLE0, &cycle_reg.to_le_bytes(), t)?;
            // Cyclic unit plus SYNC0.
            self.driver.fpwr(station, reg::DC_SYNC_ACT, &[0x03], t)?;
            debug!(slave = i, start, cycle_ns, "SYNC0 armed");
        }
        Ok(())
    }

    /// Read every slave's AL status. Returns the lowest state found.
    ///
    /// Slaves that do not answer are recorded as [`EcState::NONE`].
    ///
    /// # Errors
    ///
    /// Transport errors other than a missing reply.
    pub fn read_state(&mut self) -> EmemResult<EcState> {
        let t = self.settings.timeout;
        let stations: Vec<u16> = self.slaves.iter().map(|s| s.config_addr).collect();
        let mut lowest: Option<EcState> = None;

        for (chunk_index, chunk) in stations.chunks(MAX_FPRD_MULTI).enumerate() {
            let replies = match self.driver.fprd_multi(chunk, reg::AL_STAT, AlStatus::SIZE, t) {
                Ok(r) => r,
                Err(EmemError::NoFrame) => vec![None; chunk.len()],
                Err(e) => return Err(e),
            };
            for (k, reply) in replies.into_iter().enumerate() {
                let slave = &mut self.slaves[chunk_index * MAX_FPRD_MULTI + k];
                match reply.as_deref().and_then(AlStatus::from_bytes) {
                    Some(al) => {
                        slave.state = EcState::from_bits(al.status);
                        slave.al_status_code = al.code;
                        if slave.state.is_error() {
                            self.group.al_status_code = al.code;
                        }
                    }
                    None => slave.state = EcState::NONE,
                }
                lowest = Some(lowest.map_or(slave.state, |l| l.min(slave.state)));
            }
        }
        let lowest = lowest.unwrap_or(EcState::NONE);
        self.group.lowest_state = lowest;
        Ok(lowest)
    }

    /// Request `state` on `target`. Returns the work counter.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub fn write_state(&mut self, target: StateTarget, state: EcState) -> EmemResult<u16> {
        let t = self.settings.timeout;
        match target {
            StateTarget::All => {
                self.group.requested_state = state;
                self.driver.bwrw(reg::AL_CTL, state.bits(), t)
            }
            StateTarget::Slave(i) => {
                let station = self.station(i)?;
                self.driver.fpwrw(station, reg::AL_CTL, state.bits(), t)
            }
        }
    }

    /// Poll `target` until it reports `state` or `timeout` passes.
    ///
    /// Returns the last state read; compare its level with `state` to know
    /// whether the transition happened.
    ///
    /// # Errors
    ///
    /// Transport errors other than a missing reply.
    pub fn state_check(&mut self, target: StateTarget, state: EcState, timeout: Duration) -> EmemResult<EcState> {
        let deadline = Instant::now() + timeout;
        let t = self.settings.timeout;
        loop {
            let current = match target {
                StateTarget::All => match self.driver.brdw(reg::AL_STAT, t) {
                    Ok((bits, wkc)) if wkc > 0 => EcState::from_bits(bits),
                    Ok(_) | Err(EmemError::NoFrame) => EcState::NONE,
                    Err(e) => return Err(e),
                },
                StateTarget::Slave(i) => {
                    let station = self.station(i)?;
                    let mut al = [0u8; AlStatus::SIZE];
                    let current = match self.driver.fprd(station, reg::AL_STAT, &mut al, t) {
                        Ok(wkc) if wkc > 0 => AlStatus::from_bytes(&al).unwrap_or_default(),
                        Ok(_) | Err(EmemError::NoFrame) => AlStatus::default(),
                        Err(e) => return Err(e),
                    };
                    let slave = &mut self.slaves[i];
                    slave.state = EcState::from_bits(current.status);
                    slave.al_status_code = current.code;
                    slave.state
                }
            };
            if current.is(state) {
                if target == StateTarget::All {
                    for slave in &mut self.slaves {
                        slave.state = current;
                    }
                    self.group.lowest_state = current;
                }
                return Ok(current);
            }
            if Instant::now() >= deadline {
                trace!(%target, expected = %state, actual = %current, "State check timed out");
                return Ok(current);
            }
            std::thread::sleep(STATE_POLL_INTERVAL);
        }
    }

    fn require_state(&mut self, target: StateTarget, state: EcState) -> EmemResult<()> {
        let reached = self.state_check(target, state, self.settings.state_timeout)?;
        if reached.is(state) {
            return Ok(());
        }
        if target == StateTarget::All {
            self.read_state()?;
            for (i, slave) in self.slaves.iter().enumerate().filter(|(_, s)| !s.state.is(state)) {
                warn!(
                    slave = i,
                    state = %slave.state,
                    al_status_code = slave.al_status_code,
                    "Slave did not reach {state}"
                );
            }
        }
        Err(EmemError::StateNotReached {
            target: target.to_string(),
            expected: state.to_string(),
            actual: reached.to_string(),
        })
    }

    fn station(&self, i: usize) -> EmemResult<u16> {
        self.slaves
            .get(i)
            .map(|s| s.config_addr)
            .ok_or_else(|| EmemError::Config(format!("no slave {i}")))
    }

    /// Bring the chain to Operational while keeping process data flowing.
    ///
    /// # Errors
    ///
    /// [`EmemError::StateNotReached`] if Operational is not reached in `timeout`.
    pub fn request_operational(&mut self, timeout: Duration) -> EmemResult<()> {
        let deadline = Instant::now() + timeout;
        let cycle_timeout = self.settings.timeout;
        self.exchange_once(cycle_timeout);
        self.write_state(StateTarget::All, EcState::OPERATIONAL)?;
        loop {
            self.exchange_once(cycle_timeout);
            let state = self.state_check(StateTarget::All, EcState::OPERATIONAL, Duration::from_millis(5))?;
            if state.is(EcState::OPERATIONAL) {
                info!(slave_count = self.slaves.len(), "All slaves OPERATIONAL");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return self.require_state(StateTarget::All, EcState::OPERATIONAL);
            }
        }
    }

    fn exchange_once(&mut self, timeout: Duration) {
        if let Err(e) = self.send_process_data().and_then(|()| self.receive_process_data(timeout).map(|_| ())) {
            trace!(error = %e, "Exchange during state change failed");
        }
    }

    /// Transmit the output image and queue reads of the input image.
    ///
    /// If more segments are outstanding than the buffer ring holds, the
    /// earlier ones are collected first.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub fn send_process_data(&mut self) -> EmemResult<()> {
        self.flushed = None;
        let timeout = self.settings.timeout;

        for k in 0..self.output_segments.len() {
            self.flush_if_full(timeout)?;
            let seg = self.output_segments[k];
            let data = &self.outputs[seg.image_offset..seg.image_offset + seg.length];
            self.driver.process_data_segment_trans_lwr(seg.logical, data)?;
        }

        let dc_station = self.dc_reference.map(|r| self.slaves[r].config_addr);
        for k in 0..self.input_segments.len() {
            self.flush_if_full(timeout)?;
            let seg = self.input_segments[k];
            let dc = if k == 0 { dc_station } else { None };
            self.driver
                .process_data_segment_trans_lrd(seg.logical, seg.image_offset, seg.length, dc)?;
        }
        Ok(())
    }

    fn flush_if_full(&mut self, timeout: Duration) -> EmemResult<()> {
        if self.driver.port().idx_stack().pushed() < EC_MAX_BUF {
            return Ok(());
        }
        let reply = self.driver.receive_process_data(&mut self.inputs, timeout);
        self.flushed = merge_replies(self.flushed, reply.ok());
        Ok(())
    }

    /// Collect the replies to the last [`Master::send_process_data`].
    ///
    /// # Errors
    ///
    /// [`EmemError::NoFrame`] if no frame of this cycle came back.
    pub fn receive_process_data(&mut self, timeout: Duration) -> EmemResult<ProcessDataReply> {
        let reply = self.driver.receive_process_data(&mut self.inputs, timeout);
        let merged = match (self.flushed.take(), reply) {
            (flushed, Ok(r)) => merge_replies(flushed, Some(r)),
            (Some(f), Err(EmemError::NoFrame)) => Some(f),
            (_, Err(e)) => return Err(e),
        };
        let reply = merged.ok_or(EmemError::NoFrame)?;
        if let Some(t) = reply.dc_time {
            self.dc_time = t;
        }
        trace!(wkc = reply.wkc, expected = self.expected_wkc, "Process data received");
        Ok(reply)
    }

    /// Inspect every slave and try to bring misbehaving ones back.
    pub fn error_handle(&mut self) -> HealthReport {
        let mut report = HealthReport::default();
        if let Err(e) = self.read_state() {
            report.messages.push(format!("state read failed: {e}"));
            return report;
        }
        for i in 0..self.slaves.len() {
            self.check_state(i, &mut report);
            self.check_lost(i, &mut report);
        }
        for msg in &report.messages {
            debug!("{msg}");
        }
        report
    }

    fn check_state(&mut self, i: usize, report: &mut HealthReport) {
        let state = self.slaves[i].state;
        if state.is(EcState::OPERATIONAL) && !state.is_error() {
            return;
        }
        if state == EcState::SAFE_OP | EcState::ERROR {
            report
                .messages
                .push(format!("slave {i} is in SAFE_OP + ERROR, acknowledging"));
            if let Err(e) = self.write_state(StateTarget::Slave(i), EcState::SAFE_OP | EcState::ACK) {
                report.messages.push(format!("slave {i}: acknowledge failed: {e}"));
            }
        } else if state == EcState::SAFE_OP {
            report
                .messages
                .push(format!("slave {i} is in SAFE_OP, requesting OPERATIONAL"));
            if let Err(e) = self.write_state(StateTarget::Slave(i), EcState::OPERATIONAL) {
                report.messages.push(format!("slave {i}: state request failed: {e}"));
            }
        } else if state > EcState::NONE {
            match self.re_config_slave(i, self.settings.timeout) {
                Ok(reached) if reached > EcState::NONE => {
                    self.slaves[i].is_lost = false;
                    report.messages.push(format!("slave {i} reconfigured to {reached}"));
                }
                Ok(_) => report.messages.push(format!("slave {i} did not respond to reconfiguration")),
                Err(e) => report.messages.push(format!("slave {i}: reconfiguration failed: {e}")),
            }
        } else if !self.slaves[i].is_lost {
            let timeout = self.settings.timeout;
            let current = self
                .state_check(StateTarget::Slave(i), EcState::OPERATIONAL, timeout)
                .unwrap_or(EcState::NONE);
            if current == EcState::NONE {
                self.slaves[i].is_lost = true;
                report.newly_lost.push(i);
                report.messages.push(format!("slave {i} lost"));
                warn!(slave = i, "Slave lost");
            }
        }
    }

    fn check_lost(&mut self, i: usize, report: &mut HealthReport) {
        if !self.slaves[i].is_lost {
            return;
        }
        if self.slaves[i].state == EcState::NONE {
            match self.recover_slave(i, self.settings.timeout) {
                Ok(()) => {
                    self.slaves[i].is_lost = false;
                    report.recovered.push(i);
                    report.messages.push(format!("slave {i} recovered"));
                    info!(slave = i, "Slave recovered");
                }
                Err(e) => trace!(slave = i, error = %e, "Recovery failed"),
            }
        } else {
            self.slaves[i].is_lost = false;
            report.recovered.push(i);
            report.messages.push(format!("slave {i} found"));
            info!(slave = i, "Slave found");
        }
    }

    /// Re-establish the station address of a slave that dropped off the chain.
    ///
    /// # Errors
    ///
    /// [`EmemError::NotRecovered`] if nothing answers at its position,
    /// [`EmemError::WrongSlave`] if a different device sits there.
    pub fn recover_slave(&mut self, i: usize, timeout: Duration) -> EmemResult<()> {
        let station = self.station(i)?;
        let pos = position(i);
        let mut word = [0u8; 2];
        if self.driver.aprd(pos, reg::STADR, &mut word, timeout)? == 0 {
            return Err(EmemError::NotRecovered(i));
        }
        let found = u16::from_le_bytes(word);
        if found == station {
            return Ok(());
        }
        if found != 0 {
            return Err(EmemError::WrongSlave { slave: i, found });
        }

        // Power cycled: the ESC lost its station address.
        // Clear any stale holder of the temporary address first.
        self.driver.fpwrw(EC_TEMP_NODE, reg::STADR, 0, timeout)?;
        if self.driver.apwrw(pos, reg::STADR, EC_TEMP_NODE, timeout)? == 0 {
            if let Err(e) = self.driver.fpwrw(EC_TEMP_NODE, reg::STADR, 0, timeout) {
                warn!(slave = i, error = %e, "Temporary address not released");
            }
            return Err(EmemError::NotRecovered(i));
        }
        let alias = self.driver.fprdw(EC_TEMP_NODE, reg::ALIAS, timeout)?;
        if alias == self.slaves[i].alias_addr {
            self.driver.fpwrw(EC_TEMP_NODE, reg::STADR, station, timeout)?;
            Ok(())
        } else {
            self.driver.fpwrw(EC_TEMP_NODE, reg::STADR, 0, timeout)?;
            Err(EmemError::WrongSlave { slave: i, found: alias })
        }
    }

    /// Walk one slave back up to SafeOp with its stored configuration.
    ///
    /// Returns the state reached.
    ///
    /// # Errors
    ///
    /// Transport or hook errors.
    pub fn re_config_slave(&mut self, i: usize, timeout: Duration) -> EmemResult<EcState> {
        let station = self.station(i)?;
        let state_timeout = self.settings.state_timeout;
        self.driver.fpwrw(station, reg::AL_CTL, EcState::INIT.bits(), timeout)?;
        let mut state = self.state_check(StateTarget::Slave(i), EcState::INIT, state_timeout)?;
        if !state.is(EcState::INIT) {
            return Ok(state);
        }

        let sms = self.slaves[i].sm;
        for (k, sm) in sms.iter().enumerate().filter(|(_, sm)| sm.start_addr != 0) {
            self.driver.fpwr(station, sm_register(k), &sm.to_bytes(), timeout)?;
        }
        self.driver.fpwrw(station, reg::AL_CTL, EcState::PRE_OP.bits(), timeout)?;
        if self.state_check(StateTarget::Slave(i), EcState::PRE_OP, state_timeout)?.is(EcState::PRE_OP) {
            self.run_pre_safe_hook(i)?;
            self.driver.fpwrw(station, reg::AL_CTL, EcState::SAFE_OP.bits(), timeout)?;
            state = self.state_check(StateTarget::Slave(i), EcState::SAFE_OP, state_timeout)?;
            let fmmus = self.slaves[i].fmmu;
            for (k, fmmu) in fmmus.iter().enumerate().take(self.slaves[i].fmmu_unused) {
                self.driver.fpwr(station, fmmu_register(k), &fmmu.to_bytes(), timeout)?;
            }
        }
        Ok(state)
    }

    /// Request Init on every slave and release the adapter.
    ///
    /// # Errors
    ///
    /// Transport errors.
    pub fn close(&mut self) -> EmemResult<()> {
        if !self.slaves.is_empty() {
            self.write_state(StateTarget::All, EcState::INIT)?;
        }
        info!(adapter = %self.driver.adapter(), "Master closed");
        self.driver.port().close()
    }
}

fn sm_register(k: usize) -> u16 {
    reg::SM0 + position(k * SyncManager::SIZE)
}

fn fmmu_register(k: usize) -> u16 {
    reg::FMMU0 + position(k * Fmmu::SIZE)
}

fn merge_replies(a: Option<ProcessDataReply>, b: Option<ProcessDataReply>) -> Option<ProcessDataReply> {
    match (a, b) {
        (Some(a), Some(b)) => Some(ProcessDataReply {
            wkc: a.wkc.wrapping_add(b.wkc),
            dc_time: a.dc_time.or(b.dc_time),
        }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_segments_sum_and_limit() {
        let chunks = vec![626; 7];
        let segments = plan_segments(&chunks, 0, MAX_SEGMENT_SIZE).unwrap();
        let total: usize = segments.iter().map(|s| s.length).sum();
        assert_eq!(total, 626 * 7);
        assert!(segments.iter().all(|s| s.length <= MAX_SEGMENT_SIZE));
        // Two transducers fit one datagram.
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[1].logical, 1252);
        assert_eq!(segments[1].image_offset, 1252);
    }

    #[test]
    fn test_plan_segments_splits_oversized_chunk() {
        let segments = plan_segments(&[2000, 10], 0x100, 1000).unwrap();
        let lengths: Vec<usize> = segments.iter().map(|s| s.length).collect();
        assert_eq!(lengths, vec![1000, 1000, 10]);
        assert_eq!(segments[2].logical, 0x100 + 2000);
    }

    #[test]
    fn test_plan_segments_skips_empty() {
        assert!(plan_segments(&[0, 0], 0, 100).unwrap().is_empty());
        let segments = plan_segments(&[2, 0, 2], 40, 100).unwrap();
        assert_eq!(segments, vec![Segment { logical: 40, length: 4, image_offset: 0 }]);
    }

    #[test]
    fn test_plan_segments_around_frame_limit() {
        let sizes = [
            1,
            MAX_SEGMENT_SIZE - 1,
            MAX_SEGMENT_SIZE,
            MAX_SEGMENT_SIZE + 1,
            2 * MAX_SEGMENT_SIZE,
            2 * MAX_SEGMENT_SIZE + 1,
            MAX_IO_SEGMENTS * MAX_SEGMENT_SIZE,
        ];
        for size in sizes {
            for chunks in [vec![size], vec![626; (size / 626).min(2 * MAX_IO_SEGMENTS)], vec![1; size.min(5000)]] {
                let total: usize = chunks.iter().sum();
                let segments = plan_segments(&chunks, 0, MAX_SEGMENT_SIZE).unwrap();
                assert_eq!(segments.iter().map(|s| s.length).sum::<usize>(), total, "size {size}");
                assert!(segments.iter().all(|s| s.length <= MAX_SEGMENT_SIZE), "size {size}");
                let mut offset = 0;
                for seg in &segments {
                    assert_eq!(seg.image_offset, offset);
                    offset += seg.length;
                }
            }
        }

        assert_eq!(plan_segments(&[MAX_SEGMENT_SIZE], 0, MAX_SEGMENT_SIZE).unwrap().len(), 1);
        let split = plan_segments(&[MAX_SEGMENT_SIZE + 1], 0, MAX_SEGMENT_SIZE).unwrap();
        assert_eq!(split.iter().map(|s| s.length).collect::<Vec<_>>(), vec![MAX_SEGMENT_SIZE, 1]);
        assert_eq!(
            plan_segments(&[MAX_IO_SEGMENTS * MAX_SEGMENT_SIZE], 0, MAX_SEGMENT_SIZE).unwrap().len(),
            MAX_IO_SEGMENTS
        );
        assert!(matches!(
            plan_segments(&[MAX_IO_SEGMENTS * MAX_SEGMENT_SIZE + 1], 0, MAX_SEGMENT_SIZE),
            Err(EmemError::Config(_))
        ));
    }

    #[test]
    fn test_plan_segments_rejects_too_many() {
        let chunks = vec![10; MAX_IO_SEGMENTS + 1];
        assert!(matches!(plan_segments(&chunks, 0, 10), Err(EmemError::Config(_))));
    }

    #[test]
    fn test_merge_replies() {
        let a = ProcessDataReply { wkc: 2, dc_time: None };
        let b = ProcessDataReply { wkc: 3, dc_time: Some(7) };
        assert_eq!(merge_replies(Some(a), Some(b)), Some(ProcessDataReply { wkc: 5, dc_time: Some(7) }));
        assert_eq!(merge_replies(None, Some(a)), Some(a));
        assert_eq!(merge_replies(None, None), None);
    }

    #[test]
    fn test_station_addresses() {
        assert_eq!(station_address(0), 0x1001);
        assert_eq!(station_address(199), 0x10C8);
    }
}
