//! Master behaviour against the simulated chain.

use emem_common::config::SlaveProfile;
use emem_common::error::{EmemError, EmemResult};
use emem_master::ethercat::{reg, Address, Command, DatagramIter, EC_TEMP_NODE, MAX_IO_SEGMENTS, MAX_SEGMENT_SIZE};
use emem_master::sim::SIM_HOP_DELAY_NS;
use emem_master::{
    EcDriver, EcState, FrameTransport, Master, MasterSettings, Port, SimHandle, SimulatedChain, Slave, StateTarget,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn master(count: usize) -> (Master, SimHandle) {
    let chain = SimulatedChain::new(count);
    let handle = chain.handle();
    let master = Master::new(Port::new(Box::new(chain)), MasterSettings::default());
    (master, handle)
}

fn operational(count: usize) -> (Master, SimHandle) {
    let (mut m, h) = master(count);
    m.initialize().unwrap();
    m.config().unwrap();
    m.config_dc().unwrap();
    m.request_operational(Duration::from_secs(1)).unwrap();
    (m, h)
}

/// Simulated chain whose adapter refuses frames addressed to the temporary node.
struct RejectTempNode {
    chain: SimulatedChain,
    reject: Arc<AtomicBool>,
}

impl FrameTransport for RejectTempNode {
    fn send(&mut self, frame: &[u8]) -> EmemResult<()> {
        let to_temp = DatagramIter::new(frame).any(|dg| {
            dg.header.command == Command::Fpwr
                && matches!(dg.header.address, Address::Node { adp: EC_TEMP_NODE, .. })
        });
        if to_temp && self.reject.load(Ordering::SeqCst) {
            return Err(EmemError::SendFailed("adapter down".into()));
        }
        self.chain.send(frame)
    }

    fn read(&mut self, buf: &mut [u8]) -> EmemResult<usize> {
        self.chain.read(buf)
    }

    fn name(&self) -> &str {
        "reject-temp-node"
    }
}

fn cycle(m: &mut Master) -> u16 {
    m.send_process_data().unwrap();
    m.receive_process_data(Duration::from_millis(10)).unwrap().wkc
}

#[test]
fn test_initialize_assigns_distinct_addresses() {
    let (mut m, h) = master(4);
    assert_eq!(m.initialize().unwrap(), 4);

    let addrs: Vec<u16> = m.slaves().iter().map(|s| s.config_addr).collect();
    assert_eq!(addrs, vec![0x1001, 0x1002, 0x1003, 0x1004]);
    for (i, &a) in addrs.iter().enumerate() {
        assert_eq!(h.station(i), Some(a));
        assert_eq!(h.al_state(i), Some(EcState::PRE_OP));
    }
    assert_eq!(m.slaves()[0].parent, None);
    assert_eq!(m.slaves()[3].parent, Some(2));
    assert!(m.slaves().iter().all(|s| s.has_dc));

    // Same chain, same addresses.
    assert_eq!(m.initialize().unwrap(), 4);
    let again: Vec<u16> = m.slaves().iter().map(|s| s.config_addr).collect();
    assert_eq!(again, addrs);
}

#[test]
fn test_initialize_empty_chain() {
    let (mut m, _h) = master(0);
    assert_eq!(m.initialize(), Err(EmemError::NoSlaves));
}

#[test]
fn test_config_maps_outputs_then_inputs() {
    let (mut m, h) = master(3);
    m.initialize().unwrap();
    let size = m.config().unwrap();
    assert_eq!(size, 3 * (626 + 2));
    assert_eq!(m.outputs().len(), 3 * 626);
    assert_eq!(m.inputs().len(), 3 * 2);
    assert_eq!(m.expected_wkc(), 3 * 2 + 3);

    let out_total: usize = m.output_segments().iter().map(|s| s.length).sum();
    let in_total: usize = m.input_segments().iter().map(|s| s.length).sum();
    assert_eq!(out_total, m.outputs().len());
    assert_eq!(in_total, m.inputs().len());
    assert!(m
        .output_segments()
        .iter()
        .chain(m.input_segments())
        .all(|s| s.length <= MAX_SEGMENT_SIZE));
    // Inputs start right after the outputs in logical space.
    assert_eq!(m.input_segments()[0].logical, 3 * 626);

    assert_eq!(m.slaves()[1].output_offset, 626);
    assert_eq!(m.slaves()[2].input_offset, 4);
    assert_eq!(h.al_state(2), Some(EcState::SAFE_OP));
}

#[test]
fn test_pre_safe_hook_runs_per_slave() {
    let (mut m, _h) = master(2);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    m.set_pre_safe_hook(Arc::new(move |driver: &mut EcDriver, slave: &Slave| -> EmemResult<()> {
        seen.fetch_add(1, Ordering::SeqCst);
        driver.fpwrw(slave.config_addr, reg::DC_CYCLE1, 0, Duration::from_millis(2))?;
        Ok(())
    }));
    m.initialize().unwrap();
    m.config().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_config_dc_measures_line_delays() {
    let (mut m, _h) = master(3);
    m.initialize().unwrap();
    m.config().unwrap();
    assert!(m.config_dc().unwrap());
    assert_eq!(m.dc_reference(), Some(0));
    let delays: Vec<i32> = m.slaves().iter().map(|s| s.delay).collect();
    let hop = i32::try_from(SIM_HOP_DELAY_NS).unwrap();
    assert_eq!(delays, vec![0, hop, 2 * hop]);
}

#[test]
fn test_config_dc_without_dc_slaves() {
    let chain = SimulatedChain::with_dc(&[false, false]);
    let mut m = Master::new(Port::new(Box::new(chain)), MasterSettings::default());
    m.initialize().unwrap();
    m.config().unwrap();
    assert!(!m.config_dc().unwrap());
    assert_eq!(m.dc_reference(), None);
}

#[test]
fn test_sync0_programs_start_and_cycle() {
    let (mut m, h) = master(1);
    m.initialize().unwrap();
    m.config().unwrap();
    m.config_dc().unwrap();
    m.config_sync0(Duration::from_millis(1), 0).unwrap();
    assert_eq!(h.peek(0, reg::DC_SYNC_ACT, 1), vec![0x03]);
    assert_eq!(h.peek(0, reg::DC_CYCLE0, 4), 1_000_000u32.to_le_bytes().to_vec());
    let start = u64::from_le_bytes(h.peek(0, reg::DC_START0, 8).try_into().unwrap());
    assert_eq!(start % 1_000_000, 0);
}

#[test]
fn test_cycles_meet_expected_wkc_and_loop_back() {
    let (mut m, _h) = operational(2);
    let input_offset = m.slaves()[1].input_offset;
    let output_offset = m.slaves()[1].output_offset;
    m.outputs_mut()[output_offset..output_offset + 2].copy_from_slice(&[0xAB, 0xCD]);

    for _ in 0..20 {
        assert!(cycle(&mut m) >= m.expected_wkc());
    }
    assert_eq!(&m.inputs()[input_offset..input_offset + 2], &[0xAB, 0xCD]);
    assert!(m.dc_time() > 0);
}

#[test]
fn test_reordered_replies_still_complete() {
    let (mut m, h) = operational(2);
    h.set_reorder(true);
    for _ in 0..5 {
        assert_eq!(cycle(&mut m), m.expected_wkc());
    }
}

#[test]
fn test_error_handle_acknowledges_safe_op_error() {
    let (mut m, h) = operational(2);
    h.inject_safe_op_error(1, 0x001B);

    let report = m.error_handle();
    assert!(report.messages.iter().any(|msg| msg.contains("SAFE_OP + ERROR")));
    assert_eq!(h.al_state(1), Some(EcState::SAFE_OP));
    assert_eq!(m.slaves()[1].al_status_code, 0x001B);

    m.error_handle();
    assert_eq!(h.al_state(1), Some(EcState::OPERATIONAL));
    assert!(m.error_handle().is_quiet());
}

#[test]
fn test_lost_slave_reported_once_and_found() {
    let (mut m, h) = operational(3);
    h.mute(2, true);
    assert!(cycle(&mut m) < m.expected_wkc());

    let first = m.error_handle();
    assert_eq!(first.newly_lost, vec![2]);
    let second = m.error_handle();
    assert!(second.newly_lost.is_empty());
    assert!(m.slaves()[2].is_lost);

    h.mute(2, false);
    let back = m.error_handle();
    assert_eq!(back.recovered, vec![2]);
    assert!(!m.slaves()[2].is_lost);
}

#[test]
fn test_power_cycled_slave_is_recovered_and_reconfigured() {
    let (mut m, h) = operational(2);
    h.power_cycle(1);
    assert_eq!(h.station(1), Some(0));

    let report = m.error_handle();
    assert_eq!(report.newly_lost, vec![1]);
    assert_eq!(report.recovered, vec![1]);
    assert_eq!(h.station(1), Some(0x1002));

    // Init -> SafeOp on the next pass, Operational on the one after.
    m.error_handle();
    assert_eq!(h.al_state(1), Some(EcState::SAFE_OP));
    m.error_handle();
    assert_eq!(h.al_state(1), Some(EcState::OPERATIONAL));
    assert!(cycle(&mut m) >= m.expected_wkc());
}

#[test]
fn test_recover_slave_rejects_foreign_address() {
    let (mut m, h) = operational(2);
    h.poke(1, reg::STADR, &0x2222u16.to_le_bytes());
    assert_eq!(
        m.recover_slave(1, Duration::from_millis(2)),
        Err(EmemError::WrongSlave { slave: 1, found: 0x2222 })
    );
}

#[test]
fn test_state_check_single_slave() {
    let (mut m, _h) = master(2);
    m.initialize().unwrap();
    m.write_state(StateTarget::Slave(1), EcState::INIT).unwrap();
    let s = m
        .state_check(StateTarget::Slave(1), EcState::INIT, Duration::from_millis(20))
        .unwrap();
    assert_eq!(s, EcState::INIT);
    assert_eq!(m.read_state().unwrap(), EcState::INIT);
    assert_eq!(m.group_status().lowest_state, EcState::INIT);
}

#[test]
fn test_small_profile() {
    let chain = SimulatedChain::new(2);
    let settings = MasterSettings {
        profile: SlaveProfile::with_sizes(4, 4),
        ..MasterSettings::default()
    };
    let mut m = Master::new(Port::new(Box::new(chain)), settings);
    m.initialize().unwrap();
    assert_eq!(m.config().unwrap(), 16);
    assert_eq!(m.output_segments().len(), 1);
}

#[test]
fn test_close_requests_init() {
    let (mut m, h) = operational(2);
    m.close().unwrap();
    assert_eq!(h.al_state(0), Some(EcState::INIT));
}

#[test]
fn test_muted_slave_is_not_recovered() {
    let (mut m, h) = operational(2);
    h.power_cycle(1);
    h.mute(1, true);
    assert_eq!(
        m.recover_slave(1, Duration::from_millis(2)),
        Err(EmemError::NotRecovered(1))
    );
    assert_eq!(h.station(1), Some(0));

    let report = m.error_handle();
    assert_eq!(report.newly_lost, vec![1]);
    assert!(report.recovered.is_empty());

    h.mute(1, false);
    m.recover_slave(1, Duration::from_millis(2)).unwrap();
    assert_eq!(h.station(1), Some(0x1002));
}

#[test]
fn test_recover_slave_reports_temporary_address_failure() {
    let chain = SimulatedChain::new(2);
    let h = chain.handle();
    let reject = Arc::new(AtomicBool::new(false));
    let transport = RejectTempNode {
        chain,
        reject: Arc::clone(&reject),
    };
    let mut m = Master::new(Port::new(Box::new(transport)), MasterSettings::default());
    m.initialize().unwrap();
    m.config().unwrap();
    m.config_dc().unwrap();
    m.request_operational(Duration::from_secs(1)).unwrap();

    h.power_cycle(1);
    reject.store(true, Ordering::SeqCst);
    assert!(matches!(
        m.recover_slave(1, Duration::from_millis(2)),
        Err(EmemError::SendFailed(_))
    ));
    assert_eq!(h.station(1), Some(0));

    reject.store(false, Ordering::SeqCst);
    m.recover_slave(1, Duration::from_millis(2)).unwrap();
    assert_eq!(h.station(1), Some(0x1002));
}

#[test]
fn test_config_rejects_image_beyond_segment_table() {
    // 1000 output bytes per board: no two boards share a datagram.
    let chain = SimulatedChain::new(MAX_IO_SEGMENTS + 1);
    let settings = MasterSettings {
        profile: SlaveProfile::with_sizes(1000, 2),
        ..MasterSettings::default()
    };
    let mut m = Master::new(Port::new(Box::new(chain)), settings);
    assert_eq!(m.initialize().unwrap(), MAX_IO_SEGMENTS + 1);
    assert!(matches!(m.config(), Err(EmemError::Config(_))));
}
