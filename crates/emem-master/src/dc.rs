//! Distributed clock topology and timing arithmetic.
//!
//! Port receive times latched by a broadcast write to `DC_TIME0` give, per
//! slave, the round trip through each of its downstream branches. From those
//! the propagation delay of every DC slave relative to the reference clock
//! follows without any further bus traffic; all functions here are pure.

use crate::slave::Slave;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

const PORT0: u8 = 1 << 0;
const PORT1: u8 = 1 << 1;
const PORT2: u8 = 1 << 2;
const PORT3: u8 = 1 << 3;

/// Seconds between the Unix epoch and 2000-01-01, the DC epoch.
pub const DC_EPOCH_OFFSET_SECS: u64 = 946_684_800;

/// Lead time before the first SYNC0 pulse.
pub const SYNC0_START_DELAY: Duration = Duration::from_millis(100);

/// Latched receive time of `port` on `slave`.
#[must_use]
pub fn port_time(slave: &Slave, port: u8) -> i64 {
    slave.port_times.get(usize::from(port)).map_or(0, |&t| i64::from(t))
}

/// Port the frame left through before coming back in on `port`.
///
/// Frames circulate 0 → 3 → 1 → 2 → 0, skipping ports without link.
#[must_use]
pub fn prev_port(slave: &Slave, port: u8) -> u8 {
    let active = slave.active_ports;
    let order: [u8; 3] = match port {
        0 => [2, 1, 3],
        1 => [3, 0, 2],
        2 => [1, 3, 0],
        3 => [0, 2, 1],
        _ => return port,
    };
    order
        .into_iter()
        .find(|&p| active & (1 << p) != 0)
        .unwrap_or(port)
}

/// Claim the next unattributed port of `parent` for a child branch.
pub fn parent_port(parent: &mut Slave) -> u8 {
    let consumed = parent.consumed_ports;
    [(PORT3, 3), (PORT1, 1), (PORT2, 2), (PORT0, 0)]
        .into_iter()
        .find(|&(mask, _)| consumed & mask != 0)
        .map_or(0, |(mask, port)| {
            parent.consumed_ports &= !mask;
            port
        })
}

/// Port with the earliest receive time, i.e. where the frame came in.
pub fn entry_port(slave: &mut Slave) -> u8 {
    let mut entry = 0u8;
    let mut best: Option<i64> = None;
    for port in [0u8, 3, 1, 2] {
        if slave.active_ports & (1 << port) == 0 {
            continue;
        }
        let t = port_time(slave, port);
        if best.map_or(true, |b| t < b) {
            best = Some(t);
            entry = port;
        }
    }
    slave.consumed_ports &= !(1 << entry);
    entry
}

/// Compute entry ports, DC parents and propagation delays.
///
/// `port_times`, `active_ports`, `consumed_ports`, `parent` and `has_dc`
/// must be filled in. Returns the index of the reference clock, the first
/// DC capable slave.
pub fn compute_propagation_delays(slaves: &mut [Slave]) -> Option<usize> {
    let mut reference = None;
    let mut parent_hold: Option<usize> = None;

    for i in 0..slaves.len() {
        if !slaves[i].has_dc {
            slaves[i].port_times = [0; 4];
            slaves[i].delay = 0;
            slaves[i].dc_parent = None;
            if let Some(p) = slaves[i].parent {
                if slaves[p].topology > 2 {
                    parent_hold = Some(p);
                }
            }
            // A branch without DC slaves still uses a port of its junction.
            if let (Some(hold), 1) = (parent_hold, slaves[i].topology) {
                parent_port(&mut slaves[hold]);
                parent_hold = None;
            }
            continue;
        }

        reference.get_or_insert(i);
        let entry = entry_port(&mut slaves[i]);
        slaves[i].entry_port = entry;

        let mut child = i;
        let mut dc_parent = slaves[i].parent;
        while let Some(p) = dc_parent {
            if slaves[p].has_dc {
                break;
            }
            child = p;
            dc_parent = slaves[p].parent;
        }
        slaves[i].dc_parent = dc_parent;

        let Some(parent) = dc_parent else {
            slaves[i].delay = 0;
            continue;
        };

        let mut pport = parent_port(&mut slaves[parent]);
        if slaves[parent].topology == 1 {
            pport = slaves[parent].entry_port;
        }
        slaves[i].parent_port = pport;

        let p = &slaves[parent];
        let dt3 = port_time(p, pport) - port_time(p, prev_port(p, pport));
        let mut dt1 = 0;
        if slaves[i].topology > 1 {
            let s = &slaves[i];
            dt1 = port_time(s, prev_port(s, entry)) - port_time(s, entry);
        }
        if dt1 > dt3 {
            dt1 = -dt1;
        }
        let mut dt2 = 0;
        if child - parent > 1 {
            dt2 = (port_time(p, prev_port(p, pport)) - port_time(p, p.entry_port)).abs();
        }
        let delay = (dt3 - dt1) / 2 + dt2 + i64::from(p.delay);
        slaves[i].delay = i32::try_from(delay).unwrap_or(i32::MAX);
        debug!(slave = i, parent, delay_ns = slaves[i].delay, "Propagation delay");
    }
    reference
}

/// Nanoseconds since 2000-01-01 on the host clock.
#[must_use]
pub fn master_time_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.saturating_sub(Duration::from_secs(DC_EPOCH_OFFSET_SECS)))
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

/// Offset aligning a slave's local start-of-frame time with master time.
#[must_use]
pub fn system_time_offset(master_time: u64, local_sof: u64) -> u64 {
    master_time.wrapping_sub(local_sof)
}

/// First SYNC0 pulse: a whole number of cycles, at least
/// [`SYNC0_START_DELAY`] after `local_time`, plus `shift`.
#[must_use]
pub fn sync0_start_time(local_time: u64, cycle_ns: u64, shift_ns: i64) -> u64 {
    let lead = u64::try_from(SYNC0_START_DELAY.as_nanos()).unwrap_or(u64::MAX);
    let base = local_time.wrapping_add(lead);
    let aligned = if cycle_ns == 0 {
        base
    } else {
        (base / cycle_ns) * cycle_ns + cycle_ns
    };
    aligned.wrapping_add_signed(shift_ns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::find_parent;

    fn dc_slave(dl_ports: u8, topology: u8, times: [u32; 4]) -> Slave {
        Slave {
            active_ports: dl_ports,
            consumed_ports: dl_ports,
            topology,
            port_times: times,
            has_dc: true,
            ..Slave::default()
        }
    }

    fn link(slaves: &mut [Slave]) {
        for i in 0..slaves.len() {
            let parent = find_parent(slaves, i);
            slaves[i].parent = parent;
        }
    }

    #[test]
    fn test_prev_port_order() {
        let s = dc_slave(PORT0 | PORT1, 2, [0; 4]);
        assert_eq!(prev_port(&s, 0), 1);
        assert_eq!(prev_port(&s, 1), 0);
        let all = dc_slave(0x0F, 4, [0; 4]);
        assert_eq!(prev_port(&all, 0), 2);
        assert_eq!(prev_port(&all, 3), 0);
        let lone = dc_slave(PORT0, 1, [0; 4]);
        assert_eq!(prev_port(&lone, 0), 0);
    }

    #[test]
    fn test_parent_port_consumes() {
        let mut s = dc_slave(0x0F, 4, [0; 4]);
        assert_eq!(parent_port(&mut s), 3);
        assert_eq!(parent_port(&mut s), 1);
        assert_eq!(parent_port(&mut s), 2);
        assert_eq!(parent_port(&mut s), 0);
        assert_eq!(s.consumed_ports, 0);
        assert_eq!(parent_port(&mut s), 0);
    }

    #[test]
    fn test_entry_port_is_earliest() {
        let mut s = dc_slave(PORT0 | PORT1, 2, [500, 400, 0, 0]);
        assert_eq!(entry_port(&mut s), 1);
        assert_eq!(s.consumed_ports, PORT0);
    }

    #[test]
    fn test_three_slave_line_delays() {
        let mut slaves = vec![
            dc_slave(PORT0 | PORT1, 2, [1000, 1100, 0, 0]),
            dc_slave(PORT0 | PORT1, 2, [1020, 1080, 0, 0]),
            dc_slave(PORT0, 1, [1050, 0, 0, 0]),
        ];
        link(&mut slaves);

        assert_eq!(compute_propagation_delays(&mut slaves), Some(0));
        // Half of each hop's round trip, accumulated down the line.
        assert_eq!(slaves[0].delay, 0);
        assert_eq!(slaves[1].delay, (100 - 60) / 2);
        assert_eq!(slaves[2].delay, 60 / 2 + 20);
        assert_eq!(slaves[2].dc_parent, Some(1));
    }

    #[test]
    fn test_non_dc_slave_is_skipped() {
        let mut slaves = vec![
            dc_slave(PORT0 | PORT1, 2, [1000, 1100, 0, 0]),
            Slave {
                has_dc: false,
                ..dc_slave(PORT0 | PORT1, 2, [1020, 1080, 0, 0])
            },
            dc_slave(PORT0, 1, [1050, 0, 0, 0]),
        ];
        link(&mut slaves);

        compute_propagation_delays(&mut slaves);
        assert_eq!(slaves[1].delay, 0);
        assert_eq!(slaves[1].port_times, [0; 4]);
        // Slave 2 measures against slave 0 across the non-DC hop.
        assert_eq!(slaves[2].dc_parent, Some(0));
        assert!(slaves[2].delay > 0);
    }

    #[test]
    fn test_no_dc_slaves() {
        let mut slaves = vec![Slave::default(), Slave::default()];
        assert_eq!(compute_propagation_delays(&mut slaves), None);
    }

    #[test]
    fn test_sync0_start_time() {
        let cycle = 1_000_000;
        let start = sync0_start_time(5_250_000, cycle, 0);
        assert_eq!(start % cycle, 0);
        assert!(start >= 5_250_000 + 100_000_000);
        assert!(start <= 5_250_000 + 100_000_000 + cycle);
        assert_eq!(sync0_start_time(5_250_000, cycle, 300), start + 300);
    }

    #[test]
    fn test_system_time_offset() {
        assert_eq!(system_time_offset(10_000, 4_000), 6_000);
        assert!(master_time_ns() > 0);
    }
}
