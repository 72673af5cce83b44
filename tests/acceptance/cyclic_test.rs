//! Sustained cyclic exchange.
//!
//! # Acceptance Criteria
//!
//! - A two-board chain opens and reports both boards
//! - 100 send/receive rounds complete while the cyclic thread keeps pace
//! - No work-counter errors or lost frames are recorded

use super::common::{sim_link, wait_for};
use emem_common::config::LinkConfig;
use emem_link::Topology;
use std::thread;
use std::time::Duration;

#[test]
fn test_hundred_cycles_without_errors() {
    let (builder, _handle) = sim_link(2, LinkConfig::default());
    let mut link = builder.build().unwrap();
    assert_eq!(link.open(&Topology::new(2)).unwrap(), 2);

    let mut tx = link.tx_datagram();
    let mut rx = link.rx_datagram();
    for k in 0..100u8 {
        tx.device_mut(0).unwrap()[0] = k;
        tx.device_mut(1).unwrap()[0] = k.wrapping_add(1);
        link.send(&tx).unwrap();
        thread::sleep(Duration::from_micros(500));
        link.receive(&mut rx).unwrap();
    }

    assert!(wait_for(Duration::from_secs(2), || link.stats().total_cycles >= 100));
    assert!(wait_for(Duration::from_secs(1), || {
        link.receive(&mut rx).unwrap();
        rx.ack(0) == Some(99) && rx.ack(1) == Some(100)
    }));

    link.close().unwrap();
    let stats = link.stats();
    assert!(stats.total_cycles >= 100);
    assert_eq!(stats.wkc_error_count, 0);
    assert_eq!(stats.lost_frame_count, 0);
}
