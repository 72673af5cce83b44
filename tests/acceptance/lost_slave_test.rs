//! Lost-slave detection.
//!
//! # Acceptance Criteria
//!
//! - A board that stops answering is reported within two check intervals
//! - The report is delivered exactly once per loss

use super::common::{sim_link, wait_for};
use emem_common::config::LinkConfig;
use emem_link::Topology;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[test]
fn test_muted_slave_reported_once() {
    let config = LinkConfig {
        state_check_interval: CHECK_INTERVAL,
        ..LinkConfig::default()
    };
    let reports = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&reports);

    let (builder, handle) = sim_link(2, config);
    let mut link = builder
        .on_lost(move |msg| sink.lock().unwrap().push(msg.to_string()))
        .build()
        .unwrap();
    link.open(&Topology::new(2)).unwrap();

    handle.mute(1, true);
    assert!(
        wait_for(CHECK_INTERVAL * 2, || !reports.lock().unwrap().is_empty()),
        "lost slave was not reported"
    );

    thread::sleep(CHECK_INTERVAL * 3);
    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("slave 1"));
    drop(reports);

    link.close().unwrap();
}
