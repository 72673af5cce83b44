//! Slave health monitoring.
//!
//! A low-priority thread wakes every `state_check_interval`. When the last
//! exchange came back with a short work counter, or the previous pass left
//! something unresolved, it runs the master's error handling and reports
//! each newly lost slave once through the `on_lost` callback.

use crate::link::Shared;
use emem_common::error::{EmemError, EmemResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Callback invoked with a diagnostic message when a slave drops off.
pub type OnLost = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle to the health-check thread.
pub(crate) struct HealthMonitor {
    stop_requested: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub(crate) fn spawn(shared: Arc<Shared>, interval: Duration, on_lost: Option<OnLost>) -> EmemResult<Self> {
        let stop_requested = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stop_requested);

        let handle = thread::Builder::new()
            .name("emem-health".into())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis(), "Health monitor started");
                let mut pending = false;
                while !stop.load(Ordering::Acquire) {
                    thread::park_timeout(interval);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    if !pending && shared.wkc() >= shared.expected_wkc() {
                        continue;
                    }
                    pending = check(&shared, on_lost.as_deref());
                }
                debug!("Health monitor stopped");
            })
            .map_err(|e| EmemError::Config(format!("failed to spawn health thread: {e}")))?;

        Ok(Self {
            stop_requested,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it.
    pub(crate) fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("Health monitor thread panicked");
            }
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One error-handling pass. Returns whether another pass is needed
/// regardless of the work counter.
fn check(shared: &Shared, on_lost: Option<&(dyn Fn(&str) + Send + Sync)>) -> bool {
    let (report, lost) = {
        let mut master = shared.master();
        let report = master.error_handle();
        let lost: Vec<String> = report
            .newly_lost
            .iter()
            .map(|&i| {
                let station = master.slaves().get(i).map_or(0, |s| s.config_addr);
                format!("slave {i} (station {station:#06x}) lost: no response on the chain")
            })
            .collect();
        (report, lost)
    };

    for msg in &lost {
        warn!("{msg}");
        if let Some(callback) = on_lost {
            callback(msg);
        }
    }
    for &slave in &report.recovered {
        info!(slave, "Slave back on the chain");
    }
    !report.is_quiet()
}
