//! Common utilities for the acceptance tests.

use emem_common::config::LinkConfig;
use emem_link::{EmemLink, EmemLinkBuilder, SimHandle, SimulatedChain};
use std::thread;
use std::time::{Duration, Instant};

/// Route link logs to the test harness output (once per process).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Builder for a link bound to a fresh simulated chain of `count` slaves.
pub fn sim_link(count: usize, config: LinkConfig) -> (EmemLinkBuilder, SimHandle) {
    init_tracing();
    let chain = SimulatedChain::new(count);
    let handle = chain.handle();
    (EmemLink::builder(config).with_transport(Box::new(chain)), handle)
}

/// Poll `cond` every millisecond until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
