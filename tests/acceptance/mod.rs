//! End-to-end link scenarios on the simulated chain.

mod common;
mod cyclic_test;
mod lost_slave_test;
