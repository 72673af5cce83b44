//! Acceptance tests for EmemLink.
//!
//! These tests drive the full link (master, cyclic thread, health monitor)
//! against the simulated chain:
//! - Sustained cyclic exchange without work-counter errors
//! - Lost-slave detection and its one-shot report

mod acceptance;
