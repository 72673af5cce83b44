#![doc = "EtherCAT link adapter for EmemLink: cyclic exchange, timers, and health monitoring."]

pub mod datagram;
pub mod health;
pub mod link;
pub mod realtime;
pub mod timer;

pub use datagram::{RxDatagram, Topology, TxDatagram};
pub use health::OnLost;
pub use link::{EmemLink, EmemLinkBuilder};
pub use realtime::{init_realtime, RealtimeStatus};
pub use timer::{wait_until, CycleTimer};

#[cfg(feature = "simulated")]
pub use emem_master::{SimHandle, SimulatedChain};
