//! EtherCAT master for chains of ultrasound transducer slaves.
//!
//! Layers, bottom up:
//! - [`ethercat`]: frame and datagram codec, register map, ESC records
//! - [`transport`]: raw Ethernet frame I/O ([`transport::FrameTransport`])
//! - [`buffer`] and [`nic`]: the in-flight frame ring and reply routing
//! - [`driver`]: one call per EtherCAT command plus the cyclic logical exchange
//! - [`master`]: discovery, state machine, mapping, distributed clocks, recovery
//! - [`sim`]: a simulated slave chain (feature `simulated`)

pub mod buffer;
pub mod dc;
pub mod driver;
pub mod ethercat;
pub mod master;
pub mod nic;
#[cfg(feature = "simulated")]
pub mod sim;
pub mod slave;
pub mod transport;

pub use driver::{EcDriver, ProcessDataReply};
pub use ethercat::EcState;
pub use master::{GroupStatus, HealthReport, Master, MasterSettings, Segment, StateTarget};
pub use nic::Port;
#[cfg(feature = "simulated")]
pub use sim::{SimHandle, SimulatedChain};
pub use slave::{PreSafeHook, Slave, SlaveInfo};
pub use transport::{list_adapters, open_adapter, Adapter, FrameTransport};
