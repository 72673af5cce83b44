//! EtherCAT wire codec.
//!
//! Pure encode/decode of frame and datagram headers, the address union,
//! ESC configuration records and AL state flags. Nothing here does I/O.

pub mod frame;
pub mod records;
pub mod types;

pub use frame::{
    add_datagram, frame_index, is_ethercat_frame, setup_datagram, Datagram, DatagramHeader,
    DatagramIter, FrameHeader,
};
pub use records::{AlStatus, Fmmu, SmRole, SyncManager};
pub use types::*;
