//! Per-slave bookkeeping and chain topology.

use crate::driver::EcDriver;
use crate::ethercat::{EcState, Fmmu, SmRole, SyncManager};
use emem_common::error::EmemResult;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Callback run on each slave between PreOp and SafeOp.
///
/// Typically issues extra register writes the device needs before it will
/// accept SafeOp.
pub type PreSafeHook = Arc<dyn Fn(&mut EcDriver, &Slave) -> EmemResult<()> + Send + Sync>;

/// Everything the master knows about one slave.
#[derive(Clone, Default)]
pub struct Slave {
    /// Configured station address.
    pub config_addr: u16,
    /// Alias address read back from the ESC.
    pub alias_addr: u16,
    /// Last observed AL state.
    pub state: EcState,
    /// Last AL status code.
    pub al_status_code: u16,
    /// Mailbox write offset and length (SM0).
    pub mbx_wo: u16,
    /// Mailbox write length.
    pub mbx_l: u16,
    /// Mailbox read offset (SM1).
    pub mbx_ro: u16,
    /// Mailbox read length.
    pub mbx_rl: u16,
    /// Sync manager records.
    pub sm: [SyncManager; 4],
    /// Sync manager roles.
    pub sm_role: [SmRole; 4],
    /// FMMU records.
    pub fmmu: [Fmmu; 4],
    /// First FMMU not yet programmed.
    pub fmmu_unused: usize,
    /// Output size in bits.
    pub output_bits: u32,
    /// Output size in bytes.
    pub output_bytes: usize,
    /// Input size in bits.
    pub input_bits: u32,
    /// Input size in bytes.
    pub input_bytes: usize,
    /// Offset of this slave's outputs in the output image.
    pub output_offset: usize,
    /// Offset of this slave's inputs in the input image.
    pub input_offset: usize,
    /// Number of ports with an established link.
    pub topology: u8,
    /// Mask of ports with an established link.
    pub active_ports: u8,
    /// Active ports not yet attributed to a parent or child.
    pub consumed_ports: u8,
    /// Upstream neighbour, `None` when directly attached to the master.
    pub parent: Option<usize>,
    /// Port the frame enters through.
    pub entry_port: u8,
    /// Port of the parent this slave hangs off.
    pub parent_port: u8,
    /// Latched receive times of ports 0..=3.
    pub port_times: [u32; 4],
    /// Propagation delay from the reference clock in ns.
    pub delay: i32,
    /// Distributed clock support.
    pub has_dc: bool,
    /// Nearest DC-capable ancestor.
    pub dc_parent: Option<usize>,
    /// Set while the slave does not answer.
    pub is_lost: bool,
    /// Optional hook before SafeOp.
    pub pre_safe_hook: Option<PreSafeHook>,
}

impl fmt::Debug for Slave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slave")
            .field("config_addr", &format_args!("{:#06x}", self.config_addr))
            .field("state", &self.state)
            .field("output_bytes", &self.output_bytes)
            .field("input_bytes", &self.input_bytes)
            .field("parent", &self.parent)
            .field("delay", &self.delay)
            .field("has_dc", &self.has_dc)
            .field("is_lost", &self.is_lost)
            .field("pre_safe_hook", &self.pre_safe_hook.is_some())
            .finish_non_exhaustive()
    }
}

impl Slave {
    /// Apply a DL status word: active port mask and link count.
    pub fn apply_dl_status(&mut self, dl_status: u16) {
        let (active, links) = decode_dl_status(dl_status);
        self.active_ports = active;
        self.consumed_ports = active;
        self.topology = links;
    }

    /// Summary for display.
    #[must_use]
    pub fn info(&self, position: usize) -> SlaveInfo {
        SlaveInfo {
            position,
            config_addr: self.config_addr,
            alias_addr: self.alias_addr,
            state: self.state.to_string(),
            output_bytes: self.output_bytes,
            input_bytes: self.input_bytes,
            parent: self.parent,
            has_dc: self.has_dc,
            delay_ns: self.delay,
            is_lost: self.is_lost,
        }
    }
}

/// Serializable slave snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlaveInfo {
    /// Chain position.
    pub position: usize,
    /// Configured station address.
    pub config_addr: u16,
    /// Alias address.
    pub alias_addr: u16,
    /// AL state as text.
    pub state: String,
    /// Output bytes.
    pub output_bytes: usize,
    /// Input bytes.
    pub input_bytes: usize,
    /// Parent position.
    pub parent: Option<usize>,
    /// DC capable.
    pub has_dc: bool,
    /// Propagation delay.
    pub delay_ns: i32,
    /// Currently lost.
    pub is_lost: bool,
}

/// Decode the DL status register into (active port mask, link count).
///
/// A port counts as active when its link is up and its loop is open.
#[must_use]
pub fn decode_dl_status(dl_status: u16) -> (u8, u8) {
    let mut active = 0u8;
    let mut links = 0u8;
    for port in 0..4u8 {
        let shift = 8 + 2 * port;
        if (dl_status >> shift) & 0x3 == 0x2 {
            active |= 1 << port;
            links += 1;
        }
    }
    (active, links)
}

/// Find the upstream neighbour of slave `index` from the link counts of the
/// slaves before it.
///
/// A slave with one link is an end of branch, three links open a branch and
/// four links open two. Slave 0 hangs off the master.
#[must_use]
pub fn find_parent(slaves: &[Slave], index: usize) -> Option<usize> {
    let mut open: i32 = 0;
    for candidate in (0..index).rev() {
        match slaves[candidate].topology {
            1 => open -= 1,
            3 => open += 1,
            4 => open += 2,
            _ => {}
        }
        if (open >= 0 && slaves[candidate].topology > 1) || candidate == 0 {
            return Some(candidate);
        }
    }
    None
}
