//! Fixed-layout ESC configuration records.

/// Sync manager control byte for the mailbox written by the master.
pub const SM_CTRL_MBX_OUT: u8 = 0x26;
/// Sync manager control byte for the mailbox read by the master.
pub const SM_CTRL_MBX_IN: u8 = 0x22;
/// Sync manager control byte for buffered outputs.
pub const SM_CTRL_PD_OUT: u8 = 0x64;
/// Sync manager control byte for buffered inputs.
pub const SM_CTRL_PD_IN: u8 = 0x20;

/// FMMU direction: slave memory read into the frame.
pub const FMMU_TYPE_READ: u8 = 1;
/// FMMU direction: frame written into slave memory.
pub const FMMU_TYPE_WRITE: u8 = 2;

/// Role of a sync manager channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmRole {
    /// Not used.
    #[default]
    Unused,
    /// Mailbox, master to slave.
    MailboxOut,
    /// Mailbox, slave to master.
    MailboxIn,
    /// Process data outputs.
    Outputs,
    /// Process data inputs.
    Inputs,
}

/// Sync manager register block (8 bytes at `0x0800 + 8 * n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncManager {
    /// Physical start address.
    pub start_addr: u16,
    /// Length in bytes.
    pub length: u16,
    /// Control byte (mode, direction, interrupts).
    pub control: u8,
    /// Status byte, read-only on the ESC.
    pub status: u8,
    /// Activation byte, bit 0 enables the channel.
    pub activate: u8,
    /// PDI control byte.
    pub pdi_control: u8,
}

impl SyncManager {
    /// Record size on the wire.
    pub const SIZE: usize = 8;

    /// Enabled channel with the given window and control byte.
    #[must_use]
    pub fn enabled(start_addr: u16, length: u16, control: u8) -> Self {
        Self {
            start_addr,
            length,
            control,
            status: 0,
            activate: u8::from(length > 0),
            pdi_control: 0,
        }
    }

    /// Encode to the register layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let [s0, s1] = self.start_addr.to_le_bytes();
        let [l0, l1] = self.length.to_le_bytes();
        [s0, s1, l0, l1, self.control, self.status, self.activate, self.pdi_control]
    }

    /// Decode from the register layout.
    #[must_use]
    pub fn from_bytes(b: &[u8; Self::SIZE]) -> Self {
        Self {
            start_addr: u16::from_le_bytes([b[0], b[1]]),
            length: u16::from_le_bytes([b[2], b[3]]),
            control: b[4],
            status: b[5],
            activate: b[6],
            pdi_control: b[7],
        }
    }
}

/// FMMU register block (16 bytes at `0x0600 + 16 * n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fmmu {
    /// Logical start address.
    pub log_start: u32,
    /// Logical length in bytes.
    pub log_length: u16,
    /// First bit used at the logical start byte.
    pub log_start_bit: u8,
    /// Last bit used at the logical end byte.
    pub log_end_bit: u8,
    /// Physical start address.
    pub phys_start: u16,
    /// First bit at the physical start byte.
    pub phys_start_bit: u8,
    /// [`FMMU_TYPE_READ`] or [`FMMU_TYPE_WRITE`].
    pub fmmu_type: u8,
    /// Bit 0 enables the mapping.
    pub active: u8,
}

impl Fmmu {
    /// Record size on the wire.
    pub const SIZE: usize = 16;

    /// Encode to the register layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&self.log_start.to_le_bytes());
        b[4..6].copy_from_slice(&self.log_length.to_le_bytes());
        b[6] = self.log_start_bit;
        b[7] = self.log_end_bit;
        b[8..10].copy_from_slice(&self.phys_start.to_le_bytes());
        b[10] = self.phys_start_bit;
        b[11] = self.fmmu_type;
        b[12] = self.active;
        b
    }

    /// Decode from the register layout.
    #[must_use]
    pub fn from_bytes(b: &[u8; Self::SIZE]) -> Self {
        Self {
            log_start: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            log_length: u16::from_le_bytes([b[4], b[5]]),
            log_start_bit: b[6],
            log_end_bit: b[7],
            phys_start: u16::from_le_bytes([b[8], b[9]]),
            phys_start_bit: b[10],
            fmmu_type: b[11],
            active: b[12],
        }
    }

    /// Whether `[start, start + len)` of the logical space overlaps this mapping.
    #[must_use]
    pub fn overlaps(&self, start: u32, len: u32) -> bool {
        let end = start + len;
        let own_end = self.log_start + u32::from(self.log_length);
        self.active & 1 != 0 && start < own_end && self.log_start < end
    }
}

/// AL status block as read by the status poll (status, reserved, code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlStatus {
    /// AL status word.
    pub status: u16,
    /// AL status code, valid while the error flag is set.
    pub code: u16,
}

impl AlStatus {
    /// Bytes read starting at the AL status register.
    pub const SIZE: usize = 6;

    /// Decode from a 6-byte read of `0x0130..0x0136`.
    #[must_use]
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        (b.len() >= Self::SIZE).then(|| Self {
            status: u16::from_le_bytes([b[0], b[1]]),
            code: u16::from_le_bytes([b[4], b[5]]),
        })
    }
}

/// Human-readable AL status code description.
#[must_use]
pub fn al_status_code_text(code: u16) -> &'static str {
    match code {
        0x0000 => "no error",
        0x0001 => "unspecified error",
        0x0011 => "invalid requested state change",
        0x0012 => "unknown requested state",
        0x0013 => "bootstrap not supported",
        0x0016 => "invalid mailbox configuration",
        0x001A => "synchronization error",
        0x001B => "sync manager watchdog",
        0x001D => "invalid output configuration",
        0x001E => "invalid input configuration",
        0x0021 => "slave needs INIT",
        0x0022 => "slave needs PREOP",
        0x0027 => "freerun not supported",
        0x0028 => "synchronization not supported",
        0x002C => "fatal sync error",
        0x0030 => "invalid DC SYNC configuration",
        0x0035 => "invalid sync cycle time",
        _ => "unknown",
    }
}
