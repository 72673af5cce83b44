//! Protocol constants, command codes, addressing and slave state flags.

use std::fmt;

/// EtherType of EtherCAT frames.
pub const ETHERCAT_TYPE: u16 = 0x88A4;
/// Ethernet header: destination, source, ethertype.
pub const ETH_HEADER_SIZE: usize = 14;
/// EtherCAT frame header (length + type).
pub const EC_HEADER_SIZE: usize = 2;
/// Datagram header: command, index, address, length, irq.
pub const DATAGRAM_HEADER_SIZE: usize = 10;
/// Work counter trailing every datagram.
pub const WKC_SIZE: usize = 2;
/// Largest Ethernet frame including the FCS.
pub const EC_MAX_FRAME_SIZE: usize = 1518;
/// Ethernet frame check sequence appended by the NIC.
pub const ETH_FCS_SIZE: usize = 4;
/// Payload room of a single logical datagram.
pub const EC_MAX_LRW_DATA: usize =
    EC_MAX_FRAME_SIZE - ETH_HEADER_SIZE - EC_HEADER_SIZE - DATAGRAM_HEADER_SIZE - WKC_SIZE - ETH_FCS_SIZE;
/// Size of the chained distributed clock datagram.
pub const EC_FIRST_DC_DATAGRAM: usize = DATAGRAM_HEADER_SIZE + 8 + WKC_SIZE;
/// Offset of the first datagram in a frame.
pub const FIRST_DATAGRAM_OFFSET: usize = ETH_HEADER_SIZE + EC_HEADER_SIZE;
/// Largest segment payload of one cyclic logical datagram.
pub const MAX_SEGMENT_SIZE: usize = EC_MAX_LRW_DATA - EC_FIRST_DC_DATAGRAM;
/// Maximum number of logical segments per image.
pub const MAX_IO_SEGMENTS: usize = 64;
/// Node status reads chained into one frame.
pub const MAX_FPRD_MULTI: usize = 64;
/// Maximum number of slaves.
pub const EC_SLAVE_MAX: usize = 200;
/// First configured station address.
pub const EC_NODE_OFFSET: u16 = 0x1000;
/// Temporary station address used during recovery.
pub const EC_TEMP_NODE: u16 = 0xFFFF;
/// EtherCAT header type for PDU frames.
pub const EC_TYPE_PDU: u16 = 1;

static_assertions::const_assert!(MAX_SEGMENT_SIZE > 0);
static_assertions::const_assert!(EC_MAX_LRW_DATA <= 0x7FF);

/// ESC register addresses.
pub mod reg {
    /// ESC type.
    pub const TYPE: u16 = 0x0000;
    /// ESC features supported.
    pub const ESC_SUP: u16 = 0x0008;
    /// Configured station address.
    pub const STADR: u16 = 0x0010;
    /// Configured station alias.
    pub const ALIAS: u16 = 0x0012;
    /// DL control.
    pub const DL_CTL: u16 = 0x0100;
    /// DL control, port loop byte.
    pub const DL_PORT: u16 = 0x0101;
    /// DL control, alias enable byte.
    pub const DL_ALIAS: u16 = 0x0103;
    /// DL status.
    pub const DL_STAT: u16 = 0x0110;
    /// AL control.
    pub const AL_CTL: u16 = 0x0120;
    /// AL status.
    pub const AL_STAT: u16 = 0x0130;
    /// AL status code.
    pub const AL_STAT_CODE: u16 = 0x0134;
    /// PDI control.
    pub const PDI_CTL: u16 = 0x0140;
    /// ECAT event mask.
    pub const IRQ_MASK: u16 = 0x0200;
    /// RX error counters.
    pub const RX_ERR: u16 = 0x0300;
    /// EEPROM configuration.
    pub const EEP_CFG: u16 = 0x0500;
    /// EEPROM control/status.
    pub const EEP_CTL: u16 = 0x0502;
    /// First FMMU record.
    pub const FMMU0: u16 = 0x0600;
    /// First sync manager record.
    pub const SM0: u16 = 0x0800;
    /// Port 0 receive time latch.
    pub const DC_TIME0: u16 = 0x0900;
    /// Port 1 receive time latch.
    pub const DC_TIME1: u16 = 0x0904;
    /// Port 2 receive time latch.
    pub const DC_TIME2: u16 = 0x0908;
    /// Port 3 receive time latch.
    pub const DC_TIME3: u16 = 0x090C;
    /// Local copy of the system time.
    pub const DC_SYS_TIME: u16 = 0x0910;
    /// Local receive time of the processing unit.
    pub const DC_SOF: u16 = 0x0918;
    /// System time offset.
    pub const DC_SYS_OFFSET: u16 = 0x0920;
    /// System time propagation delay.
    pub const DC_SYS_DELAY: u16 = 0x0928;
    /// Speed counter start.
    pub const DC_SPEED_CNT: u16 = 0x0930;
    /// System time difference filter depth.
    pub const DC_TIME_FILT: u16 = 0x0934;
    /// Cyclic unit control.
    pub const DC_CUC: u16 = 0x0980;
    /// SYNC activation.
    pub const DC_SYNC_ACT: u16 = 0x0981;
    /// SYNC0 start time.
    pub const DC_START0: u16 = 0x0990;
    /// SYNC0 cycle time.
    pub const DC_CYCLE0: u16 = 0x09A0;
    /// SYNC1 cycle time.
    pub const DC_CYCLE1: u16 = 0x09A4;
}

/// EtherCAT datagram command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// No operation.
    Nop = 0x00,
    /// Auto-increment read.
    Aprd = 0x01,
    /// Auto-increment write.
    Apwr = 0x02,
    /// Auto-increment read/write.
    Aprw = 0x03,
    /// Configured address read.
    Fprd = 0x04,
    /// Configured address write.
    Fpwr = 0x05,
    /// Configured address read/write.
    Fprw = 0x06,
    /// Broadcast read.
    Brd = 0x07,
    /// Broadcast write.
    Bwr = 0x08,
    /// Broadcast read/write.
    Brw = 0x09,
    /// Logical read.
    Lrd = 0x0A,
    /// Logical write.
    Lwr = 0x0B,
    /// Logical read/write.
    Lrw = 0x0C,
    /// Auto-increment read, multiple write.
    Armw = 0x0D,
    /// Configured read, multiple write.
    Frmw = 0x0E,
}

impl Command {
    /// Decode a command byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Nop,
            0x01 => Self::Aprd,
            0x02 => Self::Apwr,
            0x03 => Self::Aprw,
            0x04 => Self::Fprd,
            0x05 => Self::Fpwr,
            0x06 => Self::Fprw,
            0x07 => Self::Brd,
            0x08 => Self::Bwr,
            0x09 => Self::Brw,
            0x0A => Self::Lrd,
            0x0B => Self::Lwr,
            0x0C => Self::Lrw,
            0x0D => Self::Armw,
            0x0E => Self::Frmw,
            _ => return None,
        })
    }

    /// Whether the command writes slave memory.
    #[must_use]
    pub fn writes(self) -> bool {
        matches!(
            self,
            Self::Apwr | Self::Aprw | Self::Fpwr | Self::Fprw | Self::Bwr | Self::Brw | Self::Lwr | Self::Lrw
        )
    }
}

/// The four addressing modes sharing a datagram's 4-byte address field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// Auto-increment: the slave seeing `adp == 0` answers.
    Position {
        /// Position pointer, decremented relative to chain position.
        adp: u16,
        /// Register offset.
        ado: u16,
    },
    /// Configured station address.
    Node {
        /// Station address.
        adp: u16,
        /// Register offset.
        ado: u16,
    },
    /// Every slave.
    Broadcast {
        /// Register offset.
        ado: u16,
    },
    /// 32-bit logical process image address.
    Logical(u32),
}

impl Address {
    /// Position address of the slave at zero-based chain position `position`.
    #[must_use]
    pub fn position(position: u16, ado: u16) -> Self {
        Self::Position {
            adp: 0u16.wrapping_sub(position),
            ado,
        }
    }

    /// Encode the 4 wire bytes.
    #[must_use]
    pub fn to_wire(self) -> [u8; 4] {
        match self {
            Self::Position { adp, ado } | Self::Node { adp, ado } => {
                let [a0, a1] = adp.to_le_bytes();
                let [o0, o1] = ado.to_le_bytes();
                [a0, a1, o0, o1]
            }
            Self::Broadcast { ado } => {
                let [o0, o1] = ado.to_le_bytes();
                [0, 0, o0, o1]
            }
            Self::Logical(addr) => addr.to_le_bytes(),
        }
    }

    /// Decode the 4 wire bytes. The command selects the interpretation.
    #[must_use]
    pub fn from_wire(command: Command, bytes: [u8; 4]) -> Self {
        let adp = u16::from_le_bytes([bytes[0], bytes[1]]);
        let ado = u16::from_le_bytes([bytes[2], bytes[3]]);
        match command {
            Command::Aprd | Command::Apwr | Command::Aprw | Command::Armw => Self::Position { adp, ado },
            Command::Brd | Command::Bwr | Command::Brw => Self::Broadcast { ado },
            Command::Lrd | Command::Lwr | Command::Lrw => Self::Logical(u32::from_le_bytes(bytes)),
            Command::Nop | Command::Fprd | Command::Fpwr | Command::Fprw | Command::Frmw => {
                Self::Node { adp, ado }
            }
        }
    }
}

/// Application layer state of a slave.
///
/// The low nibble holds the state level, bit 4 the error (read) or
/// acknowledge (write) flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EcState(u16);

impl EcState {
    /// No valid state, slave did not answer.
    pub const NONE: Self = Self(0x00);
    /// Init.
    pub const INIT: Self = Self(0x01);
    /// Pre-operational.
    pub const PRE_OP: Self = Self(0x02);
    /// Bootstrap.
    pub const BOOT: Self = Self(0x03);
    /// Safe-operational.
    pub const SAFE_OP: Self = Self(0x04);
    /// Operational.
    pub const OPERATIONAL: Self = Self(0x08);
    /// Error indication (read) or acknowledge (write).
    pub const ERROR: Self = Self(0x10);
    /// Alias of [`EcState::ERROR`] for writes.
    pub const ACK: Self = Self(0x10);

    /// Wrap a raw AL status word, keeping the level and error bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & 0x1F)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// The state level without the error flag.
    #[must_use]
    pub const fn level(self) -> Self {
        Self(self.0 & 0x0F)
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the error flag is set.
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    /// Whether the level equals `state`'s level.
    #[must_use]
    pub const fn is(self, state: Self) -> bool {
        self.0 & 0x0F == state.0 & 0x0F
    }
}

impl std::ops::BitOr for EcState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl PartialOrd for EcState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EcState {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0 & 0x0F, self.0 & 0x10).cmp(&(other.0 & 0x0F, other.0 & 0x10))
    }
}

impl fmt::Display for EcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.0 & 0x0F {
            0x00 => "NONE",
            0x01 => "INIT",
            0x02 => "PRE_OP",
            0x03 => "BOOT",
            0x04 => "SAFE_OP",
            0x08 => "OP",
            _ => "UNKNOWN",
        };
        if self.is_error() {
            write!(f, "{level} + ERROR")
        } else {
            f.write_str(level)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(EC_MAX_LRW_DATA, 1486);
        assert_eq!(EC_FIRST_DC_DATAGRAM, 20);
        assert_eq!(MAX_SEGMENT_SIZE, 1466);
    }

    #[test]
    fn test_state_ordering() {
        let order = [
            EcState::INIT,
            EcState::PRE_OP,
            EcState::SAFE_OP,
            EcState::OPERATIONAL,
        ];
        for (i, a) in order.iter().enumerate() {
            for (j, b) in order.iter().enumerate() {
                assert_eq!(a.cmp(b), i.cmp(&j), "{a} vs {b}");
            }
        }
        assert!(EcState::NONE < EcState::INIT);
        assert!(EcState::SAFE_OP < EcState::SAFE_OP | EcState::ERROR);
        assert!(EcState::SAFE_OP | EcState::ERROR < EcState::OPERATIONAL);
    }

    #[test]
    fn test_state_flags() {
        let s = EcState::SAFE_OP | EcState::ERROR;
        assert!(s.contains(EcState::SAFE_OP));
        assert!(s.is_error());
        assert!(s.is(EcState::SAFE_OP));
        assert!(!s.is(EcState::OPERATIONAL));
        assert!(EcState::INIT.is(EcState::INIT | EcState::ACK));
        assert_eq!(s.level(), EcState::SAFE_OP);
        assert!(!EcState::OPERATIONAL.contains(EcState::SAFE_OP));
        assert_eq!(s.to_string(), "SAFE_OP + ERROR");
        assert_eq!(EcState::OPERATIONAL.to_string(), "OP");
        assert_eq!(EcState::NONE.to_string(), "NONE");
    }

    #[test]
    fn test_position_address() {
        assert_eq!(Address::position(0, 0x10).to_wire(), [0x00, 0x00, 0x10, 0x00]);
        assert_eq!(Address::position(1, 0x10).to_wire(), [0xFF, 0xFF, 0x10, 0x00]);
        assert_eq!(Address::position(2, 0x130).to_wire(), [0xFE, 0xFF, 0x30, 0x01]);
        // Wraps instead of overflowing at the end of the range.
        assert_eq!(Address::position(u16::MAX, 0).to_wire(), [0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_address_wire_modes() {
        let node = Address::Node {
            adp: 0x1001,
            ado: reg::AL_STAT,
        };
        assert_eq!(node.to_wire(), [0x01, 0x10, 0x30, 0x01]);
        assert_eq!(Address::from_wire(Command::Fprd, node.to_wire()), node);

        let logical = Address::Logical(0x0001_0203);
        assert_eq!(logical.to_wire(), [0x03, 0x02, 0x01, 0x00]);
        assert_eq!(Address::from_wire(Command::Lrd, logical.to_wire()), logical);

        let bcast = Address::Broadcast { ado: reg::TYPE };
        assert_eq!(Address::from_wire(Command::Brd, bcast.to_wire()), bcast);
    }

    #[test]
    fn test_command_codes() {
        for code in 0u8..=0x0E {
            let cmd = Command::from_u8(code).unwrap();
            assert_eq!(cmd as u8, code);
        }
        assert!(Command::from_u8(0x0F).is_none());
        assert!(Command::Lwr.writes());
        assert!(!Command::Lrd.writes());
    }
}
