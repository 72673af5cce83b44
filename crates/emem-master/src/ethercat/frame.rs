//! Frame and datagram layout.
//!
//! A frame is an Ethernet header, a 2-byte EtherCAT header and one or more
//! datagrams. Each datagram carries a 10-byte header, its payload and a
//! trailing work counter incremented by every slave that processed it.

use super::types::{
    Address, Command, DATAGRAM_HEADER_SIZE, EC_HEADER_SIZE, EC_TYPE_PDU, ETHERCAT_TYPE,
    ETH_HEADER_SIZE, FIRST_DATAGRAM_OFFSET, WKC_SIZE,
};

/// Source MAC of master frames.
pub const MASTER_MAC: [u8; 6] = [0x01, 0x01, 0x01, 0x01, 0x01, 0x01];
/// Destination MAC of master frames.
pub const BROADCAST_MAC: [u8; 6] = [0xFF; 6];

const LEN_MASK: u16 = 0x07FF;
const CIRCULATING: u16 = 0x4000;
const MORE_FOLLOWS: u16 = 0x8000;

/// EtherCAT frame header: 11-bit length and 4-bit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Bytes of datagrams following the header.
    pub length: u16,
    /// Protocol type, 1 for PDU frames.
    pub frame_type: u16,
}

impl FrameHeader {
    /// Encode to wire order.
    #[must_use]
    pub fn to_bytes(self) -> [u8; EC_HEADER_SIZE] {
        ((self.length & LEN_MASK) | (self.frame_type << 12)).to_le_bytes()
    }

    /// Decode from wire order.
    #[must_use]
    pub fn from_bytes(b: [u8; EC_HEADER_SIZE]) -> Self {
        let word = u16::from_le_bytes(b);
        Self {
            length: word & LEN_MASK,
            frame_type: word >> 12,
        }
    }
}

/// Header of one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    /// Command code.
    pub command: Command,
    /// Transaction index echoed back by the slaves.
    pub index: u8,
    /// Address field.
    pub address: Address,
    /// Payload length (11 bits).
    pub length: u16,
    /// Frame has circulated once.
    pub circulating: bool,
    /// Another datagram follows in the same frame.
    pub more: bool,
    /// Event request field.
    pub irq: u16,
}

impl DatagramHeader {
    /// Header for a new single datagram.
    #[must_use]
    pub fn new(command: Command, index: u8, address: Address, length: u16) -> Self {
        Self {
            command,
            index,
            address,
            length: length & LEN_MASK,
            circulating: false,
            more: false,
            irq: 0,
        }
    }

    /// Encode to wire order.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; DATAGRAM_HEADER_SIZE] {
        let mut b = [0u8; DATAGRAM_HEADER_SIZE];
        b[0] = self.command as u8;
        b[1] = self.index;
        b[2..6].copy_from_slice(&self.address.to_wire());
        let mut dlength = self.length & LEN_MASK;
        if self.circulating {
            dlength |= CIRCULATING;
        }
        if self.more {
            dlength |= MORE_FOLLOWS;
        }
        b[6..8].copy_from_slice(&dlength.to_le_bytes());
        b[8..10].copy_from_slice(&self.irq.to_le_bytes());
        b
    }

    /// Decode from wire order. Fails on an unknown command byte.
    #[must_use]
    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < DATAGRAM_HEADER_SIZE {
            return None;
        }
        let command = Command::from_u8(b[0])?;
        let dlength = u16::from_le_bytes([b[6], b[7]]);
        Some(Self {
            command,
            index: b[1],
            address: Address::from_wire(command, [b[2], b[3], b[4], b[5]]),
            length: dlength & LEN_MASK,
            circulating: dlength & CIRCULATING != 0,
            more: dlength & MORE_FOLLOWS != 0,
            irq: u16::from_le_bytes([b[8], b[9]]),
        })
    }
}

fn write_ethernet_header(frame: &mut [u8]) {
    frame[0..6].copy_from_slice(&BROADCAST_MAC);
    frame[6..12].copy_from_slice(&MASTER_MAC);
    frame[12..14].copy_from_slice(&ETHERCAT_TYPE.to_be_bytes());
}

fn write_datagram(frame: &mut [u8], offset: usize, header: &DatagramHeader, data: &[u8]) -> usize {
    let len = usize::from(header.length);
    frame[offset..offset + DATAGRAM_HEADER_SIZE].copy_from_slice(&header.to_bytes());
    let payload = offset + DATAGRAM_HEADER_SIZE;
    let copied = data.len().min(len);
    frame[payload..payload + copied].copy_from_slice(&data[..copied]);
    frame[payload + copied..payload + len].fill(0);
    frame[payload + len..payload + len + WKC_SIZE].fill(0);
    payload
}

fn set_frame_length(frame: &mut [u8], frame_len: usize) {
    let datagram_bytes = u16::try_from(frame_len - FIRST_DATAGRAM_OFFSET).unwrap_or(LEN_MASK);
    let header = FrameHeader {
        length: datagram_bytes,
        frame_type: EC_TYPE_PDU,
    };
    frame[ETH_HEADER_SIZE..FIRST_DATAGRAM_OFFSET].copy_from_slice(&header.to_bytes());
}

/// Write a frame holding a single datagram.
///
/// The payload is `length` bytes, filled from `data` and zero-padded.
/// Returns the total frame length.
pub fn setup_datagram(
    frame: &mut [u8],
    command: Command,
    index: u8,
    address: Address,
    length: u16,
    data: &[u8],
) -> usize {
    write_ethernet_header(frame);
    let header = DatagramHeader::new(command, index, address, length);
    write_datagram(frame, FIRST_DATAGRAM_OFFSET, &header, data);
    let frame_len = FIRST_DATAGRAM_OFFSET + DATAGRAM_HEADER_SIZE + usize::from(length) + WKC_SIZE;
    set_frame_length(frame, frame_len);
    frame_len
}

/// Append a datagram to a frame of `frame_len` bytes.
///
/// Sets "more follows" on the datagram that was last so far. Returns the
/// new frame length and the offset of the appended payload.
#[allow(clippy::too_many_arguments)]
pub fn add_datagram(
    frame: &mut [u8],
    frame_len: usize,
    command: Command,
    index: u8,
    address: Address,
    length: u16,
    data: &[u8],
) -> (usize, usize) {
    if let Some(last) = last_datagram_offset(frame, frame_len) {
        let dl = last + 6;
        let dlength = u16::from_le_bytes([frame[dl], frame[dl + 1]]) | MORE_FOLLOWS;
        frame[dl..dl + 2].copy_from_slice(&dlength.to_le_bytes());
    }
    let header = DatagramHeader::new(command, index, address, length);
    let payload = write_datagram(frame, frame_len, &header, data);
    let new_len = frame_len + DATAGRAM_HEADER_SIZE + usize::from(length) + WKC_SIZE;
    set_frame_length(frame, new_len);
    (new_len, payload)
}

fn last_datagram_offset(frame: &[u8], frame_len: usize) -> Option<usize> {
    let mut offset = FIRST_DATAGRAM_OFFSET;
    let mut last = None;
    while offset + DATAGRAM_HEADER_SIZE <= frame_len {
        let dlength = u16::from_le_bytes([frame[offset + 6], frame[offset + 7]]);
        last = Some(offset);
        offset += DATAGRAM_HEADER_SIZE + usize::from(dlength & LEN_MASK) + WKC_SIZE;
    }
    last
}

/// Whether `frame` is an EtherCAT PDU frame.
#[must_use]
pub fn is_ethercat_frame(frame: &[u8]) -> bool {
    if frame.len() < FIRST_DATAGRAM_OFFSET + DATAGRAM_HEADER_SIZE {
        return false;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let header = FrameHeader::from_bytes([frame[ETH_HEADER_SIZE], frame[ETH_HEADER_SIZE + 1]]);
    ethertype == ETHERCAT_TYPE && header.frame_type == EC_TYPE_PDU
}

/// Transaction index of the first datagram.
#[must_use]
pub fn frame_index(frame: &[u8]) -> Option<u8> {
    is_ethercat_frame(frame).then(|| frame[FIRST_DATAGRAM_OFFSET + 1])
}

/// One datagram of a received frame.
#[derive(Debug, Clone, Copy)]
pub struct Datagram<'a> {
    /// Decoded header.
    pub header: DatagramHeader,
    /// Offset of the payload within the frame.
    pub payload_offset: usize,
    /// Payload bytes.
    pub payload: &'a [u8],
    /// Work counter.
    pub wkc: u16,
}

/// Iterator over the datagrams of a frame. Stops at the first truncated one.
#[derive(Debug, Clone)]
pub struct DatagramIter<'a> {
    frame: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> DatagramIter<'a> {
    /// Iterate the datagrams in `frame`.
    #[must_use]
    pub fn new(frame: &'a [u8]) -> Self {
        Self {
            frame,
            offset: FIRST_DATAGRAM_OFFSET,
            done: !is_ethercat_frame(frame),
        }
    }
}

impl<'a> Iterator for DatagramIter<'a> {
    type Item = Datagram<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let header = DatagramHeader::decode(self.frame.get(self.offset..)?);
        let Some(header) = header else {
            self.done = true;
            return None;
        };
        let payload_offset = self.offset + DATAGRAM_HEADER_SIZE;
        let wkc_offset = payload_offset + usize::from(header.length);
        let Some(wkc) = self.frame.get(wkc_offset..wkc_offset + WKC_SIZE) else {
            self.done = true;
            return None;
        };
        let item = Datagram {
            header,
            payload_offset,
            payload: &self.frame[payload_offset..wkc_offset],
            wkc: u16::from_le_bytes([wkc[0], wkc[1]]),
        };
        self.offset = wkc_offset + WKC_SIZE;
        self.done = !header.more;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethercat::types::{reg, EC_MAX_FRAME_SIZE};

    #[test]
    fn test_datagram_header_roundtrip() {
        let cases = [
            (Command::Aprd, 0u8, Address::position(3, reg::STADR), 2u16, false),
            (Command::Fpwr, 7, Address::Node { adp: 0x1002, ado: reg::AL_CTL }, 2, true),
            (Command::Bwr, 15, Address::Broadcast { ado: reg::FMMU0 }, 256, false),
            (Command::Lrd, 255, Address::Logical(0x0000_0272), 1466, true),
        ];
        for (command, index, address, length, more) in cases {
            let mut header = DatagramHeader::new(command, index, address, length);
            header.more = more;
            let decoded = DatagramHeader::decode(&header.to_bytes()).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn test_setup_single_datagram() {
        let mut frame = [0xAAu8; EC_MAX_FRAME_SIZE];
        let len = setup_datagram(
            &mut frame,
            Command::Fprd,
            3,
            Address::Node { adp: 0x1001, ado: reg::AL_STAT },
            2,
            &[],
        );
        assert_eq!(len, 14 + 2 + 10 + 2 + 2);
        assert_eq!(&frame[12..14], &[0x88, 0xA4]);
        let header = FrameHeader::from_bytes([frame[14], frame[15]]);
        assert_eq!(header.length, 14);
        assert_eq!(header.frame_type, 1);
        assert_eq!(frame_index(&frame[..len]), Some(3));
        // payload and wkc are zeroed
        assert_eq!(&frame[26..30], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_chain_sets_more_follows() {
        let mut frame = [0u8; EC_MAX_FRAME_SIZE];
        let mut len = setup_datagram(
            &mut frame,
            Command::Fprd,
            1,
            Address::Node { adp: 0x1001, ado: reg::AL_STAT },
            6,
            &[],
        );
        let mut offsets = Vec::new();
        for adp in [0x1002u16, 0x1003] {
            let (new_len, offset) = add_datagram(
                &mut frame,
                len,
                Command::Fprd,
                1,
                Address::Node { adp, ado: reg::AL_STAT },
                6,
                &[],
            );
            len = new_len;
            offsets.push(offset);
        }
        assert_eq!(len, 16 + 3 * 18);

        let datagrams: Vec<_> = DatagramIter::new(&frame[..len]).collect();
        assert_eq!(datagrams.len(), 3);
        assert!(datagrams[0].header.more);
        assert!(datagrams[1].header.more);
        assert!(!datagrams[2].header.more);
        assert_eq!(datagrams[1].payload_offset, offsets[0]);
        assert_eq!(
            datagrams[2].header.address,
            Address::Node { adp: 0x1003, ado: reg::AL_STAT }
        );
        let header = FrameHeader::from_bytes([frame[14], frame[15]]);
        assert_eq!(usize::from(header.length), 3 * 18);
    }

    #[test]
    fn test_payload_is_copied() {
        let mut frame = [0u8; EC_MAX_FRAME_SIZE];
        let len = setup_datagram(
            &mut frame,
            Command::Lwr,
            9,
            Address::Logical(0),
            4,
            &[1, 2, 3, 4],
        );
        let dg = DatagramIter::new(&frame[..len]).next().unwrap();
        assert_eq!(dg.payload, &[1, 2, 3, 4]);
        assert_eq!(dg.wkc, 0);
    }

    #[test]
    fn test_rejects_foreign_frames() {
        let mut frame = [0u8; 64];
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        assert!(!is_ethercat_frame(&frame));
        assert_eq!(frame_index(&frame), None);
        assert_eq!(DatagramIter::new(&frame).count(), 0);
        assert!(!is_ethercat_frame(&frame[..10]));
    }

    #[test]
    fn test_truncated_frame_stops_iteration() {
        let mut frame = [0u8; EC_MAX_FRAME_SIZE];
        let len = setup_datagram(&mut frame, Command::Brd, 0, Address::Broadcast { ado: 0 }, 8, &[]);
        assert_eq!(DatagramIter::new(&frame[..len - 1]).count(), 0);
    }
}
