//! Frame buffer ring and the per-cycle index stack.
//!
//! Each in-flight transaction owns one slot of the ring. The slot index is
//! also the datagram index byte, which is how replies find their slot.

use crate::ethercat::{Command, EC_MAX_FRAME_SIZE};
use emem_common::error::{EmemError, EmemResult};
use std::fmt;

/// Number of frame buffers in the ring.
pub const EC_MAX_BUF: usize = 16;

/// Life cycle of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufState {
    /// Free.
    #[default]
    Empty,
    /// Reserved, frame being staged.
    Alloc,
    /// Sent, awaiting the reply.
    Tx,
    /// Reply arrived while another transaction was waiting; not yet claimed.
    Received,
    /// Reply claimed by its transaction.
    Complete,
}

impl fmt::Display for BufState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Empty => "EMPTY",
            Self::Alloc => "ALLOC",
            Self::Tx => "TX",
            Self::Received => "RCVD",
            Self::Complete => "COMPLETE",
        };
        f.write_str(s)
    }
}

impl BufState {
    fn can_move_to(self, next: Self) -> bool {
        use BufState::{Alloc, Complete, Empty, Received, Tx};
        matches!(
            (self, next),
            (_, Empty)
                | (Empty, Alloc)
                | (Alloc | Tx, Tx)
                | (Tx, Received | Complete)
                | (Received, Complete)
        )
    }
}

/// One transmit/receive buffer pair.
pub struct FrameBuffer {
    tx: Box<[u8; EC_MAX_FRAME_SIZE]>,
    tx_len: usize,
    rx: Box<[u8; EC_MAX_FRAME_SIZE]>,
    rx_len: usize,
    state: BufState,
}

impl FrameBuffer {
    fn new() -> Self {
        Self {
            tx: Box::new([0; EC_MAX_FRAME_SIZE]),
            tx_len: 0,
            rx: Box::new([0; EC_MAX_FRAME_SIZE]),
            rx_len: 0,
            state: BufState::Empty,
        }
    }

    /// Staged frame bytes.
    #[must_use]
    pub fn tx(&self) -> &[u8] {
        &self.tx[..self.tx_len]
    }

    /// Full transmit area for staging, with its current length.
    pub fn tx_mut(&mut self) -> (&mut [u8; EC_MAX_FRAME_SIZE], &mut usize) {
        (&mut self.tx, &mut self.tx_len)
    }

    /// Received frame bytes.
    #[must_use]
    pub fn rx(&self) -> &[u8] {
        &self.rx[..self.rx_len]
    }

    /// Store a received frame, truncating to the buffer size.
    pub fn store_rx(&mut self, frame: &[u8]) {
        let len = frame.len().min(EC_MAX_FRAME_SIZE);
        self.rx[..len].copy_from_slice(&frame[..len]);
        self.rx_len = len;
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BufState {
        self.state
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("state", &self.state)
            .field("tx_len", &self.tx_len)
            .field("rx_len", &self.rx_len)
            .finish()
    }
}

/// Fixed ring of frame buffers addressed by their one-byte index.
#[derive(Debug)]
pub struct BufferPool {
    slots: Vec<FrameBuffer>,
    last_index: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    /// Create a ring of [`EC_MAX_BUF`] empty buffers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..EC_MAX_BUF).map(|_| FrameBuffer::new()).collect(),
            last_index: EC_MAX_BUF - 1,
        }
    }

    /// Reserve the next Empty slot after the last issued one.
    ///
    /// # Errors
    ///
    /// Returns [`EmemError::BuffersExhausted`] when every slot is in flight.
    pub fn get_index(&mut self) -> EmemResult<u8> {
        let n = self.slots.len();
        for step in 1..=n {
            let idx = (self.last_index + step) % n;
            if self.slots[idx].state == BufState::Empty {
                self.slots[idx].state = BufState::Alloc;
                self.slots[idx].tx_len = 0;
                self.last_index = idx;
                #[allow(clippy::cast_possible_truncation)]
                return Ok(idx as u8);
            }
        }
        Err(EmemError::BuffersExhausted(n))
    }

    /// Move slot `idx` to `state`.
    ///
    /// # Errors
    ///
    /// Returns [`EmemError::InvalidBufferTransition`] for an illegal move,
    /// including an Alloc of a slot that is not Empty.
    pub fn setup_buf_state(&mut self, idx: u8, state: BufState) -> EmemResult<()> {
        let slot = self.slot_mut(idx)?;
        if !slot.state.can_move_to(state) {
            return Err(EmemError::InvalidBufferTransition {
                index: idx,
                from: slot.state.to_string(),
                to: state.to_string(),
            });
        }
        slot.state = state;
        if state == BufState::Empty {
            slot.rx_len = 0;
        }
        Ok(())
    }

    /// State of slot `idx`, `None` if out of range.
    #[must_use]
    pub fn state(&self, idx: u8) -> Option<BufState> {
        self.slots.get(usize::from(idx)).map(|s| s.state)
    }

    /// Borrow slot `idx`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an index outside the ring.
    pub fn slot(&self, idx: u8) -> EmemResult<&FrameBuffer> {
        self.slots
            .get(usize::from(idx))
            .ok_or_else(|| EmemError::Protocol(format!("buffer index {idx} out of range")))
    }

    /// Mutably borrow slot `idx`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an index outside the ring.
    pub fn slot_mut(&mut self, idx: u8) -> EmemResult<&mut FrameBuffer> {
        self.slots
            .get_mut(usize::from(idx))
            .ok_or_else(|| EmemError::Protocol(format!("buffer index {idx} out of range")))
    }

    /// Number of slots not Empty.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.state != BufState::Empty).count()
    }
}

/// Where the payload of a cyclic transaction goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdxEntry {
    /// Buffer index.
    pub idx: u8,
    /// Logical command carried by the frame.
    pub command: Command,
    /// Destination offset in the input image.
    pub image_offset: usize,
    /// Payload bytes to copy into the input image.
    pub length: usize,
    /// Payload offset of the chained DC datagram within the frame.
    pub dc_offset: Option<usize>,
}

/// FIFO of the transactions issued by one cyclic send.
#[derive(Debug, Default)]
pub struct IdxStack {
    entries: Vec<IdxEntry>,
    pulled: usize,
}

impl IdxStack {
    /// Empty stack with room for a full ring.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(EC_MAX_BUF),
            pulled: 0,
        }
    }

    /// Record an outstanding transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EmemError::BuffersExhausted`] once a ring's worth is pending.
    pub fn push_index(&mut self, entry: IdxEntry) -> EmemResult<()> {
        if self.entries.len() >= EC_MAX_BUF {
            return Err(EmemError::BuffersExhausted(EC_MAX_BUF));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Next transaction in issue order.
    pub fn pull_index(&mut self) -> Option<IdxEntry> {
        let entry = self.entries.get(self.pulled).copied()?;
        self.pulled += 1;
        Some(entry)
    }

    /// Forget every entry.
    pub fn clear_index(&mut self) {
        self.entries.clear();
        self.pulled = 0;
    }

    /// Entries pushed this cycle.
    #[must_use]
    pub fn pushed(&self) -> usize {
        self.entries.len()
    }

    /// Entries not yet pulled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.len() - self.pulled
    }
}
