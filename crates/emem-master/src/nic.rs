//! Network driver: buffer slots, transmission and reply demultiplexing.

use crate::buffer::{BufState, BufferPool, IdxStack};
use crate::ethercat::{frame_index, DatagramIter, EC_MAX_FRAME_SIZE};
use crate::transport::FrameTransport;
use emem_common::error::{EmemError, EmemResult};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Per-attempt receive timeout used by blocking transactions.
pub const EC_TIMEOUT_RET: Duration = Duration::from_millis(2);

/// Transport, buffer ring and index stack of one network port.
pub struct Port {
    transport: Box<dyn FrameTransport>,
    pool: BufferPool,
    idx_stack: IdxStack,
    scratch: Box<[u8; EC_MAX_FRAME_SIZE]>,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("adapter", &self.transport.name())
            .field("pool", &self.pool)
            .field("idx_stack", &self.idx_stack)
            .finish_non_exhaustive()
    }
}

impl Port {
    /// Wrap an opened transport.
    #[must_use]
    pub fn new(transport: Box<dyn FrameTransport>) -> Self {
        Self {
            transport,
            pool: BufferPool::new(),
            idx_stack: IdxStack::new(),
            scratch: Box::new([0; EC_MAX_FRAME_SIZE]),
        }
    }

    /// Adapter name.
    #[must_use]
    pub fn adapter(&self) -> &str {
        self.transport.name()
    }

    /// Buffer ring.
    pub fn pool(&mut self) -> &mut BufferPool {
        &mut self.pool
    }

    /// Outstanding cyclic transactions.
    pub fn idx_stack(&mut self) -> &mut IdxStack {
        &mut self.idx_stack
    }

    /// Reserve a buffer slot.
    ///
    /// # Errors
    ///
    /// Returns [`EmemError::BuffersExhausted`] if every slot is in flight.
    pub fn get_index(&mut self) -> EmemResult<u8> {
        self.pool.get_index()
    }

    /// Transition a buffer slot.
    ///
    /// # Errors
    ///
    /// Returns an error for an illegal transition.
    pub fn setup_buf_state(&mut self, idx: u8, state: BufState) -> EmemResult<()> {
        self.pool.setup_buf_state(idx, state)
    }

    /// Transmit the staged frame of slot `idx`.
    ///
    /// # Errors
    ///
    /// On transport failure the slot is released and [`EmemError::SendFailed`] returned.
    pub fn send_frame(&mut self, idx: u8) -> EmemResult<()> {
        self.pool.setup_buf_state(idx, BufState::Tx)?;
        let slot = self.pool.slot(idx)?;
        if let Err(e) = self.transport.send(slot.tx()) {
            warn!(idx, error = %e, "Frame transmission failed");
            self.pool.setup_buf_state(idx, BufState::Empty)?;
            return Err(e);
        }
        Ok(())
    }

    /// Read one frame from the wire and route it.
    ///
    /// Returns the first datagram's work counter when the frame answers `idx`.
    ///
    /// # Errors
    ///
    /// [`EmemError::NoFrame`] if nothing was pending, [`EmemError::UnknownFrame`]
    /// if the frame belonged to another slot (it is stashed there) or to nobody.
    pub fn receive_frame(&mut self, idx: u8) -> EmemResult<u16> {
        let len = self.transport.read(&mut self.scratch[..])?;
        let frame = &self.scratch[..len];

        let Some(rx_idx) = frame_index(frame) else {
            trace!(len, "Ignoring non-EtherCAT frame");
            return Err(EmemError::UnknownFrame);
        };

        if rx_idx == idx {
            let wkc = first_wkc(frame);
            let slot = self.pool.slot_mut(idx)?;
            slot.store_rx(frame);
            self.pool.setup_buf_state(idx, BufState::Complete)?;
            return Ok(wkc);
        }

        if self.pool.state(rx_idx) == Some(BufState::Tx) {
            self.pool.slot_mut(rx_idx)?.store_rx(frame);
            self.pool.setup_buf_state(rx_idx, BufState::Received)?;
            trace!(awaited = idx, received = rx_idx, "Stashed out-of-order reply");
        } else {
            trace!(rx_idx, "Dropped reply for idle buffer");
        }
        Err(EmemError::UnknownFrame)
    }

    /// Wait up to `timeout` for the reply to slot `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`EmemError::NoFrame`] on timeout.
    pub fn wait_inframe(&mut self, idx: u8, timeout: Duration) -> EmemResult<u16> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pool.state(idx) == Some(BufState::Received) {
                self.pool.setup_buf_state(idx, BufState::Complete)?;
                return Ok(first_wkc(self.pool.slot(idx)?.rx()));
            }
            match self.receive_frame(idx) {
                Ok(wkc) => return Ok(wkc),
                Err(EmemError::NoFrame | EmemError::UnknownFrame) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(EmemError::NoFrame);
            }
            std::hint::spin_loop();
        }
    }

    /// Send slot `idx` and wait for its reply, resending until `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`EmemError::NoFrame`] if no reply came back in time, or the
    /// transport error of the last send.
    pub fn sr_blocking(&mut self, idx: u8, timeout: Duration) -> EmemResult<u16> {
        let deadline = Instant::now() + timeout;
        loop {
            self.send_frame(idx)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.min(EC_TIMEOUT_RET).max(Duration::from_micros(100));
            match self.wait_inframe(idx, wait) {
                Ok(wkc) => return Ok(wkc),
                Err(EmemError::NoFrame) if Instant::now() < deadline => {
                    trace!(idx, "Retrying transaction");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Received frame of slot `idx`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for an index outside the ring.
    pub fn rx_frame(&self, idx: u8) -> EmemResult<&[u8]> {
        Ok(self.pool.slot(idx)?.rx())
    }

    /// Close the transport.
    ///
    /// # Errors
    ///
    /// Propagates the transport's close error.
    pub fn close(&mut self) -> EmemResult<()> {
        self.transport.close()
    }
}

fn first_wkc(frame: &[u8]) -> u16 {
    DatagramIter::new(frame).next().map_or(0, |d| d.wkc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethercat::{setup_datagram, Address, Command};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replies to queued frames with a fixed work counter, optionally reversed.
    #[derive(Default)]
    struct Loopback {
        queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
        reverse: bool,
        drop_first: usize,
        sent: usize,
    }

    impl FrameTransport for Loopback {
        fn send(&mut self, frame: &[u8]) -> EmemResult<()> {
            self.sent += 1;
            if self.sent <= self.drop_first {
                return Ok(());
            }
            let mut reply = frame.to_vec();
            let wkc_at = reply.len() - 2;
            reply[wkc_at..].copy_from_slice(&1u16.to_le_bytes());
            let mut q = self.queue.lock().unwrap();
            if self.reverse {
                q.push_front(reply);
            } else {
                q.push_back(reply);
            }
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> EmemResult<usize> {
            let frame = self.queue.lock().unwrap().pop_front().ok_or(EmemError::NoFrame)?;
            buf[..frame.len()].copy_from_slice(&frame);
            Ok(frame.len())
        }

        fn name(&self) -> &str {
            "loopback"
        }
    }

    struct Broken;

    impl FrameTransport for Broken {
        fn send(&mut self, _frame: &[u8]) -> EmemResult<()> {
            Err(EmemError::SendFailed("link down".into()))
        }

        fn read(&mut self, _buf: &mut [u8]) -> EmemResult<usize> {
            Err(EmemError::NoFrame)
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    fn stage(port: &mut Port, marker: u8) -> u8 {
        let idx = port.get_index().unwrap();
        let slot = port.pool().slot_mut(idx).unwrap();
        let (tx, len) = slot.tx_mut();
        *len = setup_datagram(
            tx,
            Command::Brd,
            idx,
            Address::Broadcast { ado: 0 },
            1,
            &[marker],
        );
        idx
    }

    #[test]
    fn test_sr_blocking_completes() {
        let mut port = Port::new(Box::new(Loopback::default()));
        let idx = stage(&mut port, 0x42);
        assert_eq!(port.sr_blocking(idx, Duration::from_millis(10)).unwrap(), 1);
        assert_eq!(port.pool().state(idx), Some(BufState::Complete));
        let dg = DatagramIter::new(port.rx_frame(idx).unwrap()).next().unwrap();
        assert_eq!(dg.payload, &[0x42]);
    }

    #[test]
    fn test_sr_blocking_retries_lost_frame() {
        let transport = Loopback {
            drop_first: 1,
            ..Loopback::default()
        };
        let mut port = Port::new(Box::new(transport));
        let idx = stage(&mut port, 1);
        assert_eq!(port.sr_blocking(idx, Duration::from_millis(50)).unwrap(), 1);
    }

    #[test]
    fn test_out_of_order_replies_are_stashed() {
        let transport = Loopback {
            reverse: true,
            ..Loopback::default()
        };
        let mut port = Port::new(Box::new(transport));
        let first = stage(&mut port, 0xA1);
        let second = stage(&mut port, 0xB2);
        port.send_frame(first).unwrap();
        port.send_frame(second).unwrap();

        // The reply to `second` arrives first and is parked in its own slot.
        assert_eq!(port.wait_inframe(first, Duration::from_millis(10)).unwrap(), 1);
        assert_eq!(port.pool().state(second), Some(BufState::Received));

        assert_eq!(port.wait_inframe(second, Duration::from_millis(10)).unwrap(), 1);
        assert_eq!(port.pool().state(second), Some(BufState::Complete));
        let dg = DatagramIter::new(port.rx_frame(second).unwrap()).next().unwrap();
        assert_eq!(dg.payload, &[0xB2]);
    }

    #[test]
    fn test_wait_times_out() {
        let mut port = Port::new(Box::new(Loopback {
            drop_first: usize::MAX,
            ..Loopback::default()
        }));
        let idx = stage(&mut port, 0);
        let err = port.sr_blocking(idx, Duration::from_millis(5)).unwrap_err();
        assert_eq!(err, EmemError::NoFrame);
    }

    #[test]
    fn test_send_failure_releases_slot() {
        let mut port = Port::new(Box::new(Broken));
        let idx = stage(&mut port, 0);
        assert!(matches!(port.send_frame(idx), Err(EmemError::SendFailed(_))));
        assert_eq!(port.pool().state(idx), Some(BufState::Empty));
    }
}
