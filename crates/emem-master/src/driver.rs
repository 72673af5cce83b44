//! EtherCAT driver: one blocking call per addressed command, the chained
//! status poll, and the segmented logical process data transactions.

use crate::buffer::{BufState, IdxEntry};
use crate::ethercat::{
    add_datagram, reg, setup_datagram, Address, Command, DatagramIter, EC_MAX_LRW_DATA,
    MAX_FPRD_MULTI,
};
use crate::nic::Port;
use emem_common::error::{EmemError, EmemResult};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Outcome of draining one cyclic exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessDataReply {
    /// Accumulated work counter; logical writes count double.
    pub wkc: u16,
    /// Reference clock system time sampled by the first logical read.
    pub dc_time: Option<u64>,
}

/// Stages and exchanges datagrams over a [`Port`].
#[derive(Debug)]
pub struct EcDriver {
    port: Port,
}

fn payload_len(len: usize) -> EmemResult<u16> {
    if len > EC_MAX_LRW_DATA {
        return Err(EmemError::Protocol(format!(
            "datagram payload of {len} bytes exceeds {EC_MAX_LRW_DATA}"
        )));
    }
    u16::try_from(len).map_err(|_| EmemError::Protocol(format!("payload length {len}")))
}

impl EcDriver {
    /// Driver over an opened port.
    #[must_use]
    pub fn new(port: Port) -> Self {
        Self { port }
    }

    /// Adapter name.
    #[must_use]
    pub fn adapter(&self) -> &str {
        self.port.adapter()
    }

    /// Underlying port.
    pub fn port(&mut self) -> &mut Port {
        &mut self.port
    }

    fn stage(&mut self, command: Command, address: Address, len: u16, data: &[u8]) -> EmemResult<u8> {
        let idx = self.port.get_index()?;
        let slot = self.port.pool().slot_mut(idx)?;
        let (tx, tx_len) = slot.tx_mut();
        *tx_len = setup_datagram(tx, command, idx, address, len, data);
        Ok(idx)
    }

    /// Single-datagram blocking transaction. Read payloads land in `out`.
    fn transaction(
        &mut self,
        command: Command,
        address: Address,
        data: &[u8],
        out: Option<&mut [u8]>,
        timeout: Duration,
    ) -> EmemResult<u16> {
        let len = payload_len(out.as_ref().map_or(data.len(), |o| o.len()))?;
        let idx = self.stage(command, address, len, data)?;
        let result = self.port.sr_blocking(idx, timeout);
        if let (Ok(_), Some(out)) = (&result, out) {
            let rx = self.port.rx_frame(idx)?;
            if let Some(dg) = DatagramIter::new(rx).next() {
                let n = dg.payload.len().min(out.len());
                out[..n].copy_from_slice(&dg.payload[..n]);
            }
        }
        // Release even on failure; a failed send already emptied the slot.
        if self.port.pool().state(idx) != Some(BufState::Empty) {
            self.port.setup_buf_state(idx, BufState::Empty)?;
        }
        trace!(?command, ?address, wkc = ?result, "Transaction");
        result
    }

    /// Broadcast write.
    ///
    /// # Errors
    ///
    /// Transport or timeout errors.
    pub fn bwr(&mut self, ado: u16, data: &[u8], timeout: Duration) -> EmemResult<u16> {
        self.transaction(Command::Bwr, Address::Broadcast { ado }, data, None, timeout)
    }

    /// Broadcast read. The payload is the OR of every slave's register.
    ///
    /// # Errors
    ///
    /// Transport or timeout errors.
    pub fn brd(&mut self, ado: u16, out: &mut [u8], timeout: Duration) -> EmemResult<u16> {
        self.transaction(Command::Brd, Address::Broadcast { ado }, &[], Some(out), timeout)
    }

    /// Auto-increment read at zero-based chain `position`.
    ///
    /// # Errors
    ///
    /// Transport or timeout errors.
    pub fn aprd(&mut self, position: u16, ado: u16, out: &mut [u8], timeout: Duration) -> EmemResult<u16> {
        self.transaction(Command::Aprd, Address::position(position, ado), &[], Some(out), timeout)
    }

    /// Auto-increment write at zero-based chain `position`.
    ///
    /// # Errors
    ///
    /// Transport or timeout errors.
    pub fn apwr(&mut self, position: u16, ado: u16, data: &[u8], timeout: Duration) -> EmemResult<u16> {
        self.transaction(Command::Apwr, Address::position(position, ado), data, None, timeout)
    }

    /// Configured address read.
    ///
    /// # Errors
    ///
    /// Transport or timeout errors.
    pub fn fprd(&mut self, station: u16, ado: u16, out: &mut [u8], timeout: Duration) -> EmemResult<u16> {
        self.transaction(Command::Fprd, Address::Node { adp: station, ado }, &[], Some(out), timeout)
    }

    /// Configured address write.
    ///
    /// # Errors
    ///
    /// Transport or timeout errors.
    pub fn fpwr(&mut self, station: u16, ado: u16, data: &[u8], timeout: Duration) -> EmemResult<u16> {
        self.transaction(Command::Fpwr, Address::Node { adp: station, ado }, data, None, timeout)
    }

    /// Read at `station`, write the result to every other slave.
    ///
    /// # Errors
    ///
    /// Transport or timeout errors.
    pub fn frmw(&mut self, station: u16, ado: u16, out: &mut [u8], timeout: Duration) -> EmemResult<u16> {
        self.transaction(Command::Frmw, Address::Node { adp: station, ado }, &[], Some(out), timeout)
    }

    /// Broadcast write of one word.
    ///
    /// # Errors
    ///
    /// Transport or timeout errors.
    pub fn bwrw(&mut self, ado: u16, value: u16, timeout: Duration) -> EmemResult<u16> {
        self.bwr(ado, &value.to_le_bytes(), timeout)
    }

    /// Broadcast read of one word, with the work counter.
    ///
    /// # Errors
    ///
    /// Transport or timeout errors.
    pub fn brdw(&mut self, ado: u16, timeout: Duration) -> EmemResult<(u16, u16)> {
        let mut w = [0u8; 2];
        let wkc = self.brd(ado, &mut w, timeout)?;
        Ok((u16::from_le_bytes(w), wkc))
    }

    /// Auto-increment read of one word.
    ///
    /// # Errors
    ///
    /// [`EmemError::NoFrame`] if no slave answered at that position.
    pub fn aprdw(&mut self, position: u16, ado: u16, timeout: Duration) -> EmemResult<u16> {
        let mut w = [0u8; 2];
        match self.aprd(position, ado, &mut w, timeout)? {
            0 => Err(EmemError::NoFrame),
            _ => Ok(u16::from_le_bytes(w)),
        }
    }

    /// Auto-increment write of one word.
    ///
    /// # Errors
    ///
    /// Transport or timeout errors.
    pub fn apwrw(&mut self, position: u16, ado: u16, value: u16, timeout: Duration) -> EmemResult<u16> {
        self.apwr(position, ado, &value.to_le_bytes(), timeout)
    }

    /// Configured address read of one word.
    ///
    /// # Errors
    ///
    /// [`EmemError::NoFrame`] if the station did not answer.
    pub fn fprdw(&mut self, station: u16, ado: u16, timeout: Duration) -> EmemResult<u16> {
        let mut w = [0u8; 2];
        match self.fprd(station, ado, &mut w, timeout)? {
            0 => Err(EmemError::NoFrame),
            _ => Ok(u16::from_le_bytes(w)),
        }
    }

    /// Configured address write of one word.
    ///
    /// # Errors
    ///
    /// Transport or timeout errors.
    pub fn fpwrw(&mut self, station: u16, ado: u16, value: u16, timeout: Duration) -> EmemResult<u16> {
        self.fpwr(station, ado, &value.to_le_bytes(), timeout)
    }

    /// Read `len` bytes at `ado` from each station with one chained frame.
    ///
    /// Entries are `None` for stations that did not answer.
    ///
    /// # Errors
    ///
    /// A configuration error for more than [`MAX_FPRD_MULTI`] stations, or
    /// transport/timeout errors.
    pub fn fprd_multi(
        &mut self,
        stations: &[u16],
        ado: u16,
        len: usize,
        timeout: Duration,
    ) -> EmemResult<Vec<Option<Vec<u8>>>> {
        if stations.is_empty() {
            return Ok(Vec::new());
        }
        if stations.len() > MAX_FPRD_MULTI {
            return Err(EmemError::Config(format!(
                "{} stations exceed the {MAX_FPRD_MULTI} per status frame",
                stations.len()
            )));
        }
        let dlen = payload_len(len)?;
        let idx = self.port.get_index()?;
        {
            let slot = self.port.pool().slot_mut(idx)?;
            let (tx, tx_len) = slot.tx_mut();
            *tx_len = setup_datagram(tx, Command::Fprd, idx, Address::Node { adp: stations[0], ado }, dlen, &[]);
            for &adp in &stations[1..] {
                let (new_len, _) = add_datagram(tx, *tx_len, Command::Fprd, idx, Address::Node { adp, ado }, dlen, &[]);
                *tx_len = new_len;
            }
        }
        let result = self.port.sr_blocking(idx, timeout);
        let replies = match result {
            Ok(_) => {
                let rx = self.port.rx_frame(idx)?;
                let mut replies: Vec<Option<Vec<u8>>> = DatagramIter::new(rx)
                    .take(stations.len())
                    .map(|dg| (dg.wkc > 0).then(|| dg.payload.to_vec()))
                    .collect();
                replies.resize(stations.len(), None);
                Ok(replies)
            }
            Err(e) => Err(e),
        };
        if self.port.pool().state(idx) != Some(BufState::Empty) {
            self.port.setup_buf_state(idx, BufState::Empty)?;
        }
        replies
    }

    /// Send one logical write segment and queue it for the receive phase.
    ///
    /// # Errors
    ///
    /// Buffer exhaustion or transport errors.
    pub fn process_data_segment_trans_lwr(&mut self, logical: u32, data: &[u8]) -> EmemResult<()> {
        let len = payload_len(data.len())?;
        let idx = self.stage(Command::Lwr, Address::Logical(logical), len, data)?;
        self.port.send_frame(idx)?;
        self.port.idx_stack().push_index(IdxEntry {
            idx,
            command: Command::Lwr,
            image_offset: 0,
            length: 0,
            dc_offset: None,
        })
    }

    /// Send one logical read segment and queue it for the receive phase.
    ///
    /// With `dc_reference` set, an FRMW of the reference clock's system time
    /// is chained behind the read.
    ///
    /// # Errors
    ///
    /// Buffer exhaustion or transport errors.
    pub fn process_data_segment_trans_lrd(
        &mut self,
        logical: u32,
        image_offset: usize,
        length: usize,
        dc_reference: Option<u16>,
    ) -> EmemResult<()> {
        let len = payload_len(length)?;
        let idx = self.stage(Command::Lrd, Address::Logical(logical), len, &[])?;
        let dc_offset = match dc_reference {
            Some(station) => {
                let slot = self.port.pool().slot_mut(idx)?;
                let (tx, tx_len) = slot.tx_mut();
                let (new_len, offset) = add_datagram(
                    tx,
                    *tx_len,
                    Command::Frmw,
                    idx,
                    Address::Node {
                        adp: station,
                        ado: reg::DC_SYS_TIME,
                    },
                    8,
                    &[],
                );
                *tx_len = new_len;
                Some(offset)
            }
            None => None,
        };
        self.port.send_frame(idx)?;
        self.port.idx_stack().push_index(IdxEntry {
            idx,
            command: Command::Lrd,
            image_offset,
            length,
            dc_offset,
        })
    }

    /// Collect every transaction queued since the last call.
    ///
    /// Read payloads are copied into `inputs`. The stack is cleared and all
    /// slots released whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`EmemError::NoFrame`] if none of the frames came back.
    pub fn receive_process_data(&mut self, inputs: &mut [u8], timeout: Duration) -> EmemResult<ProcessDataReply> {
        let deadline = Instant::now() + timeout;
        let mut wkc: u16 = 0;
        let mut dc_time = None;
        let mut any = false;

        while let Some(entry) = self.port.idx_stack().pull_index() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.port.wait_inframe(entry.idx, remaining) {
                Ok(w) => {
                    any = true;
                    let rx = self.port.rx_frame(entry.idx)?;
                    match entry.command {
                        Command::Lwr => wkc = wkc.wrapping_add(w.wrapping_mul(2)),
                        _ => {
                            wkc = wkc.wrapping_add(w);
                            if let (Some(dg), Some(dst)) = (
                                DatagramIter::new(rx).next(),
                                inputs.get_mut(entry.image_offset..entry.image_offset + entry.length),
                            ) {
                                let n = dg.payload.len().min(dst.len());
                                dst[..n].copy_from_slice(&dg.payload[..n]);
                            }
                        }
                    }
                    if let Some(at) = entry.dc_offset {
                        dc_time = rx
                            .get(at..at + 8)
                            .and_then(|b| b.try_into().ok())
                            .map(u64::from_le_bytes);
                    }
                }
                Err(e) => debug!(idx = entry.idx, error = %e, "Process data frame missing"),
            }
            self.port.setup_buf_state(entry.idx, BufState::Empty)?;
        }
        self.port.idx_stack().clear_index();

        if any {
            Ok(ProcessDataReply { wkc, dc_time })
        } else {
            Err(EmemError::NoFrame)
        }
    }
}
