//! Frames exchanged between the device API and the link.

/// Devices the caller expects on the chain, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    device_count: usize,
}

impl Topology {
    /// A chain of `device_count` devices.
    #[must_use]
    pub const fn new(device_count: usize) -> Self {
        Self { device_count }
    }

    /// Number of devices.
    #[must_use]
    pub const fn device_count(&self) -> usize {
        self.device_count
    }
}

/// Output payload for every device, laid out back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxDatagram {
    data: Vec<u8>,
    device_bytes: usize,
}

impl TxDatagram {
    /// Zeroed payload of `device_bytes` per device.
    #[must_use]
    pub fn new(topology: Topology, device_bytes: usize) -> Self {
        Self {
            data: vec![0; topology.device_count() * device_bytes],
            device_bytes,
        }
    }

    /// Number of devices covered.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.data.len().checked_div(self.device_bytes).unwrap_or(0)
    }

    /// Payload of device `i`.
    #[must_use]
    pub fn device(&self, i: usize) -> Option<&[u8]> {
        let start = i.checked_mul(self.device_bytes)?;
        self.data.get(start..start + self.device_bytes)
    }

    /// Mutable payload of device `i`.
    pub fn device_mut(&mut self, i: usize) -> Option<&mut [u8]> {
        let start = i.checked_mul(self.device_bytes)?;
        self.data.get_mut(start..start + self.device_bytes)
    }

    /// The whole output image.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Input bytes reported back by every device.
///
/// The first byte of each device's slice is its acknowledgement of the last
/// frame it applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxDatagram {
    data: Vec<u8>,
    device_bytes: usize,
}

impl RxDatagram {
    /// Zeroed inputs of `device_bytes` per device.
    #[must_use]
    pub fn new(topology: Topology, device_bytes: usize) -> Self {
        Self {
            data: vec![0; topology.device_count() * device_bytes],
            device_bytes,
        }
    }

    /// Inputs of device `i`.
    #[must_use]
    pub fn device(&self, i: usize) -> Option<&[u8]> {
        let start = i.checked_mul(self.device_bytes)?;
        self.data.get(start..start + self.device_bytes)
    }

    /// Acknowledgement byte of device `i`.
    #[must_use]
    pub fn ack(&self, i: usize) -> Option<u8> {
        self.device(i).and_then(|d| d.first().copied())
    }

    /// The whole input image.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn copy_from(&mut self, image: &[u8]) {
        let n = self.data.len().min(image.len());
        self.data[..n].copy_from_slice(&image[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_device_slices() {
        let mut tx = TxDatagram::new(Topology::new(3), 4);
        assert_eq!(tx.device_count(), 3);
        tx.device_mut(1).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(tx.as_bytes(), &[0, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 0]);
        assert!(tx.device(3).is_none());
    }

    #[test]
    fn test_rx_copy_and_ack() {
        let mut rx = RxDatagram::new(Topology::new(2), 2);
        rx.copy_from(&[0x10, 0xAA, 0x11, 0xBB, 0xFF]);
        assert_eq!(rx.ack(0), Some(0x10));
        assert_eq!(rx.device(1), Some(&[0x11, 0xBB][..]));
        assert_eq!(rx.ack(2), None);
    }

    #[test]
    fn test_zero_sized_devices() {
        let tx = TxDatagram::new(Topology::new(4), 0);
        assert_eq!(tx.device_count(), 0);
        assert!(tx.as_bytes().is_empty());
    }
}
