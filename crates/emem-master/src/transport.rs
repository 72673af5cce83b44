//! Raw frame transport.
//!
//! The master only needs to push one Ethernet frame out and pull one back in.
//! [`FrameTransport`] is that seam; [`RawSocket`] implements it with a Linux
//! packet socket, `PcapTransport` (feature `pcap`) with libpcap, and the
//! simulator with an in-process ESC chain.

use emem_common::error::{EmemError, EmemResult};

/// Sends and receives single raw Ethernet frames on one adapter.
pub trait FrameTransport: Send {
    /// Transmit one frame.
    ///
    /// # Errors
    ///
    /// Returns [`EmemError::SendFailed`] if the frame could not be queued.
    fn send(&mut self, frame: &[u8]) -> EmemResult<()>;

    /// Copy one pending frame into `buf` and return its length.
    ///
    /// # Errors
    ///
    /// Returns [`EmemError::NoFrame`] when nothing is pending.
    fn read(&mut self, buf: &mut [u8]) -> EmemResult<usize>;

    /// Release the adapter.
    ///
    /// # Errors
    ///
    /// Backend specific.
    fn close(&mut self) -> EmemResult<()> {
        Ok(())
    }

    /// Adapter name, for logging.
    fn name(&self) -> &str;
}

/// A network adapter that can carry EtherCAT frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adapter {
    /// Interface name passed to [`open_adapter`].
    pub name: String,
    /// Description, when the backend provides one.
    pub description: String,
}

/// List adapters usable for EtherCAT, loopback excluded.
///
/// # Errors
///
/// Returns an error if the OS refuses to enumerate interfaces.
pub fn list_adapters() -> EmemResult<Vec<Adapter>> {
    #[cfg(feature = "pcap")]
    {
        pcap_transport::list_adapters()
    }
    #[cfg(all(not(feature = "pcap"), unix))]
    {
        use nix::net::if_::InterfaceFlags;

        let addrs = nix::ifaddrs::getifaddrs().map_err(|e| EmemError::Io(e.to_string()))?;
        let mut adapters: Vec<Adapter> = Vec::new();
        for ifa in addrs {
            if ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
                continue;
            }
            if adapters.iter().any(|a| a.name == ifa.interface_name) {
                continue;
            }
            let state = if ifa.flags.contains(InterfaceFlags::IFF_UP) {
                "up"
            } else {
                "down"
            };
            adapters.push(Adapter {
                description: format!("{} ({state})", ifa.interface_name),
                name: ifa.interface_name,
            });
        }
        Ok(adapters)
    }
    #[cfg(all(not(feature = "pcap"), not(unix)))]
    {
        Err(EmemError::Config(
            "adapter listing needs the `pcap` feature on this platform".into(),
        ))
    }
}

/// Open the named adapter with the best backend for this build.
///
/// # Errors
///
/// Returns [`EmemError::AdapterOpen`] if the adapter cannot be opened.
pub fn open_adapter(name: &str) -> EmemResult<Box<dyn FrameTransport>> {
    #[cfg(feature = "pcap")]
    {
        Ok(Box::new(pcap_transport::PcapTransport::open(name)?))
    }
    #[cfg(all(not(feature = "pcap"), target_os = "linux"))]
    {
        Ok(Box::new(RawSocket::open(name)?))
    }
    #[cfg(all(not(feature = "pcap"), not(target_os = "linux")))]
    {
        Err(EmemError::AdapterOpen {
            adapter: name.into(),
            reason: "raw sockets need Linux or the `pcap` feature".into(),
        })
    }
}

/// Minimum Ethernet frame length without FCS.
const ETH_MIN_FRAME: usize = 60;

#[cfg(target_os = "linux")]
pub use raw_socket::RawSocket;

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
mod raw_socket {
    use super::{FrameTransport, ETH_MIN_FRAME};
    use crate::ethercat::ETHERCAT_TYPE;
    use emem_common::error::{EmemError, EmemResult};
    use std::io;
    use tracing::{debug, info};

    /// `struct ifreq` with the request union kept as raw bytes.
    #[repr(C)]
    struct IfReq {
        name: [libc::c_char; libc::IF_NAMESIZE],
        data: [u8; 24],
    }

    impl IfReq {
        fn new(interface: &str) -> io::Result<Self> {
            let bytes = interface.as_bytes();
            if bytes.is_empty() || bytes.len() >= libc::IF_NAMESIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "invalid interface name",
                ));
            }
            let mut req = Self {
                name: [0; libc::IF_NAMESIZE],
                data: [0; 24],
            };
            for (dst, &src) in req.name.iter_mut().zip(bytes) {
                #[allow(clippy::cast_possible_wrap)]
                {
                    *dst = src as libc::c_char;
                }
            }
            Ok(req)
        }

        fn int(&self) -> libc::c_int {
            libc::c_int::from_ne_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
        }

        fn short(&self) -> libc::c_short {
            libc::c_short::from_ne_bytes([self.data[0], self.data[1]])
        }

        fn set_short(&mut self, value: libc::c_short) {
            self.data[..2].copy_from_slice(&value.to_ne_bytes());
        }
    }

    /// Interface ioctl on an [`IfReq`]; the request constant's type differs between libcs.
    macro_rules! ifreq_ioctl {
        ($fd:expr, $req:expr, $request:expr) => {{
            let req: &mut IfReq = $req;
            // SAFETY: `req` is a properly sized, initialized ifreq for the duration of the call.
            let res = unsafe { libc::ioctl($fd, $request, std::ptr::from_mut(req)) };
            if res == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }};
    }

    /// Non-blocking `AF_PACKET` socket bound to one interface and the EtherCAT ethertype.
    #[derive(Debug)]
    pub struct RawSocket {
        fd: libc::c_int,
        name: String,
        scratch: Vec<u8>,
    }

    impl RawSocket {
        /// Open `interface` in promiscuous mode.
        ///
        /// # Errors
        ///
        /// Returns [`EmemError::AdapterOpen`] if the socket cannot be created or bound,
        /// typically for lack of `CAP_NET_RAW`.
        pub fn open(interface: &str) -> EmemResult<Self> {
            Self::open_inner(interface).map_err(|e| EmemError::AdapterOpen {
                adapter: interface.into(),
                reason: e.to_string(),
            })
        }

        fn open_inner(interface: &str) -> io::Result<Self> {
            let protocol = ETHERCAT_TYPE.to_be();
            // SAFETY: plain syscall with constant arguments.
            let fd = unsafe {
                libc::socket(
                    libc::AF_PACKET,
                    libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    libc::c_int::from(protocol),
                )
            };
            if fd == -1 {
                return Err(io::Error::last_os_error());
            }
            // Owns the fd from here on so early returns close it.
            let socket = Self {
                fd,
                name: interface.into(),
                scratch: vec![0; 2048],
            };

            let mut req = IfReq::new(interface)?;
            ifreq_ioctl!(fd, &mut req, libc::SIOCGIFINDEX)?;
            let ifindex = req.int();

            let mut req = IfReq::new(interface)?;
            ifreq_ioctl!(fd, &mut req, libc::SIOCGIFFLAGS)?;
            #[allow(clippy::cast_possible_truncation)]
            let flags = req.short() | (libc::IFF_PROMISC | libc::IFF_BROADCAST) as libc::c_short;
            req.set_short(flags);
            ifreq_ioctl!(fd, &mut req, libc::SIOCSIFFLAGS)?;

            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let family = libc::AF_PACKET as u16;
            let addr = libc::sockaddr_ll {
                sll_family: family,
                sll_protocol: protocol,
                sll_ifindex: ifindex,
                sll_hatype: 0,
                sll_pkttype: 0,
                sll_halen: 0,
                sll_addr: [0; 8],
            };
            // SAFETY: `addr` is a valid sockaddr_ll and the length matches its size.
            let res = unsafe {
                libc::bind(
                    fd,
                    std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                    socklen::<libc::sockaddr_ll>(),
                )
            };
            if res == -1 {
                return Err(io::Error::last_os_error());
            }

            info!(interface, ifindex, "Raw socket opened");
            Ok(socket)
        }
    }

    fn socklen<T>() -> libc::socklen_t {
        libc::socklen_t::try_from(std::mem::size_of::<T>()).unwrap_or(libc::socklen_t::MAX)
    }

    impl FrameTransport for RawSocket {
        fn send(&mut self, frame: &[u8]) -> EmemResult<()> {
            let data = if frame.len() < ETH_MIN_FRAME {
                self.scratch[..frame.len()].copy_from_slice(frame);
                self.scratch[frame.len()..ETH_MIN_FRAME].fill(0);
                &self.scratch[..ETH_MIN_FRAME]
            } else {
                frame
            };
            // SAFETY: `data` is a valid readable slice for its length.
            let sent = unsafe { libc::send(self.fd, data.as_ptr().cast(), data.len(), 0) };
            if usize::try_from(sent).ok() == Some(data.len()) {
                Ok(())
            } else {
                Err(EmemError::SendFailed(io::Error::last_os_error().to_string()))
            }
        }

        fn read(&mut self, buf: &mut [u8]) -> EmemResult<usize> {
            loop {
                // SAFETY: zeroed sockaddr_ll is a valid out-parameter.
                let mut from: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
                let mut from_len = socklen::<libc::sockaddr_ll>();
                // SAFETY: `buf` is writable for its length; `from` outlives the call.
                let len = unsafe {
                    libc::recvfrom(
                        self.fd,
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                        0,
                        std::ptr::from_mut(&mut from).cast::<libc::sockaddr>(),
                        &mut from_len,
                    )
                };
                if len < 0 {
                    let err = io::Error::last_os_error();
                    return match err.kind() {
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                            Err(EmemError::NoFrame)
                        }
                        _ => Err(EmemError::Io(err.to_string())),
                    };
                }
                // Our own transmissions are looped back to packet sockets.
                if from.sll_pkttype == libc::PACKET_OUTGOING {
                    continue;
                }
                return Ok(usize::try_from(len).unwrap_or(0));
            }
        }

        fn close(&mut self) -> EmemResult<()> {
            debug!(interface = %self.name, "Raw socket closed");
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    impl Drop for RawSocket {
        fn drop(&mut self) {
            // SAFETY: the fd is owned by this value and closed exactly once.
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(feature = "pcap")]
pub use pcap_transport::PcapTransport;

#[cfg(feature = "pcap")]
mod pcap_transport {
    //! libpcap backend.

    use super::{Adapter, FrameTransport};
    use emem_common::error::{EmemError, EmemResult};
    use tracing::info;

    /// Adapter opened through libpcap in immediate, non-blocking mode.
    pub struct PcapTransport {
        capture: pcap::Capture<pcap::Active>,
        name: String,
    }

    impl PcapTransport {
        /// Open `interface` in promiscuous mode.
        ///
        /// # Errors
        ///
        /// Returns [`EmemError::AdapterOpen`] if libpcap refuses the device.
        pub fn open(interface: &str) -> EmemResult<Self> {
            let open_err = |e: pcap::Error| EmemError::AdapterOpen {
                adapter: interface.into(),
                reason: e.to_string(),
            };
            let capture = pcap::Capture::from_device(interface)
                .map_err(open_err)?
                .promisc(true)
                .immediate_mode(true)
                .snaplen(2048)
                .timeout(1)
                .open()
                .map_err(open_err)?
                .setnonblock()
                .map_err(open_err)?;
            info!(interface, "pcap adapter opened");
            Ok(Self {
                capture,
                name: interface.into(),
            })
        }
    }

    impl FrameTransport for PcapTransport {
        fn send(&mut self, frame: &[u8]) -> EmemResult<()> {
            self.capture
                .sendpacket(frame)
                .map_err(|e| EmemError::SendFailed(e.to_string()))
        }

        fn read(&mut self, buf: &mut [u8]) -> EmemResult<usize> {
            match self.capture.next_packet() {
                Ok(packet) => {
                    let len = packet.data.len().min(buf.len());
                    buf[..len].copy_from_slice(&packet.data[..len]);
                    Ok(len)
                }
                Err(pcap::Error::TimeoutExpired | pcap::Error::NoMorePackets) => {
                    Err(EmemError::NoFrame)
                }
                Err(e) => Err(EmemError::Io(e.to_string())),
            }
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    pub(super) fn list_adapters() -> EmemResult<Vec<Adapter>> {
        let devices = pcap::Device::list().map_err(|e| EmemError::Io(e.to_string()))?;
        Ok(devices
            .into_iter()
            .filter(|d| !d.flags.is_loopback())
            .map(|d| Adapter {
                description: d.desc.clone().unwrap_or_else(|| d.name.clone()),
                name: d.name,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_rejects_bad_name() {
        let err = RawSocket::open("this-name-is-far-too-long-for-ifnamsiz").unwrap_err();
        assert!(matches!(err, EmemError::AdapterOpen { .. }));
    }

    #[cfg(all(unix, not(feature = "pcap")))]
    #[test]
    fn test_list_adapters_skips_loopback() {
        let adapters = list_adapters().unwrap();
        assert!(adapters.iter().all(|a| a.name != "lo"));
    }
}
