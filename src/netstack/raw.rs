//! Raw-socket transport.
//!
//! Opens `AF_INET/SOCK_RAW/IPPROTO_TCP` with `IP_HDRINCL`: the kernel
//! delivers whole IPv4 datagrams on receive and transmits our marshalled
//! IPv4 headers verbatim on send. The fd is non-blocking so the reader
//! task can drive it through tokio's readiness facility.
//!
//! [`PacketSink`] is the seam between the state machine and the wire;
//! tests substitute [`RecordingSink`] for the real socket.

use std::ffi::CStr;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Mutex;

use super::StackError;

/// Largest datagram the reader pulls off the socket in one go.
pub const RECV_BUFFER_SIZE: usize = 65535;

/// Destination for finalized IPv4 packets (checksums already filled).
pub trait PacketSink: Send + Sync {
    fn send_packet(&self, packet: &[u8]) -> io::Result<()>;
}

/// Read the destination address out of a marshalled IPv4 header.
pub fn packet_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

/// A raw IPv4 socket with `IP_HDRINCL` set, non-blocking.
pub struct RawSocket {
    fd: RawFd,
}

impl RawSocket {
    /// Open the socket. Requires `CAP_NET_RAW`.
    pub fn open() -> Result<Self, StackError> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_TCP) };
        if fd < 0 {
            return Err(StackError::SocketCreation(io::Error::last_os_error()));
        }
        let sock = Self { fd };

        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(StackError::SocketOption(io::Error::last_os_error()));
        }

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(StackError::SocketOption(io::Error::last_os_error()));
        }

        Ok(sock)
    }

    /// Receive one datagram. Returns `WouldBlock` when drained.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Retrieve and clear the pending socket error, if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

// SAFETY: RawSocket owns a single file descriptor; no interior mutability.
unsafe impl Send for RawSocket {}
unsafe impl Sync for RawSocket {}

impl PacketSink for RawSocket {
    /// Send a complete IPv4 packet; the destination is read from the
    /// header's destination field, as with `IP_HDRINCL` the kernel routes
    /// on the sockaddr we hand it.
    fn send_packet(&self, packet: &[u8]) -> io::Result<()> {
        let dst = packet_destination(packet).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("packet too short for IPv4 header: {} bytes", packet.len()),
            )
        })?;

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(dst.octets()),
            },
            sin_zero: [0; 8],
        };

        let ret = unsafe {
            libc::sendto(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Look up the first IPv4 address assigned to a named interface.
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr, StackError> {
    let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut addrs) } != 0 {
        return Err(StackError::InterfaceLookup(io::Error::last_os_error()));
    }

    let mut found = None;
    let mut cur = addrs;
    while !cur.is_null() {
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;
        if ifa.ifa_addr.is_null() {
            continue;
        }
        let family = unsafe { (*ifa.ifa_addr).sa_family };
        if family != libc::AF_INET as libc::sa_family_t {
            continue;
        }
        let ifname = unsafe { CStr::from_ptr(ifa.ifa_name) };
        if ifname.to_string_lossy() == name {
            let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
            found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
            break;
        }
    }
    unsafe { libc::freeifaddrs(addrs) };

    found.ok_or_else(|| StackError::InterfaceNotFound(name.to_string()))
}

/// Sink that records every packet instead of sending it. Used by the
/// state machine tests; the send path is identical up to the sendto call.
#[derive(Default)]
pub struct RecordingSink {
    packets: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets recorded so far.
    pub fn len(&self) -> usize {
        self.packets.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the nth recorded packet.
    pub fn packet(&self, n: usize) -> Vec<u8> {
        self.packets.lock().unwrap()[n].clone()
    }

    /// Copies of all recorded packets.
    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.packets.lock().unwrap().clone()
    }
}

impl PacketSink for RecordingSink {
    fn send_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.packets.lock().unwrap().push(packet.to_vec());
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
