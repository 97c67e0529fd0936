//! Network stack for Ferrite
//!
//! Provides TCP/IP networking capabilities including:
//! - IP layer (IPv4/IPv6)
//! - TCP protocol
//! - UDP protocol
//! - Socket API
//! - Network device abstraction

pub mod arp;
pub mod device;
pub mod ethernet;
pub mod ip;
pub mod socket;
pub mod tcp;
pub mod udp;

use alloc::vec::Vec;

use crate::error::KernelError;

/// MAC address (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: Self = Self([0xFF; 6]);
    pub const ZERO: Self = Self([0x00; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

/// IPv4 address (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ipv4Address(pub [u8; 4]);

impl Ipv4Address {
    pub const LOCALHOST: Self = Self([127, 0, 0, 1]);
    pub const BROADCAST: Self = Self([255, 255, 255, 255]);
    pub const ANY: Self = Self([0, 0, 0, 0]);
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    pub fn from_u32(addr: u32) -> Self {
        Self(addr.to_be_bytes())
    }

    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

/// IPv6 address (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ipv6Address(pub [u8; 16]);

impl Ipv6Address {
    pub const LOCALHOST: Self = Self([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    pub const ANY: Self = Self([0; 16]);
}

/// IP address (v4 or v6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IpAddress {
    V4(Ipv4Address),
    V6(Ipv6Address),
}

/// Port number
pub type Port = u16;

/// Socket address (IP + port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SocketAddr {
    pub ip: IpAddress,
    pub port: Port,
}

impl SocketAddr {
    pub fn new(ip: IpAddress, port: Port) -> Self {
        Self { ip, port }
    }

    pub fn v4(addr: Ipv4Address, port: Port) -> Self {
        Self {
            ip: IpAddress::V4(addr),
            port,
        }
    }

    pub fn ip(&self) -> IpAddress {
        self.ip
    }

    pub fn port(&self) -> Port {
        self.port
    }
}

/// A network packet in flight through the stack.
///
/// Backed by one owned allocation with four offsets into it, `head <=
/// data <= tail <= end`: `head..data` is headroom reserved for headers a
/// lower layer still needs to prepend (Ethernet under IPv4 under TCP),
/// `data..tail` is the current layer's view of the packet, and
/// `tail..end` is room left to append payload. Each layer call transfers
/// ownership of the buffer to the next layer down (send) or up (receive);
/// nothing ever holds two references to the same packet.
#[derive(Clone)]
pub struct PacketBuffer {
    buf: Vec<u8>,
    head: usize,
    data: usize,
    tail: usize,
    end: usize,
    /// Device this packet arrived on or is queued to leave through.
    pub interface: Option<alloc::string::String>,
    /// Byte offset of the Ethernet header within `buf`, once framed.
    pub l2_offset: Option<usize>,
    /// Byte offset of the IPv4 header within `buf`, once framed.
    pub l3_offset: Option<usize>,
    /// Byte offset of the TCP/UDP header within `buf`, once framed.
    pub l4_offset: Option<usize>,
}

impl PacketBuffer {
    /// A buffer with `headroom` bytes reserved below the payload, sized
    /// to hold up to `payload_capacity` bytes of payload above that.
    /// Used when building an outbound packet: the TCP/UDP layer writes
    /// its payload first, then each layer below prepends its header into
    /// the headroom via [`push_header`](Self::push_header).
    pub fn with_headroom(headroom: usize, payload_capacity: usize) -> Self {
        Self {
            buf: alloc::vec![0u8; headroom + payload_capacity],
            head: 0,
            data: headroom,
            tail: headroom,
            end: headroom + payload_capacity,
            interface: None,
            l2_offset: None,
            l3_offset: None,
            l4_offset: None,
        }
    }

    /// Wraps a just-received frame with no headroom; inbound layers strip
    /// their own header off the front via [`pull_header`](Self::pull_header)
    /// as they dispatch upward.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buf: bytes.to_vec(),
            head: 0,
            data: 0,
            tail: bytes.len(),
            end: bytes.len(),
            interface: None,
            l2_offset: None,
            l3_offset: None,
            l4_offset: None,
        }
    }

    /// Appends `bytes` to the current payload, growing `tail`. Fails if
    /// there isn't enough room before `end`.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), KernelError> {
        if self.tail + bytes.len() > self.end {
            return Err(KernelError::ResourceExhausted {
                resource: "packet tailroom",
            });
        }
        self.buf[self.tail..self.tail + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();
        Ok(())
    }

    /// Prepends `bytes` into the headroom below the current payload,
    /// moving `data` back. Fails if there isn't enough headroom left
    /// before `head` -- each layer must reserve enough in
    /// [`with_headroom`](Self::with_headroom) up front.
    pub fn push_header(&mut self, bytes: &[u8]) -> Result<(), KernelError> {
        if self.data < self.head + bytes.len() {
            return Err(KernelError::ResourceExhausted {
                resource: "packet headroom",
            });
        }
        self.data -= bytes.len();
        self.buf[self.data..self.data + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Strips `len` bytes off the front of the current payload (a header
    /// this layer owns) and returns them, advancing `data`. Used walking
    /// up the stack: Ethernet pulls its header before handing off to
    /// IPv4, IPv4 before handing off to TCP/UDP.
    pub fn pull_header(&mut self, len: usize) -> Result<&[u8], KernelError> {
        if self.data + len > self.tail {
            return Err(KernelError::InvalidArgument {
                name: "packet",
                value: "too_short",
            });
        }
        let start = self.data;
        self.data += len;
        Ok(&self.buf[start..start + len])
    }

    /// The current layer's view of the packet: everything between `data`
    /// and `tail`.
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.data..self.tail]
    }

    pub fn len(&self) -> usize {
        self.tail - self.data
    }

    pub fn is_empty(&self) -> bool {
        self.tail == self.data
    }

    /// Headroom still available below `data`, for layers deciding whether
    /// they can prepend their header in place.
    pub fn headroom(&self) -> usize {
        self.data - self.head
    }
}

/// Network statistics
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
}

static STATS: spin::Mutex<NetworkStats> = spin::Mutex::new(NetworkStats {
    packets_sent: 0,
    packets_received: 0,
    bytes_sent: 0,
    bytes_received: 0,
    errors: 0,
});

/// Update network statistics
pub fn update_stats_tx(bytes: usize) {
    let mut stats = STATS.lock();
    stats.packets_sent += 1;
    stats.bytes_sent += bytes as u64;
}

pub fn update_stats_rx(bytes: usize) {
    let mut stats = STATS.lock();
    stats.packets_received += 1;
    stats.bytes_received += bytes as u64;
}

pub fn get_stats() -> NetworkStats {
    *STATS.lock()
}

/// Initialize network stack
pub fn init() -> Result<(), KernelError> {
    println!("[NET] Initializing network stack...");

    // Initialize device layer
    device::init()?;

    // Initialize IP layer
    ip::init()?;

    // Initialize TCP
    tcp::init()?;

    // Initialize UDP
    udp::init()?;

    // Initialize socket layer
    socket::init()?;

    println!("[NET] Network stack initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_address() {
        let addr = Ipv4Address::new(192, 168, 1, 1);
        assert_eq!(addr.0, [192, 168, 1, 1]);
    }

    #[test]
    fn test_mac_address() {
        let mac = MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(mac.0[0], 0x00);
        assert_eq!(mac.0[5], 0x55);
    }

    #[test]
    fn received_packet_has_no_headroom() {
        let data = b"Hello, Network!";
        let pkt = PacketBuffer::from_bytes(data);
        assert_eq!(pkt.payload(), data);
        assert_eq!(pkt.headroom(), 0);
    }

    #[test]
    fn headers_prepend_into_reserved_headroom() {
        let mut pkt = PacketBuffer::with_headroom(32, 16);
        pkt.append(b"payload").unwrap();
        pkt.push_header(b"tcp-hdr").unwrap();
        pkt.push_header(b"ip-hdr-").unwrap();
        assert_eq!(pkt.payload(), b"ip-hdr-tcp-hdrpayload");
    }

    #[test]
    fn pull_header_strips_front_and_advances_data() {
        let mut pkt = PacketBuffer::from_bytes(b"ETHethertail");
        let eth = pkt.pull_header(3).unwrap();
        assert_eq!(eth, b"ETH");
        assert_eq!(pkt.payload(), b"ethertail");
    }

    #[test]
    fn push_header_fails_once_headroom_is_exhausted() {
        let mut pkt = PacketBuffer::with_headroom(4, 16);
        assert!(pkt.push_header(b"12345").is_err());
    }
}
