//! TCP endpoint state machine with a BBR-style congestion model.
//!
//! A [`Tcb`] (protocol control block) carries one endpoint's state: the
//! 4-tuple, the RFC 793 state, send/receive sequence variables, and a
//! [`bbr::BbrModel`]. [`ConnectionTable`] holds every live PCB plus the
//! passive-open listeners; [`ConnectionTable::deliver`] is the single
//! entry point an inbound segment goes through, and it returns whatever
//! segment (if any) the automaton wants sent back.

pub mod bbr;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use super::{IpAddress, Ipv4Address, SocketAddr};
use crate::error::{KernelError, NetError};
use bbr::BbrModel;

/// TCP header flags (low byte of the 13th header byte).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }
}

/// The classic 11-state TCP automaton (RFC 793 §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// A TCP segment, parsed from or about to be serialized to the wire.
/// Options are unsupported -- every header is the fixed 20-byte form.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    pub const HEADER_LEN: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Result<Self, KernelError> {
        if data.len() < Self::HEADER_LEN {
            return Err(KernelError::InvalidArgument {
                name: "tcp_segment",
                value: "too_short",
            });
        }
        let data_offset = ((data[12] >> 4) as usize) * 4;
        if data_offset < Self::HEADER_LEN || data_offset > data.len() {
            return Err(KernelError::InvalidArgument {
                name: "tcp_segment",
                value: "bad_data_offset",
            });
        }
        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: TcpFlags::new(data[13]),
            window: u16::from_be_bytes([data[14], data[15]]),
            payload: data[data_offset..].to_vec(),
        })
    }

    /// Serializes the header and payload, with the checksum computed over
    /// the IPv4 pseudo-header as RFC 793 requires.
    pub fn to_bytes(&self, src: Ipv4Address, dst: Ipv4Address) -> Vec<u8> {
        let mut out = alloc::vec![0u8; Self::HEADER_LEN + self.payload.len()];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12] = ((Self::HEADER_LEN / 4) as u8) << 4;
        out[13] = self.flags.0;
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        // checksum filled in below
        out[18..20].copy_from_slice(&[0, 0]);
        out[Self::HEADER_LEN..].copy_from_slice(&self.payload);

        let checksum = tcp_checksum(src, dst, &out);
        out[16..18].copy_from_slice(&checksum.to_be_bytes());
        out
    }
}

/// RFC 793 checksum: the TCP segment plus a pseudo-header of (src, dst,
/// zero, protocol=6, tcp length).
fn tcp_checksum(src: Ipv4Address, dst: Ipv4Address, segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut add_u16 = |hi: u8, lo: u8| sum += u16::from_be_bytes([hi, lo]) as u32;

    add_u16(src.0[0], src.0[1]);
    add_u16(src.0[2], src.0[3]);
    add_u16(dst.0[0], dst.0[1]);
    add_u16(dst.0[2], dst.0[3]);
    sum += super::ip::IpProtocol::Tcp as u32;
    sum += segment.len() as u32;

    let mut chunks = segment.chunks_exact(2);
    for chunk in &mut chunks {
        add_u16(chunk[0], chunk[1]);
    }
    if let [last] = chunks.remainder() {
        add_u16(*last, 0);
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Default receive window advertised on new connections.
const DEFAULT_WINDOW: u16 = 65535;

/// A TCP protocol control block.
#[derive(Debug, Clone)]
pub struct Tcb {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: TcpState,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u16,
    pub rcv_nxt: u32,
    pub rcv_wnd: u16,
    pub cwnd: u64,
    pub ssthresh: u64,
    pub bbr: BbrModel,
    last_sample_seq: u32,
    /// In-order payload bytes delivered by the automaton but not yet read
    /// by a socket's `recv`.
    rx_buffer: Vec<u8>,
    /// Set once a passively-opened connection has been handed out of
    /// `ConnectionTable::take_acceptable` -- keeps `accept` from returning
    /// the same child twice.
    accepted: bool,
}

impl Tcb {
    fn new(local: SocketAddr, remote: SocketAddr, state: TcpState) -> Self {
        Self {
            local,
            remote,
            state,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: DEFAULT_WINDOW,
            rcv_nxt: 0,
            rcv_wnd: DEFAULT_WINDOW,
            cwnd: 1,
            ssthresh: u64::MAX,
            bbr: BbrModel::new(),
            last_sample_seq: 0,
            rx_buffer: Vec::new(),
            accepted: false,
        }
    }

    fn synthesize(&self, flags: TcpFlags, payload: Vec<u8>) -> TcpSegment {
        TcpSegment {
            src_port: self.local.port(),
            dst_port: self.remote.port(),
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags,
            window: self.rcv_wnd,
            payload,
        }
    }

    /// Advances `snd_nxt` past whatever was just sent -- SYN and FIN each
    /// consume one sequence number in addition to the payload length.
    fn advance_send_seq(&mut self, flags: TcpFlags, payload_len: usize) {
        let mut delta = payload_len as u32;
        if flags.has(TcpFlags::SYN) || flags.has(TcpFlags::FIN) {
            delta += 1;
        }
        self.snd_nxt = self.snd_nxt.wrapping_add(delta);
    }

    /// Feeds a round-trip sample into the BBR model on every ACK that
    /// advances `snd_una` -- `rtt` here is caller-supplied since the PCB
    /// itself doesn't track per-segment send timestamps.
    pub fn record_ack_sample(&mut self, acked_seq: u32, rtt_ticks: u64) {
        if acked_seq == self.last_sample_seq {
            return;
        }
        let delivered = acked_seq.wrapping_sub(self.snd_una) as u64;
        let inflight = self.snd_nxt.wrapping_sub(acked_seq) as u64;
        self.bbr.on_ack_sample(rtt_ticks, delivered.max(1), inflight);
        self.cwnd = self.bbr.cwnd().max(1);
        self.last_sample_seq = acked_seq;
    }
}

/// Every live PCB, keyed by its 4-tuple, plus the passive-open listeners
/// keyed by local address alone.
pub struct ConnectionTable {
    connections: BTreeMap<(SocketAddr, SocketAddr), Tcb>,
    listeners: BTreeMap<SocketAddr, Tcb>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            connections: BTreeMap::new(),
            listeners: BTreeMap::new(),
        }
    }

    /// Passive open: put a PCB in LISTEN on `local`.
    pub fn listen(&mut self, local: SocketAddr) {
        let wildcard = SocketAddr::v4(Ipv4Address::UNSPECIFIED, 0);
        self.listeners
            .insert(local, Tcb::new(local, wildcard, TcpState::Listen));
    }

    /// Active open: put a PCB in SYN_SENT and return the SYN to send.
    pub fn connect(&mut self, local: SocketAddr, remote: SocketAddr, isn: u32) -> TcpSegment {
        let mut tcb = Tcb::new(local, remote, TcpState::SynSent);
        tcb.snd_una = isn;
        tcb.snd_nxt = isn;
        let seg = tcb.synthesize(TcpFlags::new(TcpFlags::SYN), Vec::new());
        tcb.advance_send_seq(seg.flags, 0);
        self.connections.insert((local, remote), tcb);
        seg
    }

    pub fn get(&self, local: SocketAddr, remote: SocketAddr) -> Option<&Tcb> {
        self.connections.get(&(local, remote))
    }

    pub fn get_mut(&mut self, local: SocketAddr, remote: SocketAddr) -> Option<&mut Tcb> {
        self.connections.get_mut(&(local, remote))
    }

    /// Hands out the first established child of a listener on `local` that
    /// hasn't already been accepted. Marks it accepted so a second call
    /// doesn't return the same peer again.
    pub fn take_acceptable(&mut self, local: SocketAddr) -> Option<SocketAddr> {
        for ((l, remote), tcb) in self.connections.iter_mut() {
            if *l == local && tcb.state == TcpState::Established && !tcb.accepted {
                tcb.accepted = true;
                return Some(*remote);
            }
        }
        None
    }

    /// Looks up the most specific PCB for an inbound segment addressed
    /// `remote -> local`, forges a derived PCB from a listener on a SYN,
    /// and runs the RFC 793 transition for the segment. Returns the
    /// segment to send back, if the automaton has one.
    pub fn deliver(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        seg: &TcpSegment,
        isn: u32,
    ) -> Result<Option<TcpSegment>, KernelError> {
        if !self.connections.contains_key(&(local, remote)) {
            if seg.flags.has(TcpFlags::SYN) && self.listeners.contains_key(&local) {
                let mut child = Tcb::new(local, remote, TcpState::SynReceived);
                child.rcv_nxt = seg.seq.wrapping_add(1);
                child.snd_una = isn;
                child.snd_nxt = isn;
                let reply = child.synthesize(
                    TcpFlags::new(TcpFlags::SYN | TcpFlags::ACK),
                    Vec::new(),
                );
                child.advance_send_seq(reply.flags, 0);
                self.connections.insert((local, remote), child);
                return Ok(Some(reply));
            }
            // Unknown 4-tuple and no listener: RST, unless the inbound
            // segment was itself a RST.
            if seg.flags.has(TcpFlags::RST) {
                return Ok(None);
            }
            return Ok(Some(TcpSegment {
                src_port: local.port(),
                dst_port: remote.port(),
                seq: seg.ack,
                ack: seg.seq.wrapping_add(1),
                flags: TcpFlags::new(TcpFlags::RST | TcpFlags::ACK),
                window: 0,
                payload: Vec::new(),
            }));
        }

        let tcb = self.connections.get_mut(&(local, remote)).unwrap();
        transition(tcb, seg)
    }

    pub fn remove(&mut self, local: SocketAddr, remote: SocketAddr) {
        self.connections.remove(&(local, remote));
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs one inbound segment through `tcb`'s current state, per RFC 793
/// §3.9's event processing, and returns any segment the reaction needs
/// to send.
fn transition(tcb: &mut Tcb, seg: &TcpSegment) -> Result<Option<TcpSegment>, KernelError> {
    // Out-of-window data on an established connection is dropped with a
    // pure ACK, not processed -- spec's failure semantics for §4.6.
    if tcb.state == TcpState::Established
        && seg.seq != tcb.rcv_nxt
        && !seg.payload.is_empty()
    {
        return Ok(Some(tcb.synthesize(TcpFlags::new(TcpFlags::ACK), Vec::new())));
    }

    match tcb.state {
        TcpState::SynSent => {
            if seg.flags.has(TcpFlags::SYN) && seg.flags.has(TcpFlags::ACK) {
                tcb.rcv_nxt = seg.seq.wrapping_add(1);
                tcb.snd_una = seg.ack;
                tcb.state = TcpState::Established;
                let ack = tcb.synthesize(TcpFlags::new(TcpFlags::ACK), Vec::new());
                return Ok(Some(ack));
            }
        }
        TcpState::SynReceived => {
            if seg.flags.has(TcpFlags::ACK) {
                tcb.snd_una = seg.ack;
                tcb.state = TcpState::Established;
            }
        }
        TcpState::Established | TcpState::CloseWait => {
            if seg.flags.has(TcpFlags::ACK) && seg.ack != tcb.snd_una {
                tcb.snd_una = seg.ack;
            }
            if !seg.payload.is_empty() {
                tcb.rcv_nxt = seg.seq.wrapping_add(seg.payload.len() as u32);
                tcb.rx_buffer.extend_from_slice(&seg.payload);
            }
            if seg.flags.has(TcpFlags::FIN) {
                tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
                let was_established = tcb.state == TcpState::Established;
                tcb.state = TcpState::CloseWait;
                let ack = tcb.synthesize(TcpFlags::new(TcpFlags::ACK), Vec::new());
                if was_established {
                    return Ok(Some(ack));
                }
            } else if !seg.payload.is_empty() {
                let ack = tcb.synthesize(TcpFlags::new(TcpFlags::ACK), Vec::new());
                return Ok(Some(ack));
            }
        }
        TcpState::FinWait1 => {
            if seg.flags.has(TcpFlags::FIN) && seg.flags.has(TcpFlags::ACK) {
                tcb.rcv_nxt = seg.seq.wrapping_add(1);
                tcb.state = TcpState::TimeWait;
                return Ok(Some(tcb.synthesize(TcpFlags::new(TcpFlags::ACK), Vec::new())));
            }
            if seg.flags.has(TcpFlags::ACK) {
                tcb.state = TcpState::FinWait2;
            } else if seg.flags.has(TcpFlags::FIN) {
                tcb.rcv_nxt = seg.seq.wrapping_add(1);
                tcb.state = TcpState::Closing;
                return Ok(Some(tcb.synthesize(TcpFlags::new(TcpFlags::ACK), Vec::new())));
            }
        }
        TcpState::FinWait2 => {
            if seg.flags.has(TcpFlags::FIN) {
                tcb.rcv_nxt = seg.seq.wrapping_add(1);
                tcb.state = TcpState::TimeWait;
                return Ok(Some(tcb.synthesize(TcpFlags::new(TcpFlags::ACK), Vec::new())));
            }
        }
        TcpState::Closing => {
            if seg.flags.has(TcpFlags::ACK) {
                tcb.state = TcpState::TimeWait;
            }
        }
        TcpState::LastAck => {
            if seg.flags.has(TcpFlags::ACK) {
                tcb.state = TcpState::Closed;
            }
        }
        TcpState::Listen | TcpState::Closed | TcpState::TimeWait => {}
    }
    Ok(None)
}

/// Initiates the local close sequence on an established or passive-close
/// connection: sends FIN and advances to FIN_WAIT_1 / LAST_ACK.
pub fn close(tcb: &mut Tcb) -> Option<TcpSegment> {
    match tcb.state {
        TcpState::Established => {
            let fin = tcb.synthesize(TcpFlags::new(TcpFlags::FIN | TcpFlags::ACK), Vec::new());
            tcb.advance_send_seq(fin.flags, 0);
            tcb.state = TcpState::FinWait1;
            Some(fin)
        }
        TcpState::CloseWait => {
            let fin = tcb.synthesize(TcpFlags::new(TcpFlags::FIN | TcpFlags::ACK), Vec::new());
            tcb.advance_send_seq(fin.flags, 0);
            tcb.state = TcpState::LastAck;
            Some(fin)
        }
        _ => None,
    }
}

static CONNECTIONS: Mutex<Option<ConnectionTable>> = Mutex::new(None);

/// Generates a fresh initial sequence number. The spec leaves ISN choice
/// unspecified beyond "requires freshness"; a monotonic counter seeded at
/// boot satisfies that without needing a real entropy source per-call.
pub fn generate_initial_seq() -> u32 {
    static COUNTER: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(1_000_000);
    COUNTER.fetch_add(6400, core::sync::atomic::Ordering::Relaxed)
}

pub fn init() -> Result<(), KernelError> {
    println!("[TCP] Initializing TCP protocol...");
    *CONNECTIONS.lock() = Some(ConnectionTable::new());
    println!("[TCP] TCP initialized");
    Ok(())
}

/// Feeds one inbound IPv4 TCP payload through the global connection
/// table's automaton and sends back whatever reply it produces. This is
/// the entry point the Ethernet/IP dispatch path calls on protocol 6.
pub fn dispatch_segment(src: IpAddress, dst: IpAddress, data: &[u8]) -> Result<(), KernelError> {
    let (IpAddress::V4(src_ip), IpAddress::V4(dst_ip)) = (src, dst) else {
        return Err(KernelError::NotImplemented {
            feature: "tcp_over_ipv6",
        });
    };
    let seg = TcpSegment::from_bytes(data)?;
    let local = SocketAddr::v4(dst_ip, seg.dst_port);
    let remote = SocketAddr::v4(src_ip, seg.src_port);
    let isn = generate_initial_seq();

    let reply = {
        let mut guard = CONNECTIONS.lock();
        let table = guard.as_mut().ok_or(KernelError::NotInitialized {
            subsystem: "tcp",
        })?;
        table.deliver(local, remote, &seg, isn)?
    };

    if let Some(reply_seg) = reply {
        let bytes = reply_seg.to_bytes(dst_ip, src_ip);
        super::ip::send(IpAddress::V4(src_ip), super::ip::IpProtocol::Tcp, &bytes)?;
    }
    Ok(())
}

fn v4_pair(local: SocketAddr, remote: SocketAddr) -> Result<(Ipv4Address, Ipv4Address), KernelError> {
    match (local.ip(), remote.ip()) {
        (IpAddress::V4(l), IpAddress::V4(r)) => Ok((l, r)),
        _ => Err(KernelError::NotImplemented {
            feature: "tcp_over_ipv6",
        }),
    }
}

fn with_connections<T>(
    f: impl FnOnce(&mut ConnectionTable) -> Result<T, KernelError>,
) -> Result<T, KernelError> {
    let mut guard = CONNECTIONS.lock();
    let table = guard
        .as_mut()
        .ok_or(KernelError::NotInitialized { subsystem: "tcp" })?;
    f(table)
}

/// Puts a PCB in LISTEN on `local` -- the socket layer's `listen`.
pub fn open_listener(local: SocketAddr) -> Result<(), KernelError> {
    with_connections(|table| {
        table.listen(local);
        Ok(())
    })
}

/// Active-opens a connection and sends the initial SYN -- the socket
/// layer's `connect`.
pub fn open_connection(local: SocketAddr, remote: SocketAddr) -> Result<(), KernelError> {
    let (src_ip, dst_ip) = v4_pair(local, remote)?;
    let isn = generate_initial_seq();
    let syn = with_connections(|table| Ok(table.connect(local, remote, isn)))?;
    let bytes = syn.to_bytes(src_ip, dst_ip);
    super::ip::send(IpAddress::V4(dst_ip), super::ip::IpProtocol::Tcp, &bytes)
}

/// Hands out a peer address for a listener on `local` that has completed
/// its handshake but hasn't been accepted yet -- the socket layer's
/// `accept`, called in a loop until it stops returning `WouldBlock`.
pub fn poll_accept(local: SocketAddr) -> Result<SocketAddr, KernelError> {
    with_connections(|table| table.take_acceptable(local).ok_or(KernelError::WouldBlock))
}

/// Sends `data` over an established connection and advances its send
/// sequence space -- the socket layer's stream `send`.
pub fn send_data(local: SocketAddr, remote: SocketAddr, data: &[u8]) -> Result<usize, KernelError> {
    let (src_ip, dst_ip) = v4_pair(local, remote)?;
    let seg = with_connections(|table| {
        let tcb = table
            .get_mut(local, remote)
            .ok_or(KernelError::NetError(NetError::WrongState { state: "no_connection" }))?;
        if tcb.state != TcpState::Established {
            return Err(KernelError::NetError(NetError::WrongState {
                state: "not_established",
            }));
        }
        let seg = tcb.synthesize(TcpFlags::new(TcpFlags::ACK | TcpFlags::PSH), data.to_vec());
        tcb.advance_send_seq(seg.flags, data.len());
        Ok(seg)
    })?;
    let bytes = seg.to_bytes(src_ip, dst_ip);
    super::ip::send(IpAddress::V4(dst_ip), super::ip::IpProtocol::Tcp, &bytes)?;
    Ok(data.len())
}

/// Drains up to `buffer.len()` bytes already delivered to `local`/`remote`'s
/// receive buffer -- the socket layer's stream `recv`. Returns `0` rather
/// than blocking when nothing has arrived yet.
pub fn recv_data(
    local: SocketAddr,
    remote: SocketAddr,
    buffer: &mut [u8],
) -> Result<usize, KernelError> {
    with_connections(|table| {
        let tcb = table
            .get_mut(local, remote)
            .ok_or(KernelError::NetError(NetError::WrongState { state: "no_connection" }))?;
        let n = buffer.len().min(tcb.rx_buffer.len());
        buffer[..n].copy_from_slice(&tcb.rx_buffer[..n]);
        tcb.rx_buffer.drain(..n);
        Ok(n)
    })
}

/// Runs the local close sequence on `local`/`remote` and sends whatever
/// FIN it produces -- the socket layer's `close`.
pub fn close_connection(local: SocketAddr, remote: SocketAddr) -> Result<(), KernelError> {
    let (src_ip, dst_ip) = v4_pair(local, remote)?;
    let fin = with_connections(|table| {
        let tcb = table
            .get_mut(local, remote)
            .ok_or(KernelError::NetError(NetError::WrongState { state: "no_connection" }))?;
        Ok(close(tcb))
    })?;
    if let Some(seg) = fin {
        let bytes = seg.to_bytes(src_ip, dst_ip);
        super::ip::send(IpAddress::V4(dst_ip), super::ip::IpProtocol::Tcp, &bytes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Ipv4Address;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::v4(Ipv4Address::new(127, 0, 0, 1), port)
    }

    #[test]
    fn tcp_flags_round_trip() {
        let mut flags = TcpFlags::new(0);
        flags.set(TcpFlags::SYN);
        assert!(flags.has(TcpFlags::SYN));
        assert!(!flags.has(TcpFlags::ACK));
    }

    #[test]
    fn segment_serializes_with_a_valid_checksum() {
        let seg = TcpSegment {
            src_port: 4242,
            dst_port: 80,
            seq: 1000,
            ack: 0,
            flags: TcpFlags::new(TcpFlags::SYN),
            window: 65535,
            payload: Vec::new(),
        };
        let src = Ipv4Address::new(10, 0, 0, 1);
        let dst = Ipv4Address::new(10, 0, 0, 2);
        let bytes = seg.to_bytes(src, dst);
        let checksum = tcp_checksum(src, dst, &bytes);
        assert_eq!(checksum, 0);
    }

    #[test]
    fn listen_then_syn_forges_a_child_pcb_in_syn_received() {
        let mut table = ConnectionTable::new();
        let local = addr(80);
        let remote = addr(9000);
        table.listen(local);

        let syn = TcpSegment {
            src_port: remote.port(),
            dst_port: local.port(),
            seq: 1000,
            ack: 0,
            flags: TcpFlags::new(TcpFlags::SYN),
            window: 65535,
            payload: Vec::new(),
        };
        let reply = table.deliver(local, remote, &syn, 5000).unwrap().unwrap();
        assert!(reply.flags.has(TcpFlags::SYN) && reply.flags.has(TcpFlags::ACK));
        assert_eq!(reply.ack, 1001);
        assert_eq!(table.get(local, remote).unwrap().state, TcpState::SynReceived);
    }

    #[test]
    fn full_handshake_reaches_established() {
        let mut table = ConnectionTable::new();
        let local = addr(80);
        let remote = addr(9000);
        table.listen(local);

        let syn = TcpSegment {
            src_port: remote.port(),
            dst_port: local.port(),
            seq: 1000,
            ack: 0,
            flags: TcpFlags::new(TcpFlags::SYN),
            window: 65535,
            payload: Vec::new(),
        };
        let syn_ack = table.deliver(local, remote, &syn, 5000).unwrap().unwrap();

        let ack = TcpSegment {
            src_port: remote.port(),
            dst_port: local.port(),
            seq: 1001,
            ack: syn_ack.seq.wrapping_add(1),
            flags: TcpFlags::new(TcpFlags::ACK),
            window: 65535,
            payload: Vec::new(),
        };
        let reply = table.deliver(local, remote, &ack, 0).unwrap();
        assert!(reply.is_none());
        assert_eq!(
            table.get(local, remote).unwrap().state,
            TcpState::Established
        );
    }

    #[test]
    fn established_child_is_acceptable_exactly_once() {
        let mut table = ConnectionTable::new();
        let local = addr(80);
        let remote = addr(9000);
        table.listen(local);

        let syn = TcpSegment {
            src_port: remote.port(),
            dst_port: local.port(),
            seq: 1000,
            ack: 0,
            flags: TcpFlags::new(TcpFlags::SYN),
            window: 65535,
            payload: Vec::new(),
        };
        let syn_ack = table.deliver(local, remote, &syn, 5000).unwrap().unwrap();
        let ack = TcpSegment {
            src_port: remote.port(),
            dst_port: local.port(),
            seq: 1001,
            ack: syn_ack.seq.wrapping_add(1),
            flags: TcpFlags::new(TcpFlags::ACK),
            window: 65535,
            payload: Vec::new(),
        };
        table.deliver(local, remote, &ack, 0).unwrap();

        assert_eq!(table.take_acceptable(local), Some(remote));
        assert_eq!(table.take_acceptable(local), None);
    }

    #[test]
    fn inbound_payload_lands_in_the_tcb_rx_buffer() {
        let mut table = ConnectionTable::new();
        let local = addr(80);
        let remote = addr(9000);
        table.listen(local);

        let syn = TcpSegment {
            src_port: remote.port(),
            dst_port: local.port(),
            seq: 1000,
            ack: 0,
            flags: TcpFlags::new(TcpFlags::SYN),
            window: 65535,
            payload: Vec::new(),
        };
        let syn_ack = table.deliver(local, remote, &syn, 5000).unwrap().unwrap();
        let ack = TcpSegment {
            src_port: remote.port(),
            dst_port: local.port(),
            seq: 1001,
            ack: syn_ack.seq.wrapping_add(1),
            flags: TcpFlags::new(TcpFlags::ACK),
            window: 65535,
            payload: Vec::new(),
        };
        table.deliver(local, remote, &ack, 0).unwrap();

        let data_seg = TcpSegment {
            src_port: remote.port(),
            dst_port: local.port(),
            seq: 1001,
            ack: syn_ack.seq.wrapping_add(1),
            flags: TcpFlags::new(TcpFlags::ACK),
            window: 65535,
            payload: alloc::vec![1, 2, 3],
        };
        table.deliver(local, remote, &data_seg, 0).unwrap();
        assert_eq!(table.get(local, remote).unwrap().rx_buffer, alloc::vec![1, 2, 3]);
    }

    #[test]
    fn unknown_four_tuple_gets_rst() {
        let mut table = ConnectionTable::new();
        let local = addr(80);
        let remote = addr(9000);
        let ack = TcpSegment {
            src_port: remote.port(),
            dst_port: local.port(),
            seq: 1,
            ack: 1,
            flags: TcpFlags::new(TcpFlags::ACK),
            window: 65535,
            payload: Vec::new(),
        };
        let reply = table.deliver(local, remote, &ack, 0).unwrap().unwrap();
        assert!(reply.flags.has(TcpFlags::RST));
    }

    #[test]
    fn fin_on_established_moves_to_close_wait() {
        let mut table = ConnectionTable::new();
        let local = addr(80);
        let remote = addr(9000);
        table.listen(local);
        let syn = TcpSegment {
            src_port: remote.port(),
            dst_port: local.port(),
            seq: 1000,
            ack: 0,
            flags: TcpFlags::new(TcpFlags::SYN),
            window: 65535,
            payload: Vec::new(),
        };
        let syn_ack = table.deliver(local, remote, &syn, 5000).unwrap().unwrap();
        let ack = TcpSegment {
            src_port: remote.port(),
            dst_port: local.port(),
            seq: 1001,
            ack: syn_ack.seq.wrapping_add(1),
            flags: TcpFlags::new(TcpFlags::ACK),
            window: 65535,
            payload: Vec::new(),
        };
        table.deliver(local, remote, &ack, 0).unwrap();

        let fin = TcpSegment {
            src_port: remote.port(),
            dst_port: local.port(),
            seq: 1001,
            ack: syn_ack.seq.wrapping_add(1),
            flags: TcpFlags::new(TcpFlags::FIN | TcpFlags::ACK),
            window: 65535,
            payload: Vec::new(),
        };
        table.deliver(local, remote, &fin, 0).unwrap();
        assert_eq!(table.get(local, remote).unwrap().state, TcpState::CloseWait);
    }

    #[test]
    fn ack_sample_feeds_the_bbr_model() {
        let mut tcb = Tcb::new(addr(80), addr(9000), TcpState::Established);
        tcb.snd_una = 0;
        tcb.snd_nxt = 10_000;
        tcb.record_ack_sample(4000, 20);
        assert!(tcb.bbr.bottleneck_bw > 0);
        assert_eq!(tcb.bbr.min_rtt_ticks, 20);
    }
}
