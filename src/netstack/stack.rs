//! The stack object: raw-socket reader loop, segment demultiplexer, TCP
//! state machine, and user-initiated open.
//!
//! One reader task pulls datagrams off the raw socket and handles each
//! segment synchronously under its flow's lock. User actions (dial,
//! write, close) run on worker tasks and take the same lock, so all
//! mutations of a flow are serialized while different flows stay
//! independent. Sends are plain `sendto` calls issued from whichever
//! task holds the flow lock.
//!
//! Known gaps: no retransmission timer, no TIME_WAIT sweep, out-of-order
//! segments are dropped rather than queued, and a timed-out dial leaves
//! its flow in the table.

use std::io;
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use rand::Rng;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use super::checksum;
use super::conn::Connection;
use super::flow::{Flow, FlowKey, FlowState, SocketState, StateTable};
use super::ipv4::{self, Ipv4Header};
use super::raw::{self, PacketSink, RawSocket};
use super::tcp::{flags, TcpHeader};
use super::StackError;

/// How long a dial waits for the handshake to complete.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a façade read waits for buffered bytes.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Ephemeral source ports are drawn from [1000, 33767].
const EPHEMERAL_BASE: u16 = 1000;
const EPHEMERAL_SPAN: u16 = 32768;

/// A (port, destination) pair is not reused within this window.
const PORT_REUSE_WINDOW: Duration = Duration::from_secs(60);
const PORT_ALLOC_ATTEMPTS: usize = 100;

/// Guards against handing out a source port that is still tied to a live
/// or recently finished flow toward the same destination.
struct PortAllocator {
    recent: LruCache<(u16, Ipv4Addr, u16), Instant>,
}

impl PortAllocator {
    fn new() -> Self {
        let capacity = NonZeroUsize::new(65536).unwrap();
        Self {
            recent: LruCache::new(capacity),
        }
    }
}

/// Userspace TCP/IP stack over one raw socket.
pub struct Stack {
    local_ip: Ipv4Addr,
    sink: Arc<dyn PacketSink>,
    table: StateTable,
    ports: Mutex<PortAllocator>,
    socket: Option<Arc<RawSocket>>,
}

impl Stack {
    /// Open the raw socket and bind the stack to `interface`'s IPv4
    /// address. Fatal errors only; call [`start`](Self::start) afterwards
    /// to spawn the reader task.
    pub fn new(interface: &str) -> Result<Self, StackError> {
        let local_ip = raw::interface_ipv4(interface)?;
        let socket = Arc::new(RawSocket::open()?);
        Ok(Self {
            local_ip,
            sink: socket.clone(),
            table: StateTable::new(),
            ports: Mutex::new(PortAllocator::new()),
            socket: Some(socket),
        })
    }

    /// Stack with no raw socket: segments go to `sink` and inbound
    /// packets are injected with [`handle_packet`](Self::handle_packet).
    /// This is how the state machine is exercised offline.
    pub fn with_sink(local_ip: Ipv4Addr, sink: Arc<dyn PacketSink>) -> Self {
        Self {
            local_ip,
            sink,
            table: StateTable::new(),
            ports: Mutex::new(PortAllocator::new()),
            socket: None,
        }
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub(crate) fn table(&self) -> &StateTable {
        &self.table
    }

    /// Spawn the reader task driving the raw-socket event loop. A stack
    /// built with [`with_sink`](Self::with_sink) has nothing to read and
    /// returns immediately.
    pub fn start(self: &Arc<Self>) -> Result<(), StackError> {
        let Some(socket) = self.socket.clone() else {
            return Ok(());
        };
        let stack = Arc::clone(self);
        tokio::spawn(async move {
            let afd = match AsyncFd::with_interest(ReaderFd(socket.clone()), Interest::READABLE) {
                Ok(afd) => afd,
                Err(e) => {
                    error!(error = %e, "could not register raw socket for readiness");
                    return;
                }
            };
            let mut buf = vec![0u8; raw::RECV_BUFFER_SIZE];
            loop {
                let mut guard = match afd.readable().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        error!(error = %e, "raw socket readiness wait failed");
                        return;
                    }
                };
                loop {
                    match guard.try_io(|inner| inner.get_ref().0.recv(&mut buf)) {
                        Ok(Ok(0)) => continue,
                        Ok(Ok(n)) => stack.handle_packet(&buf[..n]),
                        Ok(Err(e)) => {
                            // Error readiness: pull SO_ERROR so the
                            // condition clears, log, keep serving.
                            match socket.take_error() {
                                Ok(Some(sock_err)) => {
                                    warn!(error = %sock_err, "raw socket error")
                                }
                                _ => warn!(error = %e, "raw socket receive failed"),
                            }
                            break;
                        }
                        Err(_would_block) => break,
                    }
                }
            }
        });
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Demultiplexer
    // ─────────────────────────────────────────────────────────────────────

    /// Handle one inbound IPv4 datagram. Parse failures are logged and
    /// dropped; they never take the reader down.
    pub fn handle_packet(&self, data: &[u8]) {
        let iph = match Ipv4Header::parse(data) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "dropping malformed packet");
                return;
            }
        };
        let payload = &data[iph.header_len()..];
        match iph.protocol {
            ipv4::PROTO_TCP => self.handle_tcp(&iph, payload),
            ipv4::PROTO_UDP => self.handle_udp(&iph, payload),
            other => trace!(protocol = other, "ignoring unknown protocol"),
        }
    }

    fn handle_udp(&self, iph: &Ipv4Header, _data: &[u8]) {
        trace!(src = %iph.src, "ignoring UDP datagram");
    }

    fn handle_tcp(&self, iph: &Ipv4Header, data: &[u8]) {
        let th = match TcpHeader::parse(data) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, src = %iph.src, "dropping malformed segment");
                return;
            }
        };

        let Some(flow) = self
            .table
            .get((iph.src, th.src_port), (iph.dst, th.dst_port))
        else {
            // Initiator-only: no listeners, no RST in reply.
            trace!(
                src = %iph.src,
                src_port = th.src_port,
                dst_port = th.dst_port,
                "segment matches no flow, dropping"
            );
            return;
        };

        let mut st = flow.lock();

        if th.has_flag(flags::RST) {
            debug!(peer = %flow.remote.0, state = %st.socket_state, "RST received");
            st.close_stream();
            st.socket_state = SocketState::Closed;
            return;
        }

        // The first segment from the peer carries its ISN.
        if st.recv_next == 0 {
            st.recv_next = th.seq;
        }
        if st.recv_next != th.seq {
            // Out-of-order: dropped, not queued. No state change, no ACK.
            trace!(
                peer = %flow.remote.0,
                seq = th.seq,
                expected = st.recv_next,
                "out-of-order segment dropped"
            );
            return;
        }

        st.recv_next = st.recv_next.wrapping_add(th.payload.len() as u32);
        if th.has_flag(flags::SYN) || th.has_flag(flags::FIN) {
            st.recv_next = st.recv_next.wrapping_add(1);
        }

        match st.socket_state {
            SocketState::SynSent => {
                if !th.has_flag(flags::SYN | flags::ACK) {
                    debug!(
                        peer = %flow.remote.0,
                        flags = th.flags,
                        "unexpected flags in SYN_SENT, closing"
                    );
                    st.close_stream();
                    st.socket_state = SocketState::Closed;
                    return;
                }
                let _ = self.send_segment(&flow, &mut st, flags::ACK, &[]);
                st.socket_state = SocketState::Established;
                st.signal_connected();
            }
            SocketState::Established => {
                let pure_ack = th.flags == flags::ACK && th.payload.is_empty();
                if !pure_ack {
                    let _ = self.send_segment(&flow, &mut st, flags::ACK, &[]);
                }
                if !th.payload.is_empty() {
                    st.push_payload(&th.payload);
                }
                if th.has_flag(flags::FIN) {
                    // Fused close: ACK above, FIN right behind it, straight
                    // to LAST_ACK with no CLOSE_WAIT stop.
                    let _ = self.send_segment(&flow, &mut st, flags::FIN, &[]);
                    st.send_next = st.send_next.wrapping_add(1);
                    st.socket_state = SocketState::LastAck;
                    st.closing = true;
                }
            }
            SocketState::FinWait1 => {
                if th.has_flag(flags::FIN) {
                    let _ = self.send_segment(&flow, &mut st, flags::ACK, &[]);
                    st.socket_state = SocketState::Closing;
                } else if th.has_flag(flags::ACK) {
                    st.socket_state = SocketState::FinWait2;
                }
            }
            SocketState::FinWait2 => {
                // Only the peer's FIN is expected here; treat the segment
                // as one.
                let _ = self.send_segment(&flow, &mut st, flags::ACK, &[]);
                st.socket_state = SocketState::Closing;
                st.close_stream();
            }
            SocketState::LastAck | SocketState::Closing => {
                if th.has_flag(flags::ACK) {
                    st.close_stream();
                    st.socket_state = SocketState::TimeWait;
                }
            }
            SocketState::TimeWait => {
                // No TIME_WAIT sweep exists; entries linger until the
                // façade drops.
            }
            SocketState::Closed => {
                debug!(peer = %flow.remote.0, "segment on closed flow");
            }
            SocketState::Listen | SocketState::SynReceived | SocketState::CloseWait => {
                trace!(state = %st.socket_state, "state not exercised by initiator");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // User-initiated open
    // ─────────────────────────────────────────────────────────────────────

    /// Dial `dst:port`: emit a SYN and wait up to [`DIAL_TIMEOUT`] for the
    /// handshake. On timeout the flow is left behind in the table.
    pub async fn connect(
        self: &Arc<Self>,
        dst: Ipv4Addr,
        port: u16,
    ) -> Result<Connection, StackError> {
        let local_port = self.allocate_port(dst, port)?;
        let isn = rand::thread_rng().gen_range(0..0x8000_0000u32);
        let ip_id = rand::random::<u16>();
        let (tx, rx) = oneshot::channel();

        let flow = Arc::new(Flow::new(
            (self.local_ip, local_port),
            (dst, port),
            isn,
            ip_id,
            tx,
        ));
        self.table.insert(Arc::clone(&flow));

        {
            let mut st = flow.lock();
            let _ = self.send_segment(&flow, &mut st, flags::SYN, &[]);
            st.send_next = st.send_next.wrapping_add(1);
        }
        debug!(peer = %dst, port, local_port, "SYN sent, awaiting handshake");

        match tokio::time::timeout(DIAL_TIMEOUT, rx).await {
            Err(_) => {
                debug!(peer = %dst, port, "handshake timed out, flow left in table");
                Err(StackError::DialTimeout)
            }
            Ok(Err(_)) => Err(StackError::DialRejected),
            Ok(Ok(())) => Ok(Connection::new(Arc::clone(self), flow)),
        }
    }

    /// Marshal and send one segment for `flow`, advancing the IP ID.
    /// Sequence and acknowledgement numbers are taken from the flow state;
    /// checksums are patched into the marshalled bytes.
    pub(crate) fn send_segment(
        &self,
        flow: &Flow,
        st: &mut FlowState,
        flag_bits: u8,
        payload: &[u8],
    ) -> io::Result<()> {
        let th = TcpHeader::new(
            flow.local.1,
            flow.remote.1,
            st.send_next,
            st.recv_next,
            flag_bits,
            payload.to_vec(),
        );
        let segment = th.marshal();
        let iph = Ipv4Header::for_tcp(st.ip_id, flow.local.0, flow.remote.0, segment.len());

        let mut packet = Vec::with_capacity(ipv4::HEADER_LEN + segment.len());
        packet.extend_from_slice(&iph.marshal());
        packet.extend_from_slice(&segment);
        checksum::fill(&mut packet);

        st.ip_id = st.ip_id.wrapping_add(1);

        self.sink.send_packet(&packet).map_err(|e| {
            warn!(error = %e, peer = %flow.remote.0, "segment send failed");
            e
        })
    }

    /// Pick an ephemeral source port for a new flow toward `dst:dst_port`,
    /// skipping ports used for that destination within the reuse window or
    /// still present in the state table.
    fn allocate_port(&self, dst: Ipv4Addr, dst_port: u16) -> Result<u16, StackError> {
        let mut ports = self
            .ports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();

        for _ in 0..PORT_ALLOC_ATTEMPTS {
            let port = EPHEMERAL_BASE + rand::thread_rng().gen_range(0..EPHEMERAL_SPAN);
            let key = (port, dst, dst_port);
            if let Some(&used_at) = ports.recent.get(&key) {
                if now.duration_since(used_at) < PORT_REUSE_WINDOW {
                    continue;
                }
            }
            let flow_key = FlowKey::new((self.local_ip, port), (dst, dst_port));
            if self.table.contains(&flow_key) {
                continue;
            }
            ports.recent.put(key, now);
            return Ok(port);
        }
        Err(StackError::PortExhausted)
    }
}

/// Owned handle handed to `AsyncFd`; readiness registration needs an
/// `AsRawFd` value it can keep.
struct ReaderFd(Arc<RawSocket>);

impl AsRawFd for ReaderFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

// =============================================================================
// Tests
// =============================================================================
