//! Per-connection state and the concurrent state table.
//!
//! A [`Flow`] is shared between the demultiplexer (reader task) and the
//! user task holding the façade; every mutable field sits behind the
//! flow's mutex, which is never held across an await. The table maps the
//! direction-normalized 4-tuple to the flow so an inbound segment finds
//! the same entry the dialer inserted.

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Waker;

use dashmap::DashMap;
use tokio::sync::oneshot;

/// TCP socket states. `Listen` and `SynReceived` are carried for
/// completeness but never entered by this initiator-only stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Listen,
    SynReceived,
    SynSent,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynReceived => "SYN_RECEIVED",
            Self::SynSent => "SYN_SENT",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::Closing => "CLOSING",
            Self::TimeWait => "TIME_WAIT",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
        };
        f.write_str(name)
    }
}

/// One (address, port) side of a connection.
pub type Endpoint = (Ipv4Addr, u16);

/// Direction-normalized 4-tuple. The two endpoints are stored sorted, so
/// the key built from (local, remote) at dial time equals the key built
/// from (source, destination) when a segment comes back in, and flows
/// that merely share a port value can never alias each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    lo: Endpoint,
    hi: Endpoint,
}

impl FlowKey {
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        if a <= b {
            Self { lo: a, hi: b }
        } else {
            Self { lo: b, hi: a }
        }
    }
}

/// Mutable per-flow state, guarded by the flow's mutex.
pub struct FlowState {
    pub socket_state: SocketState,
    /// Next sequence number to place in an outbound segment.
    pub send_next: u32,
    /// Next expected inbound sequence number; 0 until the peer's ISN is
    /// learned from the SYN+ACK.
    pub recv_next: u32,
    /// Reserved for retransmission bookkeeping; tracked, never consulted.
    pub send_unacked: u32,
    pub last_acked: u32,
    /// IPv4 identification counter, incremented per segment sent.
    pub ip_id: u16,
    /// Reassembled in-order application bytes awaiting the reader.
    pub recv_buffer: VecDeque<u8>,
    /// Single-shot handshake notification consumed by the dialer.
    connected: Option<oneshot::Sender<()>>,
    /// Reader parked in `poll_read`, woken on new bytes or close.
    read_waker: Option<Waker>,
    /// Set once a FIN has been sent; gates user writes.
    pub closing: bool,
    /// Set once the byte stream is finished; reads drain then hit EOF.
    pub closed: bool,
}

impl FlowState {
    /// Append in-order payload and wake the reader.
    pub fn push_payload(&mut self, bytes: &[u8]) {
        self.recv_buffer.extend(bytes);
        self.wake_reader();
    }

    /// Park the reader until the next payload or close.
    pub fn register_reader(&mut self, waker: Waker) {
        self.read_waker = Some(waker);
    }

    pub fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    /// Finish the byte stream: buffered bytes stay readable, then EOF.
    /// Dropping the pending handshake signal makes a waiting dialer fail.
    pub fn close_stream(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.connected = None;
        self.wake_reader();
    }

    /// Post the handshake signal. Non-blocking: if the dialer already gave
    /// up, the notification is discarded.
    pub fn signal_connected(&mut self) {
        if let Some(tx) = self.connected.take() {
            let _ = tx.send(());
        }
    }
}

/// State for one TCP connection, shared by the demultiplexer and the
/// façade.
pub struct Flow {
    pub local: Endpoint,
    pub remote: Endpoint,
    state: Mutex<FlowState>,
}

impl Flow {
    /// New flow in SYN_SENT with a fresh handshake channel. `isn` becomes
    /// `send_next`; the SYN itself advances it by one.
    pub fn new(
        local: Endpoint,
        remote: Endpoint,
        isn: u32,
        ip_id: u16,
        connected: oneshot::Sender<()>,
    ) -> Self {
        Self {
            local,
            remote,
            state: Mutex::new(FlowState {
                socket_state: SocketState::SynSent,
                send_next: isn,
                recv_next: 0,
                send_unacked: isn,
                last_acked: 0,
                ip_id,
                recv_buffer: VecDeque::new(),
                connected: Some(connected),
                read_waker: None,
                closing: false,
                closed: false,
            }),
        }
    }

    pub fn key(&self) -> FlowKey {
        FlowKey::new(self.local, self.remote)
    }

    pub fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// All known flows, queryable by 4-tuple from either direction.
#[derive(Default)]
pub struct StateTable {
    flows: DashMap<FlowKey, Arc<Flow>>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, flow: Arc<Flow>) {
        self.flows.insert(flow.key(), flow);
    }

    /// Look up the flow for a segment seen from either direction.
    pub fn get(&self, a: Endpoint, b: Endpoint) -> Option<Arc<Flow>> {
        self.flows.get(&FlowKey::new(a, b)).map(|e| e.value().clone())
    }

    pub fn remove(&self, key: &FlowKey) {
        self.flows.remove(key);
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(a: u8, port: u16) -> Endpoint {
        (Ipv4Addr::new(10, 0, 0, a), port)
    }

    fn test_flow(local: Endpoint, remote: Endpoint) -> Arc<Flow> {
        let (tx, _rx) = oneshot::channel();
        Arc::new(Flow::new(local, remote, 1000, 7, tx))
    }

    #[test]
    fn test_flow_key_direction_normalized() {
        let outbound = FlowKey::new(ep(1, 1042), ep(2, 80));
        let inbound = FlowKey::new(ep(2, 80), ep(1, 1042));
        assert_eq!(outbound, inbound, "both directions must build the same key");
    }

    #[test]
    fn test_flow_key_distinct_flows_do_not_alias() {
        // Same port values crossed over different hosts: the original's
        // loose OR matching confused these.
        let a = FlowKey::new(ep(1, 80), ep(2, 1042));
        let b = FlowKey::new(ep(1, 1042), ep(2, 80));
        assert_ne!(a, b, "crossed port pairs must map to different keys");
    }

    #[test]
    fn test_table_bidirectional_lookup() {
        let table = StateTable::new();
        let flow = test_flow(ep(1, 1042), ep(2, 80));
        table.insert(flow.clone());

        assert!(table.get(ep(1, 1042), ep(2, 80)).is_some());
        let from_wire = table.get(ep(2, 80), ep(1, 1042));
        assert!(from_wire.is_some(), "inbound view must hit the same entry");
        assert!(Arc::ptr_eq(&from_wire.unwrap(), &flow));
    }

    #[test]
    fn test_table_miss_for_unknown_tuple() {
        let table = StateTable::new();
        table.insert(test_flow(ep(1, 1042), ep(2, 80)));
        assert!(table.get(ep(1, 1042), ep(2, 443)).is_none());
        assert!(table.get(ep(3, 1042), ep(2, 80)).is_none());
    }

    #[test]
    fn test_table_remove() {
        let table = StateTable::new();
        let flow = test_flow(ep(1, 1042), ep(2, 80));
        let key = flow.key();
        table.insert(flow);
        assert!(table.contains(&key));
        table.remove(&key);
        assert!(!table.contains(&key));
        assert!(table.is_empty());
    }

    #[test]
    fn test_new_flow_initial_state() {
        let flow = test_flow(ep(1, 1042), ep(2, 80));
        let st = flow.lock();
        assert_eq!(st.socket_state, SocketState::SynSent);
        assert_eq!(st.send_next, 1000);
        assert_eq!(st.recv_next, 0);
        assert_eq!(st.send_unacked, 1000);
        assert!(!st.closing);
        assert!(!st.closed);
        assert!(st.recv_buffer.is_empty());
    }

    #[test]
    fn test_push_payload_appends_in_order() {
        let flow = test_flow(ep(1, 1042), ep(2, 80));
        let mut st = flow.lock();
        st.push_payload(b"hello ");
        st.push_payload(b"world");
        let got: Vec<u8> = st.recv_buffer.iter().copied().collect();
        assert_eq!(got, b"hello world");
    }

    #[test]
    fn test_close_stream_is_idempotent() {
        let flow = test_flow(ep(1, 1042), ep(2, 80));
        let mut st = flow.lock();
        st.close_stream();
        st.close_stream();
        assert!(st.closed);
    }

    #[test]
    fn test_close_stream_drops_handshake_signal() {
        let (tx, mut rx) = oneshot::channel();
        let flow = Flow::new(ep(1, 1042), ep(2, 80), 1000, 7, tx);
        flow.lock().close_stream();
        assert!(
            rx.try_recv().is_err(),
            "dialer must observe a dropped channel, not a success"
        );
    }

    #[test]
    fn test_signal_connected_consumed_once() {
        let (tx, mut rx) = oneshot::channel();
        let flow = Flow::new(ep(1, 1042), ep(2, 80), 1000, 7, tx);
        flow.lock().signal_connected();
        assert!(rx.try_recv().is_ok());
        // Second signal is a no-op.
        flow.lock().signal_connected();
    }

    #[test]
    fn test_signal_connected_with_receiver_gone() {
        let (tx, rx) = oneshot::channel();
        let flow = Flow::new(ep(1, 1042), ep(2, 80), 1000, 7, tx);
        drop(rx);
        // Must not panic: the notification is discarded.
        flow.lock().signal_connected();
    }

    #[test]
    fn test_socket_state_display() {
        assert_eq!(SocketState::SynSent.to_string(), "SYN_SENT");
        assert_eq!(SocketState::Established.to_string(), "ESTABLISHED");
        assert_eq!(SocketState::TimeWait.to_string(), "TIME_WAIT");
    }
}
