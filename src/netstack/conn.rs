//! Byte-stream façade over a flow.
//!
//! `Connection` implements `AsyncRead`/`AsyncWrite`, so TLS and HTTP
//! layer over it exactly as they would over a kernel socket. Reads drain
//! the flow's reassembled buffer and park on the flow's waker until the
//! demultiplexer delivers more bytes or finishes the stream; writes and
//! shutdown emit their segment synchronously under the flow lock and
//! never suspend. Reads have no deadline of their own; the scanner
//! applies [`READ_TIMEOUT`](super::stack::READ_TIMEOUT) around them.

use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::flow::{Flow, SocketState};
use super::stack::Stack;
use super::tcp::flags;

/// User handle for one dialed flow.
pub struct Connection {
    stack: Arc<Stack>,
    flow: Arc<Flow>,
}

impl Connection {
    pub(crate) fn new(stack: Arc<Stack>, flow: Arc<Flow>) -> Self {
        Self { stack, flow }
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.flow.local.0, self.flow.local.1)
    }

    pub fn peer_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.flow.remote.0, self.flow.remote.1)
    }

    /// Begin a graceful close: emit FIN+ACK and enter FIN_WAIT_1. Calling
    /// this on a flow that is already closing is a no-op; subsequent
    /// writes fail.
    pub fn close(&self) -> io::Result<()> {
        let mut st = self.flow.lock();
        if st.closing || st.closed {
            return Ok(());
        }
        self.stack
            .send_segment(&self.flow, &mut st, flags::FIN | flags::ACK, &[])?;
        st.send_next = st.send_next.wrapping_add(1);
        st.socket_state = SocketState::FinWait1;
        st.closing = true;
        Ok(())
    }
}

impl AsyncRead for Connection {
    /// Buffered bytes first, in arrival order; `Ok` with nothing read once
    /// the stream has finished; otherwise park until the demultiplexer
    /// wakes us.
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut st = self.flow.lock();
        if !st.recv_buffer.is_empty() {
            let n = buf.remaining().min(st.recv_buffer.len());
            {
                let (first, second) = st.recv_buffer.as_slices();
                let take = first.len().min(n);
                buf.put_slice(&first[..take]);
                if take < n {
                    buf.put_slice(&second[..n - take]);
                }
            }
            st.recv_buffer.drain(..n);
            return Poll::Ready(Ok(()));
        }
        if st.closed {
            return Poll::Ready(Ok(()));
        }
        st.register_reader(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for Connection {
    /// One PSH+ACK segment per call; the whole buffer goes out at once.
    /// Callers are expected to stay under the MSS; nothing fragments
    /// here.
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut st = self.flow.lock();
        if st.closing || st.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "write on a closing or closed connection",
            )));
        }
        match self
            .stack
            .send_segment(&self.flow, &mut st, flags::PSH | flags::ACK, data)
        {
            Ok(()) => {
                st.send_next = st.send_next.wrapping_add(data.len() as u32);
                Poll::Ready(Ok(data.len()))
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes hit the wire synchronously; nothing to flush.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.close())
    }
}

impl Drop for Connection {
    /// Release the table entry once the flow has fully wound down.
    /// Anything still mid-lifecycle stays behind, matching the stack's
    /// leak-on-timeout behavior.
    fn drop(&mut self) {
        let state = self.flow.lock().socket_state;
        if matches!(state, SocketState::Closed | SocketState::TimeWait) {
            self.stack.table().remove(&self.flow.key());
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local_addr())
            .field("peer", &self.peer_addr())
            .field("state", &self.flow.lock().socket_state.to_string())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netstack::raw::RecordingSink;
    use crate::netstack::tcp::TcpHeader;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    /// Hand-built established connection around a recording sink.
    fn established() -> (Connection, Arc<RecordingSink>, Arc<Flow>) {
        let sink = Arc::new(RecordingSink::new());
        let stack = Arc::new(Stack::with_sink(LOCAL, sink.clone()));
        let (tx, _rx) = oneshot::channel();
        let flow = Arc::new(Flow::new((LOCAL, 1042), (PEER, 80), 1000, 7, tx));
        {
            let mut st = flow.lock();
            st.socket_state = SocketState::Established;
            st.send_next = 1001;
            st.recv_next = 9001;
        }
        stack.table().insert(Arc::clone(&flow));
        (Connection::new(stack, Arc::clone(&flow)), sink, flow)
    }

    fn last_segment(sink: &RecordingSink) -> TcpHeader {
        let packet = sink.packet(sink.len() - 1);
        TcpHeader::parse(&packet[20..]).unwrap()
    }

    #[tokio::test]
    async fn test_addr_accessors() {
        let (conn, _, _) = established();
        assert_eq!(conn.local_addr(), SocketAddrV4::new(LOCAL, 1042));
        assert_eq!(conn.peer_addr(), SocketAddrV4::new(PEER, 80));
    }

    #[tokio::test]
    async fn test_write_emits_psh_ack_and_advances_send_next() {
        let (mut conn, sink, flow) = established();
        conn.write_all(b"hello").await.unwrap();

        let th = last_segment(&sink);
        assert_eq!(th.flags, flags::PSH | flags::ACK);
        assert_eq!(th.seq, 1001);
        assert_eq!(th.ack, 9001);
        assert_eq!(th.payload, b"hello");
        assert_eq!(flow.lock().send_next, 1006);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (mut conn, _, _) = established();
        conn.close().unwrap();
        let err = conn.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_write_after_peer_close_fails() {
        let (mut conn, _, flow) = established();
        flow.lock().close_stream();
        flow.lock().closing = true;
        let err = conn.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_close_emits_fin_and_transitions() {
        let (conn, sink, flow) = established();
        conn.close().unwrap();

        let th = last_segment(&sink);
        assert_eq!(th.flags, flags::FIN | flags::ACK);
        assert_eq!(th.seq, 1001);
        let st = flow.lock();
        assert_eq!(st.socket_state, SocketState::FinWait1);
        assert_eq!(st.send_next, 1002);
        assert!(st.closing);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, sink, _) = established();
        conn.close().unwrap();
        conn.close().unwrap();
        assert_eq!(sink.len(), 1, "only the first close may emit a FIN");
    }

    #[tokio::test]
    async fn test_shutdown_maps_to_close() {
        let (mut conn, sink, flow) = established();
        conn.shutdown().await.unwrap();
        assert_eq!(last_segment(&sink).flags, flags::FIN | flags::ACK);
        assert_eq!(flow.lock().socket_state, SocketState::FinWait1);
    }

    #[tokio::test]
    async fn test_read_drains_buffer_then_eof() {
        let (mut conn, _, flow) = established();
        {
            let mut st = flow.lock();
            st.push_payload(b"tail bytes");
            st.close_stream();
        }
        let mut buf = [0u8; 32];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail bytes", "buffered bytes drain before EOF");
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "second read must be end-of-stream");
    }

    #[tokio::test]
    async fn test_read_respects_small_destination_buffer() {
        let (mut conn, _, flow) = established();
        flow.lock().push_payload(b"abcdef");
        let mut buf = [0u8; 4];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef", "remaining bytes must not be lost or reordered");
    }

    #[tokio::test]
    async fn test_read_wakes_on_delivery() {
        let (mut conn, _, flow) = established();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = conn.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });
        // Let the reader park first.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        flow.lock().push_payload(b"delivered");
        assert_eq!(reader.await.unwrap(), b"delivered");
    }

    #[tokio::test]
    async fn test_drop_reaps_fully_closed_flow() {
        let (conn, _, flow) = established();
        let stack = Arc::clone(&conn.stack);
        let key = flow.key();
        {
            let mut st = flow.lock();
            st.socket_state = SocketState::TimeWait;
            st.close_stream();
        }
        drop(conn);
        assert!(!stack.table().contains(&key));
    }

    #[tokio::test]
    async fn test_drop_keeps_live_flow() {
        let (conn, _, flow) = established();
        let stack = Arc::clone(&conn.stack);
        let key = flow.key();
        drop(conn);
        assert!(
            stack.table().contains(&key),
            "an established flow must linger when the façade goes away"
        );
    }
}
