//! Userspace TCP/IP stack over a raw IPv4 socket.
//!
//! The stack bypasses the kernel's TCP layer entirely: it opens an
//! `AF_INET/SOCK_RAW/IPPROTO_TCP` socket with `IP_HDRINCL`, parses and
//! builds every IPv4/TCP header itself, and drives each connection through
//! the TCP state machine in [`stack`]. Upper layers see a plain byte
//! stream through the [`Connection`] façade, which implements
//! `AsyncRead`/`AsyncWrite` so TLS and HTTP compose over it unchanged.
//!
//! Initiator-only: the stack dials out, it never accepts. Inbound segments
//! that match no known flow are dropped without a RST.

pub mod checksum;
pub mod conn;
pub mod flow;
pub mod ipv4;
pub mod raw;
pub mod stack;
pub mod tcp;

pub use conn::Connection;
pub use flow::{FlowKey, SocketState};
pub use stack::{Stack, DIAL_TIMEOUT, READ_TIMEOUT};

use std::io;

/// Malformed header on the wire. The reader task logs these and keeps
/// going; a bad segment never takes the stack down.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("buffer too short for {kind} header: {len} bytes")]
    Truncated { kind: &'static str, len: usize },

    #[error("IPv4 header length of {0} words is invalid")]
    BadIhl(u8),

    #[error("TCP data offset of {0} words is invalid")]
    BadDataOffset(u8),
}

/// Errors surfaced by the stack itself. Startup variants are fatal;
/// dial variants are per-host and reported by the scan worker.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("network interface {0} does not exist or has no IPv4 address")]
    InterfaceNotFound(String),

    #[error("interface lookup failed: {0}")]
    InterfaceLookup(io::Error),

    #[error("raw socket creation failed (requires CAP_NET_RAW): {0}")]
    SocketCreation(io::Error),

    #[error("raw socket option failed: {0}")]
    SocketOption(io::Error),

    #[error("no ephemeral source port available")]
    PortExhausted,

    #[error("connection attempt timed out")]
    DialTimeout,

    #[error("connection rejected by peer")]
    DialRejected,
}
