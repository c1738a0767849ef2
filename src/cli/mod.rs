//! CLI surface for trawl.
//!
//! Positional arguments are the URI paths probed on every host; hostnames
//! themselves arrive on stdin, one per line.

pub mod output;

use clap::{Parser, ValueEnum};

/// Trawl — mass HTTP(S) scanner over a userspace TCP/IP stack.
#[derive(Parser, Debug)]
#[command(name = "trawl", version, about)]
#[command(
    long_about = "Trawl reads hostnames from stdin, resolves each (optionally with \
    prefixes such as www.), dials port 80/443 through its own raw-socket TCP stack, \
    and issues one HTTP/1.1 GET per configured path over each connection. \
    Requires CAP_NET_RAW (sudo) for the raw socket."
)]
pub struct Cli {
    /// URI paths to probe on every host (e.g. "/" "/.git/HEAD")
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Port to scan
    #[arg(long, short = 'p', default_value_t = 80)]
    pub port: u16,

    /// Number of concurrent scan workers
    #[arg(long, default_value_t = 50)]
    pub threads: usize,

    /// Seconds to wait for each HTTP response
    #[arg(long, short = 't', default_value_t = 5)]
    pub timeout: u64,

    /// Network interface to scan from
    #[arg(long, short = 'i', default_value = "eth0")]
    pub interface: String,

    /// Comma-separated host prefixes tried in addition to the bare name
    #[arg(long, default_value = "www")]
    pub prefixes: String,

    /// Comma-separated DNS servers (empty: use /etc/resolv.conf)
    #[arg(long, default_value = "")]
    pub resolvers: String,

    /// User-Agent header sent with every request
    #[arg(long, default_value = "trawl mass scanner")]
    pub user_agent: String,

    /// Wrap each connection in TLS (SNI = hostname, no certificate checks)
    #[arg(long)]
    pub tls: bool,

    /// Profile the process and write a flamegraph on exit
    #[arg(long)]
    pub profiler: bool,

    /// Output format for scan results
    #[arg(long, default_value = "pretty", value_enum)]
    pub output: OutputFmt,
}

/// Output format argument.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFmt {
    Pretty,
    Json,
}

// =============================================================================
// Tests
// =============================================================================
