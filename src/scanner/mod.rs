//! Scanner pipeline: resolver fan-out feeding a bounded scan worker pool.
//!
//! Input hostnames stream in on a channel, a resolver pool expands each
//! with the configured prefixes and produces (name, address) pairs, and a
//! worker pool dials every pair through the userspace stack, optionally
//! wraps the stream in TLS, and fetches each configured path over the one
//! connection. Results go to stdout; failures are logged and isolated to
//! their host.

pub mod http;
pub mod resolver;
pub mod tls;

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use hickory_resolver::error::ResolveError;
use hickory_resolver::TokioAsyncResolver;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cli::{output, OutputFmt};
use crate::config::Config;
use crate::netstack::{Stack, StackError, READ_TIMEOUT};

/// Concurrent lookups in the resolver pool.
const RESOLVER_POOL: usize = 100;
/// Depth of the host and resolved-host channels.
const CHANNEL_DEPTH: usize = 100;
/// Progress line cadence.
const PROGRESS_EVERY: usize = 100;

/// One resolved scan target.
#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub addr: Ipv4Addr,
}

/// One fetched path, as reported on stdout.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub host: String,
    pub addr: Ipv4Addr,
    pub path: String,
    pub status: u16,
    pub snippet: String,
    pub scanned_at: DateTime<Utc>,
}

/// Scanner setup failures; all fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Stack(#[from] StackError),

    #[error("resolver setup failed: {0}")]
    Resolver(#[from] ResolveError),

    #[error("invalid resolver address '{0}'")]
    BadResolver(String),
}

/// Byte stream a scan runs over: the façade, plain or TLS-wrapped.
pub trait ScanStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ScanStream for T {}

pub struct Scanner {
    stack: Arc<Stack>,
    resolver: TokioAsyncResolver,
    config: Arc<Config>,
}

impl Scanner {
    /// Bring up the stack on the configured interface and build the
    /// resolver.
    pub fn new(config: Config) -> Result<Self, ScanError> {
        let stack = Arc::new(Stack::new(&config.interface)?);
        let resolver = resolver::build(&config.resolvers)?;
        Ok(Self {
            stack,
            resolver,
            config: Arc::new(config),
        })
    }

    /// Consume hostnames until the channel closes, then drain outstanding
    /// scans. Closing the sender (end of stdin or a shutdown signal) is
    /// the only stop condition.
    pub async fn run(&self, hosts: mpsc::Receiver<String>) -> Result<(), ScanError> {
        self.stack.start()?;

        let (resolved_tx, mut resolved_rx) = mpsc::channel::<Host>(CHANNEL_DEPTH);
        let resolve_task = tokio::spawn(resolve_pool(
            self.resolver.clone(),
            Arc::clone(&self.config),
            hosts,
            resolved_tx,
        ));

        let limiter = Arc::new(Semaphore::new(self.config.threads));
        let mut scans = JoinSet::new();
        let started = Instant::now();
        let mut count = 0usize;

        while let Some(host) = resolved_rx.recv().await {
            if count > 0 && count % PROGRESS_EVERY == 0 {
                let ms = started.elapsed().as_millis() as u64;
                info!(
                    hosts = count,
                    elapsed_s = ms / 1000,
                    avg_ms = ms / count as u64,
                    "progress"
                );
            }
            let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
                break;
            };
            let stack = Arc::clone(&self.stack);
            let config = Arc::clone(&self.config);
            scans.spawn(async move {
                let _permit = permit;
                scan_host(stack, config, host).await;
            });
            count += 1;
            while scans.try_join_next().is_some() {}
        }

        while scans.join_next().await.is_some() {}
        let _ = resolve_task.await;
        info!(
            hosts = count,
            elapsed_s = started.elapsed().as_secs(),
            "scan complete"
        );
        Ok(())
    }
}

/// Resolve incoming names with bounded concurrency, fanning each out over
/// the configured prefixes. Dropping `resolved_tx` on return is what lets
/// the scan loop finish.
async fn resolve_pool(
    resolver: TokioAsyncResolver,
    config: Arc<Config>,
    mut hosts: mpsc::Receiver<String>,
    resolved_tx: mpsc::Sender<Host>,
) {
    let limiter = Arc::new(Semaphore::new(RESOLVER_POOL));
    let mut lookups = JoinSet::new();

    while let Some(line) = hosts.recv().await {
        let name = line.trim().to_string();
        if name.is_empty() {
            continue;
        }
        let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
            break;
        };
        let resolver = resolver.clone();
        let config = Arc::clone(&config);
        let tx = resolved_tx.clone();
        lookups.spawn(async move {
            let _permit = permit;
            for candidate in resolver::expand_prefixes(&name, &config.prefixes) {
                match resolver::resolve_host(&resolver, &candidate).await {
                    Ok(addrs) => {
                        for addr in addrs {
                            let host = Host {
                                name: candidate.clone(),
                                addr,
                            };
                            if tx.send(host).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(host = %candidate, error = %e, "could not resolve host");
                    }
                }
            }
        });
        while lookups.try_join_next().is_some() {}
    }
    while lookups.join_next().await.is_some() {}
}

/// Scan one resolved host: dial, optional TLS, one GET per path over the
/// same connection, close.
async fn scan_host(stack: Arc<Stack>, config: Arc<Config>, host: Host) {
    let mut stream = match connect(&stack, &config, &host).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(host = %host.name, addr = %host.addr, error = %e, "connect failed");
            return;
        }
    };

    for path in &config.paths {
        let request = http::format_request(path, &config.user_agent, &host.name);
        match http::exchange(&mut stream, request.as_bytes(), config.timeout).await {
            Ok(response) => {
                let record = ScanRecord {
                    host: host.name.clone(),
                    addr: host.addr,
                    path: path.clone(),
                    status: response.status,
                    snippet: http::body_snippet(&response.body),
                    scanned_at: Utc::now(),
                };
                emit(&record, config.output);
            }
            Err(e) => {
                warn!(host = %host.name, path = %path, error = %e, "request failed");
                break;
            }
        }
    }

    if let Err(e) = stream.shutdown().await {
        debug!(host = %host.name, error = %e, "close failed");
    }
}

/// Dial through the stack and optionally run the TLS handshake.
async fn connect(
    stack: &Arc<Stack>,
    config: &Config,
    host: &Host,
) -> io::Result<Box<dyn ScanStream>> {
    let conn = stack
        .connect(host.addr, config.port)
        .await
        .map_err(stack_io_error)?;
    if !config.tls {
        return Ok(Box::new(conn));
    }
    let handshake = tls::wrap(conn, &host.name);
    let stream = tokio::time::timeout(READ_TIMEOUT, handshake)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tls handshake timed out"))??;
    Ok(Box::new(stream))
}

fn stack_io_error(e: StackError) -> io::Error {
    let kind = match e {
        StackError::DialTimeout => io::ErrorKind::TimedOut,
        StackError::DialRejected => io::ErrorKind::ConnectionRefused,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

fn emit(record: &ScanRecord, fmt: OutputFmt) {
    let line = match fmt {
        OutputFmt::Pretty => output::format_pretty(record),
        OutputFmt::Json => output::format_json(record),
    };
    println!("{line}");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_error_kind_mapping() {
        assert_eq!(
            stack_io_error(StackError::DialTimeout).kind(),
            io::ErrorKind::TimedOut
        );
        assert_eq!(
            stack_io_error(StackError::DialRejected).kind(),
            io::ErrorKind::ConnectionRefused
        );
        assert_eq!(
            stack_io_error(StackError::PortExhausted).kind(),
            io::ErrorKind::Other
        );
    }

    #[test]
    fn test_scan_record_serializes_all_fields() {
        let record = ScanRecord {
            host: "www.example.com".to_string(),
            addr: Ipv4Addr::new(93, 184, 216, 34),
            path: "/".to_string(),
            status: 200,
            snippet: "HTTP body".to_string(),
            scanned_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"host\":\"www.example.com\""));
        assert!(json.contains("\"addr\":\"93.184.216.34\""));
        assert!(json.contains("\"status\":200"));
        assert!(json.contains("\"scanned_at\""));
    }
}
