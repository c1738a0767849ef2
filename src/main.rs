//! Trawl — mass HTTP(S) scanner over a userspace TCP/IP stack.
//!
//! Usage:
//!   cat hosts.txt | sudo trawl "/" "/.git/HEAD" [--port 443 --tls]
//!
//! Hostnames are read from stdin, one per line. Requires CAP_NET_RAW.

use std::io::IsTerminal;

use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use trawl::cli::Cli;
use trawl::config::Config;
use trawl::scanner::Scanner;

#[tokio::main]
async fn main() {
    // Initialise logging (RUST_LOG=debug etc.)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(&cli);

    if std::io::stdin().is_terminal() {
        eprintln!("Error: hostnames are read from stdin; pipe a list in (e.g. cat hosts.txt | trawl /)");
        std::process::exit(1);
    }

    #[cfg(target_os = "linux")]
    let profiler = if config.profiler {
        match pprof::ProfilerGuardBuilder::default().frequency(99).build() {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!(error = %e, "profiler unavailable");
                None
            }
        }
    } else {
        None
    };

    let interface = config.interface.clone();
    let scanner = match Scanner::new(config) {
        Ok(scanner) => scanner,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        interface = %interface,
        "trawl mass http(s) scanner"
    );

    // Feed stdin lines into the pipeline; dropping the sender (EOF or
    // shutdown signal) is what ends the scan.
    let (hosts_tx, hosts_rx) = mpsc::channel::<String>(100);
    let feeder = tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if hosts_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "stdin read failed");
                    break;
                }
            }
        }
    });

    {
        let feeder_abort = feeder.abort_handle();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("shutdown signal received, draining outstanding scans");
            feeder_abort.abort();
        });
    }

    if let Err(e) = scanner.run(hosts_rx).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    #[cfg(target_os = "linux")]
    if let Some(guard) = profiler {
        write_flamegraph(&guard);
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "cannot install SIGTERM handler");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(target_os = "linux")]
fn write_flamegraph(guard: &pprof::ProfilerGuard<'_>) {
    const PATH: &str = "trawl-flamegraph.svg";
    let report = match guard.report().build() {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(error = %e, "profiler report failed");
            return;
        }
    };
    match std::fs::File::create(PATH) {
        Ok(file) => {
            if let Err(e) = report.flamegraph(file) {
                tracing::warn!(error = %e, "flamegraph write failed");
            } else {
                tracing::info!(path = PATH, "profiler flamegraph written");
            }
        }
        Err(e) => tracing::warn!(error = %e, path = PATH, "could not create flamegraph file"),
    }
}
