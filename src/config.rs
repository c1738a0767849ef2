//! Runtime configuration, built once from the parsed CLI.

use std::time::Duration;

use crate::cli::{Cli, OutputFmt};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub threads: usize,
    /// Budget for each HTTP response read.
    pub timeout: Duration,
    pub interface: String,
    pub prefixes: Vec<String>,
    pub resolvers: Vec<String>,
    pub user_agent: String,
    pub tls: bool,
    pub profiler: bool,
    pub output: OutputFmt,
    pub paths: Vec<String>,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            port: cli.port,
            threads: cli.threads,
            timeout: Duration::from_secs(cli.timeout),
            interface: cli.interface.clone(),
            prefixes: split_list(&cli.prefixes),
            resolvers: split_list(&cli.resolvers),
            user_agent: cli.user_agent.clone(),
            tls: cli.tls,
            profiler: cli.profiler,
            output: cli.output,
            paths: cli.paths.clone(),
        }
    }
}

/// Split a comma-separated flag value, dropping empty entries.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
