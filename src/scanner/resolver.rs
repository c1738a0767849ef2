//! DNS resolver construction and hostname fan-out.
//!
//! With no explicit servers the system configuration applies
//! (`/etc/resolv.conf`); `--resolvers` pins lookups to the given servers.
//! Every input hostname is tried bare and once per configured prefix.

use std::net::{IpAddr, Ipv4Addr};

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveError;
use hickory_resolver::TokioAsyncResolver;

use super::ScanError;

/// Build a resolver from the configured server list; empty means the
/// system's own configuration.
pub fn build(servers: &[String]) -> Result<TokioAsyncResolver, ScanError> {
    if servers.is_empty() {
        return Ok(TokioAsyncResolver::tokio_from_system_conf()?);
    }
    let mut ips = Vec::with_capacity(servers.len());
    for server in servers {
        let ip: IpAddr = server
            .parse()
            .map_err(|_| ScanError::BadResolver(server.clone()))?;
        ips.push(ip);
    }
    let group = NameServerConfigGroup::from_ips_clear(&ips, 53, true);
    let config = ResolverConfig::from_parts(None, Vec::new(), group);
    Ok(TokioAsyncResolver::tokio(config, ResolverOpts::default()))
}

/// The candidate hostnames for one input line: the bare name first, then
/// one per prefix. Empty prefixes are skipped.
pub fn expand_prefixes(name: &str, prefixes: &[String]) -> Vec<String> {
    let mut hosts = Vec::with_capacity(prefixes.len() + 1);
    hosts.push(name.to_string());
    for prefix in prefixes {
        if prefix.is_empty() {
            continue;
        }
        hosts.push(format!("{prefix}.{name}"));
    }
    hosts
}

/// Resolve one hostname to its A records.
pub async fn resolve_host(
    resolver: &TokioAsyncResolver,
    name: &str,
) -> Result<Vec<Ipv4Addr>, ResolveError> {
    let lookup = resolver.ipv4_lookup(name).await?;
    Ok(lookup.iter().map(|a| a.0).collect())
}

// =============================================================================
// Tests
// =============================================================================
