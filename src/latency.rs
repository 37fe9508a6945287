//! Config-Grouping & Latency Engine (spec §4.4): DNS resolve, group by
//! resolved IP, then a bounded-parallel TLS-connect ping over unique
//! endpoints.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr as _;
use std::time::Duration;

use ahash::{HashMap, HashMapExt as _};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::dns_cache::DnsCache;
use crate::error::CdnEdgeError;
use crate::model::{Endpoint, ErrorKind, Group, LatencyResult, ProxyConfig};
use crate::pool;
use crate::tls;

/// Resolve every config's host, build the `Endpoint -> Group` join (spec
/// §3), and report how many configs were dropped for DNS failure.
pub async fn resolve_and_group(
    configs: Vec<ProxyConfig>,
    dns_timeout: Duration,
) -> (Vec<Group>, usize) {
    let cache = Mutex::new(DnsCache::new());
    let mut groups: HashMap<Endpoint, Group> = HashMap::new();
    let mut dns_failures = 0usize;

    for config in configs {
        match resolve_host(&config.host, config.port, &cache, dns_timeout).await {
            Ok(ips) => {
                for ip in ips {
                    if let IpAddr::V4(ipv4) = ip {
                        let endpoint = Endpoint::new(ipv4, config.port);
                        let group = groups.entry(endpoint).or_insert_with(|| Group::new(endpoint));
                        group.domains.insert(config.host.clone());
                        group.configs.insert(config.clone());
                    }
                }
            }
            Err(_) => {
                log::warn!("latency: DNS resolution failed for {}", config.host);
                dns_failures += 1;
            }
        }
    }

    if dns_failures > 0 {
        log::info!("latency: {dns_failures} config(s) dropped for DNS failure");
    }

    (groups.into_values().collect(), dns_failures)
}

async fn resolve_host(
    host: &str,
    port: u16,
    cache: &Mutex<DnsCache>,
    dns_timeout: Duration,
) -> Result<Vec<IpAddr>, CdnEdgeError> {
    if let Ok(ip) = Ipv4Addr::from_str(host) {
        return Ok(vec![IpAddr::V4(ip)]);
    }

    if let Some(ips) = cache.lock().await.get(host) {
        return Ok(ips);
    }

    let lookup = timeout(dns_timeout, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| CdnEdgeError::DnsFailure { host: host.to_owned() })?
        .map_err(|_| CdnEdgeError::DnsFailure { host: host.to_owned() })?;

    let ips: Vec<IpAddr> = lookup.map(|socket_addr| socket_addr.ip()).collect();
    if ips.is_empty() {
        return Err(CdnEdgeError::DnsFailure { host: host.to_owned() });
    }

    cache.lock().await.insert(host.to_owned(), ips.clone());
    Ok(ips)
}

/// Run the latency pass over every unique endpoint in `groups` (spec
/// §4.4). An endpoint is alive iff TCP connect and TLS handshake both
/// complete within `timeout`.
pub async fn measure(
    groups: &[Group],
    timeout_dur: Duration,
    concurrency: usize,
    cancel: CancellationToken,
) -> Vec<LatencyResult> {
    let items: Vec<(Endpoint, String)> = groups
        .iter()
        .map(|group| {
            let sni = group
                .primary_sni()
                .map(str::to_owned)
                .unwrap_or_else(|| group.endpoint.ip.to_string());
            (group.endpoint, sni)
        })
        .collect();

    log::info!("latency: probing {} unique endpoint(s)", items.len());

    let results = pool::run_bounded(items, concurrency, cancel, move |(endpoint, sni)| {
        async move { probe_one(endpoint, &sni, timeout_dur).await }
    })
    .await;

    let alive = results.iter().filter(|r| r.alive).count();
    log::info!("latency: {alive}/{} endpoint(s) alive", results.len());
    results
}

async fn probe_one(endpoint: Endpoint, sni: &str, timeout_dur: Duration) -> LatencyResult {
    let addr = SocketAddr::new(IpAddr::V4(endpoint.ip), endpoint.port);
    match tls::connect_and_handshake(addr, sni, timeout_dur, endpoint).await {
        Ok((timing, _stream)) => LatencyResult {
            endpoint,
            alive: true,
            tcp_ms: Some(timing.tcp_ms),
            tls_ms: Some(timing.tls_ms),
            error_kind: None,
        },
        Err(CdnEdgeError::ProbeTimeout { .. }) => LatencyResult::dead(endpoint, ErrorKind::Timeout),
        Err(CdnEdgeError::ProbeRefused { .. }) => LatencyResult::dead(endpoint, ErrorKind::Refused),
        Err(_) => LatencyResult::dead(endpoint, ErrorKind::TlsHandshake),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_ip_host_resolves_without_dns() {
        let cache = Mutex::new(DnsCache::new());
        let ips = resolve_host("203.0.113.9", 443, &cache, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))]);
    }

    #[tokio::test]
    async fn cached_host_short_circuits_lookup() {
        let cache = Mutex::new(DnsCache::new());
        let ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4));
        cache.lock().await.insert("cached.example".to_owned(), vec![ip]);
        let ips = resolve_host("cached.example", 443, &cache, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ips, vec![ip]);
    }

    #[tokio::test]
    async fn cached_host_preserves_every_resolved_address() {
        let cache = Mutex::new(DnsCache::new());
        let first = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4));
        let second = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 5));
        cache
            .lock()
            .await
            .insert("multi.example".to_owned(), vec![first, second]);
        let ips = resolve_host("multi.example", 443, &cache, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ips, vec![first, second]);
    }
}
