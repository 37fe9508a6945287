//! Clean-IP Sweep Engine (spec §4.3): subnet sampling, bounded-parallel
//! TLS probe, and CDN-header verification.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::io::{AsyncWriteExt as _, BufReader};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::cdn;
use crate::model::Endpoint;
use crate::pool;
use crate::subnets::{self, Density, SweepMode};
use crate::tls;

/// One verified (or, in quick mode, handshake-only) sweep hit.
#[derive(Debug, Clone, Copy)]
pub struct SweepResult {
    pub endpoint: Endpoint,
    pub tls_ms: f64,
}

/// Parameters threaded through from the CLI (spec §4.3, §5).
#[derive(Debug, Clone)]
pub struct SweepParams {
    pub mode: SweepMode,
    pub subnets: Vec<Ipv4Net>,
    pub workers: usize,
    pub handshake_timeout: Duration,
    pub verify_timeout: Duration,
}

/// Run a full sweep: sample every subnet at the mode's density, probe every
/// candidate under a bounded pool, and return hits sorted by ascending TLS
/// handshake time (spec §4.3's output rule).
pub async fn run(params: SweepParams, cancel: CancellationToken) -> Vec<SweepResult> {
    let mut rng = rand::rng();
    let density = params.mode.density();
    let ports = params.mode.ports();

    let candidates: Vec<Endpoint> = params
        .subnets
        .iter()
        .flat_map(|&net| subnets::sample_subnet(net, density, &mut rng))
        .flat_map(|ip| ports.iter().map(move |&port| Endpoint::new(ip, port)))
        .collect();

    log::info!(
        "sweep: {} candidate endpoint(s) at {:?} density, verify={}",
        candidates.len(),
        density,
        params.mode.verify_header()
    );

    let verify = params.mode.verify_header();
    let handshake_timeout = params.handshake_timeout;
    let verify_timeout = params.verify_timeout;

    let results = pool::run_bounded(candidates, params.workers, cancel, move |endpoint| {
        async move { probe_one(endpoint, handshake_timeout, verify, verify_timeout).await }
    })
    .await;

    let mut hits: Vec<SweepResult> = results.into_iter().flatten().collect();
    hits.sort_by(|a, b| a.tls_ms.total_cmp(&b.tls_ms));
    log::info!("sweep: {} clean IP(s) found", hits.len());
    hits
}

async fn probe_one(
    endpoint: Endpoint,
    handshake_timeout: Duration,
    verify: bool,
    verify_timeout: Duration,
) -> Option<SweepResult> {
    let addr = SocketAddr::new(IpAddr::V4(endpoint.ip), endpoint.port);
    let (timing, stream) = tls::connect_and_handshake(addr, cdn::PROBE_SNI, handshake_timeout, endpoint)
        .await
        .ok()?;

    if verify && !verify_cdn_header(stream, verify_timeout).await {
        log::debug!("sweep: {endpoint} handshake ok but failed CDN verification");
        return None;
    }

    Some(SweepResult {
        endpoint,
        tls_ms: timing.tls_ms,
    })
}

/// Issue `HEAD /` and check for the CDN's signature (spec §4.3).
async fn verify_cdn_header(stream: tokio_rustls::client::TlsStream<tokio::net::TcpStream>, budget: Duration) -> bool {
    timeout(budget, verify_cdn_header_inner(stream))
        .await
        .unwrap_or(Ok(false))
        .unwrap_or(false)
}

async fn verify_cdn_header_inner(
    stream: tokio_rustls::client::TlsStream<tokio::net::TcpStream>,
) -> std::io::Result<bool> {
    let mut reader = BufReader::new(stream);
    let request = format!("HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", cdn::PROBE_SNI);
    reader.get_mut().write_all(request.as_bytes()).await?;

    let (_, headers) = tls::read_http_head(&mut reader).await?;
    let matched = headers.iter().any(|(name, value)| {
        if name == cdn::TRACE_HEADER_NAME {
            return true;
        }
        cdn::SIGNATURE_HEADERS
            .iter()
            .any(|(sig_name, sig_prefix)| name == sig_name && value.to_ascii_lowercase().starts_with(sig_prefix))
    });
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_subnet_quick_mode_yields_one_candidate_per_24() {
        let net: Ipv4Net = "192.0.2.0/24".parse().unwrap();
        let mut rng = rand::rng();
        let sampled = subnets::sample_subnet(net, Density::Sample(1), &mut rng);
        let candidates: Vec<Endpoint> = sampled.into_iter().map(|ip| Endpoint::new(ip, 443)).collect();
        assert_eq!(candidates.len(), 1);
    }
}
