//! Progressive Speed-Ranking Engine (spec §4.5): a funnel of download
//! rounds with growing file sizes, scored between rounds, with automatic
//! mirror failover on `429`/`403` via the Rate-Limit Accountant.

use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt as _};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::cdn;
use crate::model::{Endpoint, ErrorKind, MinMax, Score, SpeedSample, Via, compute_score};
use crate::pool;
use crate::rate_limit::RateLimiter;
use crate::tls;

/// Small-set threshold below which every round tests every candidate
/// regardless of its declared cap (spec §4.5, §8).
const SMALL_SET_THRESHOLD: usize = 50;

/// One round's file size and candidate cap; `cap: None` means "all".
#[derive(Debug, Clone, Copy)]
pub struct RoundSpec {
    pub bytes: u64,
    pub cap: Option<usize>,
}

/// The three speed-mode presets (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedMode {
    Quick,
    Normal,
    Thorough,
}

impl SpeedMode {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quick" => Some(Self::Quick),
            "normal" => Some(Self::Normal),
            "thorough" => Some(Self::Thorough),
            _ => None,
        }
    }

    #[must_use]
    pub fn rounds(self) -> Vec<RoundSpec> {
        const MB: u64 = 1_000_000;
        match self {
            Self::Quick => vec![
                RoundSpec { bytes: MB, cap: None },
                RoundSpec { bytes: 5 * MB, cap: None },
            ],
            Self::Normal => vec![
                RoundSpec { bytes: MB, cap: None },
                RoundSpec { bytes: 5 * MB, cap: Some(50) },
                RoundSpec { bytes: 20 * MB, cap: Some(20) },
            ],
            Self::Thorough => vec![
                RoundSpec { bytes: 5 * MB, cap: None },
                RoundSpec { bytes: 25 * MB, cap: Some(20) },
                RoundSpec { bytes: 50 * MB, cap: Some(10) },
            ],
        }
    }
}

/// Parse a `--rounds "S:K,..."` override. `K` may be `all` or a number.
#[must_use]
pub fn parse_rounds_override(spec: &str) -> Option<Vec<RoundSpec>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (bytes_str, cap_str) = entry.split_once(':')?;
            let bytes: u64 = bytes_str.trim().parse().ok()?;
            let cap = if cap_str.trim().eq_ignore_ascii_case("all") {
                None
            } else {
                Some(cap_str.trim().parse().ok()?)
            };
            Some(RoundSpec { bytes, cap })
        })
        .collect()
}

/// A candidate entering the speed funnel: an endpoint plus the SNI to
/// present (its group's primary config SNI) and the latency measured in
/// §4.4, used in the composite score.
#[derive(Debug, Clone)]
pub struct SpeedCandidate {
    pub endpoint: Endpoint,
    pub sni: String,
    pub latency_ms: f64,
}

/// Run the full funnel and return each surviving endpoint's deepest-round
/// sample (spec §4.5's "Final composite").
pub async fn run(
    candidates: Vec<SpeedCandidate>,
    rounds: &[RoundSpec],
    concurrency: usize,
    download_timeout: Duration,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
) -> HashMap<Endpoint, SpeedSample> {
    // Captured once, before the funnel shrinks the candidate set: the
    // small-set rule (spec §4.5, §8) keys off how many endpoints entered
    // the funnel alive, not how many survive into a later round.
    let small_set = candidates.len() < SMALL_SET_THRESHOLD;
    let mut survivors = candidates;
    let mut deepest: HashMap<Endpoint, SpeedSample> = HashMap::new();

    for (round_id, round) in rounds.iter().enumerate() {
        if survivors.is_empty() || cancel.is_cancelled() {
            break;
        }

        let round_set = select_round_set(&survivors, round.cap, small_set);

        log::info!(
            "speed: round {}/{} — {} candidate(s), {} bytes",
            round_id + 1,
            rounds.len(),
            round_set.len(),
            round.bytes
        );

        let bytes = round.bytes;
        let round_limiter = Arc::clone(&limiter);
        let samples = pool::run_bounded(round_set, concurrency, cancel.clone(), move |candidate| {
            let limiter = Arc::clone(&round_limiter);
            async move { download_probe(candidate, round_id, bytes, download_timeout, limiter).await }
        })
        .await;

        for (candidate, sample) in &samples {
            if sample.is_success() {
                deepest.insert(candidate.endpoint, sample.clone());
            }
        }

        survivors = rank_survivors(samples);
    }

    deepest
}

/// Which candidates enter this round: every survivor if the alive-endpoint
/// count (captured once, before the funnel started shrinking it) was under
/// the small-set threshold, else the round's declared cap (spec §4.5, §8).
fn select_round_set(
    survivors: &[SpeedCandidate],
    cap: Option<usize>,
    small_set: bool,
) -> Vec<SpeedCandidate> {
    if small_set {
        return survivors.to_vec();
    }
    match cap {
        None => survivors.to_vec(),
        Some(cap) => survivors.iter().take(cap).cloned().collect(),
    }
}

fn rank_survivors(samples: Vec<(SpeedCandidate, SpeedSample)>) -> Vec<SpeedCandidate> {
    let successful: Vec<(SpeedCandidate, SpeedSample)> = samples
        .into_iter()
        .filter(|(_, sample)| sample.is_success())
        .collect();

    if successful.is_empty() {
        return Vec::new();
    }

    let Some(throughput_range) = MinMax::of(successful.iter().map(|(_, s)| s.throughput_mbps)) else {
        return Vec::new();
    };
    let Some(latency_range) = MinMax::of(successful.iter().map(|(c, _)| c.latency_ms)) else {
        return Vec::new();
    };
    let Some(ttfb_range) = MinMax::of(successful.iter().map(|(_, s)| s.ttfb_ms)) else {
        return Vec::new();
    };

    let mut ranked: Vec<(SpeedCandidate, Score)> = successful
        .into_iter()
        .map(|(candidate, sample)| {
            let score = compute_score(
                sample.throughput_mbps,
                candidate.latency_ms,
                sample.ttfb_ms,
                throughput_range,
                latency_range,
                ttfb_range,
            );
            (candidate, score)
        })
        .collect();

    // Deterministic tie-break per spec §5: (score desc, tls_ms asc, ip asc).
    ranked.sort_by(|(cand_a, score_a), (cand_b, score_b)| {
        score_b
            .0
            .partial_cmp(&score_a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| cand_a.latency_ms.total_cmp(&cand_b.latency_ms))
            .then_with(|| cand_a.endpoint.ip.cmp(&cand_b.endpoint.ip))
    });

    ranked.into_iter().map(|(candidate, _)| candidate).collect()
}

enum DownloadError {
    RateLimited { retry_after: Option<Duration> },
    Blocked,
    Network(ErrorKind),
}

async fn download_probe(
    candidate: SpeedCandidate,
    round_id: usize,
    bytes: u64,
    download_timeout: Duration,
    limiter: Arc<RateLimiter>,
) -> (SpeedCandidate, SpeedSample) {
    let mut via = limiter.acquire().await;
    let host = host_for(via);
    let mut attempt = timeout(
        download_timeout,
        do_download(candidate.endpoint, &candidate.sni, host, bytes, round_id, via),
    )
    .await
    .unwrap_or(Err(DownloadError::Network(ErrorKind::Timeout)));

    if let Err(DownloadError::RateLimited { retry_after }) = &attempt {
        limiter.record_rate_limited(*retry_after).await;
        via = Via::Mirror;
        attempt = timeout(
            download_timeout,
            do_download(candidate.endpoint, &candidate.sni, cdn::MIRROR_SPEED_HOST, bytes, round_id, via),
        )
        .await
        .unwrap_or(Err(DownloadError::Network(ErrorKind::Timeout)));
    } else if matches!(attempt, Err(DownloadError::Blocked)) && bytes >= 25_000_000 {
        via = Via::Mirror;
        attempt = timeout(
            download_timeout,
            do_download(candidate.endpoint, &candidate.sni, cdn::MIRROR_SPEED_HOST, bytes, round_id, via),
        )
        .await
        .unwrap_or(Err(DownloadError::Network(ErrorKind::Timeout)));
    }

    let sample = match attempt {
        Ok(sample) => {
            limiter.record_success(via).await;
            sample
        }
        Err(err) => {
            if via == Via::Mirror {
                limiter.record_mirror_result(false).await;
            }
            dead_sample(candidate.endpoint, round_id, bytes, via, err)
        }
    };
    (candidate, sample)
}

fn host_for(via: Via) -> &'static str {
    match via {
        Via::Direct => cdn::SPEED_HOST,
        Via::Mirror => cdn::MIRROR_SPEED_HOST,
    }
}

fn dead_sample(endpoint: Endpoint, round_id: usize, bytes: u64, via: Via, err: DownloadError) -> SpeedSample {
    let (http_status, error_kind) = match err {
        DownloadError::RateLimited { .. } => (Some(429), ErrorKind::Http(429)),
        DownloadError::Blocked => (Some(403), ErrorKind::Http(403)),
        DownloadError::Network(kind) => (None, kind),
    };
    SpeedSample {
        endpoint,
        round_id,
        bytes_requested: bytes,
        bytes_received: 0,
        ttfb_ms: 0.0,
        elapsed_ms: 0.0,
        throughput_mbps: 0.0,
        http_status,
        via,
        error_kind: Some(error_kind),
    }
}

async fn do_download(
    endpoint: Endpoint,
    sni: &str,
    host: &str,
    bytes: u64,
    round_id: usize,
    via: Via,
) -> Result<SpeedSample, DownloadError> {
    let addr = SocketAddr::new(IpAddr::V4(endpoint.ip), endpoint.port);
    let start = Instant::now();

    let (_, stream) = tls::connect_and_handshake(addr, sni, Duration::from_secs(10), endpoint)
        .await
        .map_err(|_| DownloadError::Network(ErrorKind::TlsHandshake))?;

    let mut reader = BufReader::new(stream);
    let request = format!(
        "GET {}{bytes} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\nUser-Agent: cdnedge/1\r\n\r\n",
        cdn::SPEED_PATH_PREFIX
    );
    reader
        .get_mut()
        .write_all(request.as_bytes())
        .await
        .map_err(|_| DownloadError::Network(ErrorKind::Other))?;

    let (status, headers) = tls::read_http_head(&mut reader)
        .await
        .map_err(|_| DownloadError::Network(ErrorKind::Other))?;
    let ttfb_ms = start.elapsed().as_secs_f64() * 1000.0;

    if status == 429 {
        let retry_after = headers
            .iter()
            .find(|(name, _)| name == "retry-after")
            .and_then(|(_, value)| value.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(DownloadError::RateLimited { retry_after });
    }
    if status == 403 {
        return Err(DownloadError::Blocked);
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse::<u64>().ok())
        .unwrap_or(bytes);

    let mut buf = [0u8; 64 * 1024];
    let mut received: u64 = 0;
    while received < content_length {
        let want = usize::try_from(content_length - received)
            .unwrap_or(buf.len())
            .min(buf.len());
        let n = reader
            .read(&mut buf[..want])
            .await
            .map_err(|_| DownloadError::Network(ErrorKind::Other))?;
        if n == 0 {
            break;
        }
        received += n as u64;
    }

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let throughput_mbps = if elapsed_ms > 0.0 {
        8.0 * received as f64 / (elapsed_ms / 1000.0) / 1e6
    } else {
        0.0
    };

    Ok(SpeedSample {
        endpoint,
        round_id,
        bytes_requested: bytes,
        bytes_received: received,
        ttfb_ms,
        elapsed_ms,
        throughput_mbps,
        http_status: Some(status),
        via,
        error_kind: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(ip_last: u8, latency_ms: f64) -> SpeedCandidate {
        SpeedCandidate {
            endpoint: Endpoint::new(std::net::Ipv4Addr::new(198, 51, 100, ip_last), 443),
            sni: "example.test".to_owned(),
            latency_ms,
        }
    }

    fn sample(endpoint: Endpoint, throughput_mbps: f64, ttfb_ms: f64) -> SpeedSample {
        SpeedSample {
            endpoint,
            round_id: 0,
            bytes_requested: 1_000_000,
            bytes_received: 1_000_000,
            ttfb_ms,
            elapsed_ms: 100.0,
            throughput_mbps,
            http_status: Some(200),
            via: Via::Direct,
            error_kind: None,
        }
    }

    #[test]
    fn higher_throughput_ranks_first_with_equal_latency_and_ttfb() {
        let a = candidate(1, 50.0);
        let b = candidate(2, 50.0);
        let samples = vec![
            (a.clone(), sample(a.endpoint, 100.0, 20.0)),
            (b.clone(), sample(b.endpoint, 10.0, 20.0)),
        ];
        let ranked = rank_survivors(samples);
        assert_eq!(ranked[0].endpoint, a.endpoint);
    }

    #[test]
    fn parses_rounds_override_with_all_keyword() {
        let rounds = parse_rounds_override("1000000:all,5000000:20").unwrap();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0].bytes, 1_000_000);
        assert_eq!(rounds[0].cap, None);
        assert_eq!(rounds[1].cap, Some(20));
    }

    #[test]
    fn small_set_threshold_is_fifty() {
        assert_eq!(SMALL_SET_THRESHOLD, 50);
    }

    #[test]
    fn non_small_set_applies_cap_even_after_survivors_shrink_below_threshold() {
        // 60 candidates entered the funnel alive (not small-set), but only
        // 35 survive into this round. The cap (20) must still apply — the
        // small-set rule is not re-evaluated against the shrunk count.
        let survivors: Vec<SpeedCandidate> = (0..35).map(|i| candidate(i, 10.0)).collect();
        let round_set = select_round_set(&survivors, Some(20), false);
        assert_eq!(round_set.len(), 20);
    }

    #[test]
    fn small_set_ignores_cap_regardless_of_round() {
        let survivors: Vec<SpeedCandidate> = (0..35).map(|i| candidate(i, 10.0)).collect();
        let round_set = select_round_set(&survivors, Some(20), true);
        assert_eq!(round_set.len(), 35);
    }
}
