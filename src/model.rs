//! Core data model (spec §3): `ProxyConfig`, `Endpoint`, `Group`,
//! `LatencyResult`, `SpeedSample`, `Score`, `RateBudget`.
//!
//! Everything here is plain data, owned by exactly one engine at a time and
//! otherwise read-only, per the concurrency model in spec §5.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// The two proxy protocols the URI codec understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Vless,
    Vmess,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vless => "vless",
            Self::Vmess => "vmess",
        })
    }
}

/// Stream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Ws,
    Grpc,
    H2,
    Xhttp,
}

impl Transport {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ws => "ws",
            Self::Grpc => "grpc",
            Self::H2 => "h2",
            Self::Xhttp => "xhttp",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "ws" => Self::Ws,
            "grpc" => Self::Grpc,
            "h2" | "http" => Self::H2,
            "xhttp" | "splithttp" => Self::Xhttp,
            _ => Self::Tcp,
        }
    }
}

/// TLS posture of a config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tls => "tls",
            Self::Reality => "reality",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "tls" => Self::Tls,
            "reality" => Self::Reality,
            _ => Self::None,
        }
    }
}

/// VLESS-only fields, preserved verbatim per spec §4.1's parameter list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VlessExtra {
    pub flow: Option<String>,
    pub pbk: Option<String>,
    pub sid: Option<String>,
    pub spx: Option<String>,
    pub header_type: Option<String>,
    pub service_name: Option<String>,
    pub mode: Option<String>,
}

/// VMess-only fields from the JSON payload (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmessExtra {
    pub v: String,
    pub aid: u32,
    pub scy: Option<String>,
    pub header_type: Option<String>,
}

impl Default for VmessExtra {
    fn default() -> Self {
        Self {
            v: "2".to_owned(),
            aid: 0,
            scy: None,
            header_type: None,
        }
    }
}

/// Protocol-specific payload, modeled as a tagged variant per the design
/// note in spec §9 rather than a shared base type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProtocolPayload {
    Vless(VlessExtra),
    Vmess(VmessExtra),
}

/// A parsed proxy URI (spec §3). Round-tripping `raw_uri` through
/// `parse`/`emit` must yield a semantically equivalent `ProxyConfig`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyConfig {
    pub protocol: Protocol,
    pub uuid: String,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub security: Security,
    pub sni: Option<String>,
    pub path: Option<String>,
    pub http_host_header: Option<String>,
    pub fp: Option<String>,
    pub alpn: Option<String>,
    pub remark: String,
    pub raw_uri: String,
    pub payload: ProtocolPayload,
}

impl ProxyConfig {
    /// The SNI to present when probing this config's edge: the explicit
    /// `sni` if set, else the (possibly substituted) host.
    #[must_use]
    pub fn effective_sni(&self) -> &str {
        self.sni.as_deref().unwrap_or(&self.host)
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw_uri)
    }
}

/// A candidate edge endpoint. Ports permitted: 443 and, in mega sweep mode,
/// 8443.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// `ip:port`, with the port suffix shown only when it isn't 443
    /// (spec §4.3's sweep output rule).
    #[must_use]
    pub fn display_compact(&self) -> String {
        if self.port == 443 {
            self.ip.to_string()
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A join of `ProxyConfig.host → resolved IPs`: every config and domain that
/// resolved to this endpoint.
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub endpoint: Endpoint,
    pub configs: HashSet<ProxyConfig>,
    pub domains: HashSet<String>,
}

impl Group {
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            configs: HashSet::new(),
            domains: HashSet::new(),
        }
    }

    /// Any config's SNI, preferring an explicit `sni` field, used as the
    /// primary SNI for latency/speed probing of this group's endpoint.
    #[must_use]
    pub fn primary_sni(&self) -> Option<&str> {
        self.configs.iter().next().map(ProxyConfig::effective_sni)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            port: 443,
        }
    }
}

/// Coarse classification of why a probe or download failed, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Refused,
    TlsHandshake,
    Http(u16),
    Other,
}

/// Outcome of the Latency Engine's TCP-connect + TLS-handshake probe.
#[derive(Debug, Clone)]
pub struct LatencyResult {
    pub endpoint: Endpoint,
    pub alive: bool,
    pub tcp_ms: Option<f64>,
    pub tls_ms: Option<f64>,
    pub error_kind: Option<ErrorKind>,
}

impl LatencyResult {
    #[must_use]
    pub fn dead(endpoint: Endpoint, error_kind: ErrorKind) -> Self {
        Self {
            endpoint,
            alive: false,
            tcp_ms: None,
            tls_ms: None,
            error_kind: Some(error_kind),
        }
    }
}

/// Which CDN host a speed probe actually hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Direct,
    Mirror,
}

/// A single download probe result from the Speed Engine (spec §3, §4.5).
#[derive(Debug, Clone)]
pub struct SpeedSample {
    pub endpoint: Endpoint,
    pub round_id: usize,
    pub bytes_requested: u64,
    pub bytes_received: u64,
    pub ttfb_ms: f64,
    pub elapsed_ms: f64,
    pub throughput_mbps: f64,
    pub http_status: Option<u16>,
    pub via: Via,
    pub error_kind: Option<ErrorKind>,
}

impl SpeedSample {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error_kind.is_none() && self.bytes_received > 0
    }
}

/// The composite ranking score (spec §3): higher is better, zero for any
/// group with a dead latency result.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Score(pub f64);

impl Score {
    pub const DEAD: Self = Self(0.0);
}

/// Min/max bounds of a metric over the current candidate set, used to
/// normalize throughput/latency/ttfb into `[0, 1]` for scoring.
#[derive(Debug, Clone, Copy)]
pub struct MinMax {
    pub min: f64,
    pub max: f64,
}

impl MinMax {
    #[must_use]
    pub fn of(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut it = values.into_iter();
        let first = it.next()?;
        let (min, max) = it.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
        Some(Self { min, max })
    }

    /// Normalize `v` into `[0, 1]`, clamped. A degenerate (zero-width) range
    /// normalizes everything to `1.0` — every candidate is equally "best".
    #[must_use]
    pub fn normalize(&self, v: f64) -> f64 {
        if (self.max - self.min).abs() < f64::EPSILON {
            1.0
        } else {
            ((v - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
        }
    }
}

/// Composite score weights from spec §3.
pub const WEIGHT_THROUGHPUT: f64 = 0.50;
pub const WEIGHT_LATENCY: f64 = 0.35;
pub const WEIGHT_TTFB: f64 = 0.15;

/// Compute the composite score for one sample given the candidate set's
/// min/max bounds for each metric. Callers are responsible for zeroing out
/// dead groups before calling this.
#[must_use]
pub fn compute_score(
    throughput_mbps: f64,
    latency_ms: f64,
    ttfb_ms: f64,
    throughput_range: MinMax,
    latency_range: MinMax,
    ttfb_range: MinMax,
) -> Score {
    let norm_throughput = throughput_range.normalize(throughput_mbps);
    let norm_latency = latency_range.normalize(latency_ms);
    let norm_ttfb = ttfb_range.normalize(ttfb_ms);

    Score(
        WEIGHT_THROUGHPUT * norm_throughput
            + WEIGHT_LATENCY * (1.0 - norm_latency)
            + WEIGHT_TTFB * (1.0 - norm_ttfb),
    )
}

/// Fixed-window request budget for the Rate-Limit Accountant (spec §3, §4.6).
/// Mutated only by the accountant; read by speed workers before each
/// request.
#[derive(Debug)]
pub struct RateBudget {
    pub(crate) window_len: Duration,
    pub(crate) capacity: usize,
    pub(crate) timestamps: VecDeque<Instant>,
    pub(crate) paused_until: Option<Instant>,
    pub(crate) consecutive_429s: VecDeque<Instant>,
    pub(crate) using_mirror: bool,
    pub(crate) consecutive_mirror_successes: u32,
}

impl Default for RateBudget {
    fn default() -> Self {
        Self {
            window_len: Duration::from_secs(600),
            capacity: 550,
            timestamps: VecDeque::new(),
            paused_until: None,
            consecutive_429s: VecDeque::new(),
            using_mirror: false,
            consecutive_mirror_successes: 0,
        }
    }
}
