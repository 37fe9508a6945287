use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ahash::{HashMap, HashMapExt as _};
use anyhow::{Context as _, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::error::CdnEdgeError;
use crate::export::ExportRow;
use crate::input_loader::{LoadArgs, LoadedInput};
use crate::model::{Endpoint, Group, LatencyResult, MinMax, Score, Via, compute_score};
use crate::speed::{SpeedCandidate, SpeedMode};
use crate::subnets::SweepMode;
use crate::sweep::SweepParams;

pub mod cdn;
pub mod dns_cache;
pub mod error;
pub mod export;
pub mod input_loader;
pub mod latency;
pub mod model;
pub mod pool;
pub mod rate_limit;
pub mod speed;
pub mod subnets;
pub mod sweep;
pub mod tls;
pub mod uri_codec;

/// Measures the quality of CDN edge IPs for use as proxy front-ends:
/// reachability, latency, and download throughput (spec §1, §6's CLI
/// surface).
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Text file of proxy URIs, a domain-JSON file, or (with --template) an
    /// address list.
    #[arg(short, long)]
    input: Option<String>,

    /// Subscription URL (plain text or base64).
    #[arg(long)]
    sub: Option<String>,

    /// Template proxy URI; requires -i/--input to supply the address list.
    #[arg(long)]
    template: Option<String>,

    /// Speed-ranking preset.
    #[arg(short, long, default_value = "normal")]
    mode: String,

    /// Round override: "bytes:cap,bytes:cap,..." (cap may be "all").
    #[arg(long)]
    rounds: Option<String>,

    /// Bounded-pool concurrency for the Sweep and Latency engines.
    #[arg(short, long, default_value_t = 300)]
    workers: usize,

    /// Bounded-pool concurrency for the Speed engine.
    #[arg(long, default_value_t = 10)]
    speed_workers: usize,

    /// Latency handshake / sweep-probe timeout, seconds.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Per-request download timeout, seconds.
    #[arg(long, default_value_t = 30)]
    speed_timeout: u64,

    /// Skip the Speed Engine; rank by latency alone.
    #[arg(long, default_value_t = false)]
    skip_download: bool,

    /// Number of URIs to emit in the top-N export.
    #[arg(long, default_value_t = 50)]
    top: usize,

    /// Disabled here: the core never depends on a terminal library (spec
    /// §9's TUI-decoupling note); accepted for CLI-surface compatibility
    /// with the external dashboard wrapper.
    #[arg(long, default_value_t = false)]
    no_tui: bool,

    /// Output file stem for the results/ exports.
    #[arg(short, long)]
    output: Option<String>,

    /// If set, also write the full sorted URI list to this exact path.
    #[arg(long)]
    output_configs: Option<String>,

    /// Run the Clean-IP Sweep Engine instead of the measure pipeline.
    #[arg(long, default_value_t = false)]
    find_clean: bool,

    /// Sweep density/verification preset.
    #[arg(long, default_value = "normal")]
    clean_mode: String,

    /// Subnet override: a path to a file, or a comma-separated CIDR list.
    #[arg(long)]
    subnets: Option<String>,

    /// Raise logging to debug.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    simple_logger::init_with_level(if args.verbose {
        log::Level::Debug
    } else {
        log::Level::Info
    })
    .context("logger initialization failed")?;

    let cancel = CancellationToken::new();
    let pipeline = run(args, cancel.clone());
    tokio::pin!(pipeline);

    let interrupted = tokio::select! {
        result = &mut pipeline => {
            result.map_err(map_exit_code)?;
            false
        }
        _ = tokio::signal::ctrl_c() => {
            log::warn!("interrupt received, draining in-flight work...");
            cancel.cancel();
            pipeline.await.map_err(map_exit_code)?;
            true
        }
    };

    if interrupted {
        std::process::exit(130);
    }
    Ok(())
}

/// Translate the top-level failure into the process exit code from spec
/// §6, by re-raising through `std::process::exit` after logging — `main`
/// itself only ever returns `Ok` or this diverges.
fn map_exit_code(err: anyhow::Error) -> anyhow::Error {
    let code = error::exit_code_for(&err);
    log::error!("{err:#}");
    std::process::exit(code);
}

async fn run(args: Args, cancel: CancellationToken) -> Result<()> {
    if args.find_clean {
        return run_sweep(&args, cancel).await;
    }
    run_measure(&args, cancel).await
}

async fn run_sweep(args: &Args, cancel: CancellationToken) -> Result<()> {
    let mode = SweepMode::parse(&args.clean_mode)
        .with_context(|| format!("unknown clean-mode: {}", args.clean_mode))?;
    let subnets = subnets::resolve_subnets(args.subnets.as_deref())?;
    let params = SweepParams {
        mode,
        subnets,
        workers: args.workers,
        handshake_timeout: Duration::from_secs(args.timeout),
        verify_timeout: Duration::from_secs(args.timeout),
    };

    let hits = sweep::run(params, cancel).await;
    let endpoints: Vec<Endpoint> = hits.iter().map(|hit| hit.endpoint).collect();

    let path = export::write_clean_ips(Path::new("results"), &endpoints)?;
    log::info!("wrote {} clean IP(s) to {}", endpoints.len(), path.display());
    Ok(())
}

async fn run_measure(args: &Args, cancel: CancellationToken) -> Result<()> {
    log::debug!(
        "latency timeout: {}, speed timeout: {}",
        humantime::format_duration(Duration::from_secs(args.timeout)),
        humantime::format_duration(Duration::from_secs(args.speed_timeout)),
    );

    let loaded = input_loader::load(&LoadArgs {
        input_file: args.input.clone(),
        sub_url: args.sub.clone(),
        template: args.template.clone(),
    })
    .await
    .map_err(anyhow::Error::from)?;

    let groups = match loaded {
        LoadedInput::Configs(configs) => {
            if configs.is_empty() {
                let input = args
                    .input
                    .clone()
                    .or_else(|| args.sub.clone())
                    .unwrap_or_else(|| "<input>".to_owned());
                bail!(CdnEdgeError::MalformedUri { input });
            }
            let (groups, dns_failures) =
                latency::resolve_and_group(configs, Duration::from_secs(3)).await;
            if dns_failures > 0 {
                log::info!("{dns_failures} config(s) dropped for DNS failure");
            }
            groups
        }
        LoadedInput::BareEndpoints(endpoints) => endpoints.into_iter().map(Group::new).collect(),
        LoadedInput::None => {
            bail!(CdnEdgeError::Unrecoverable(
                "no input given: pass -i/--input, --sub, or --find-clean".to_owned()
            ));
        }
    };

    if groups.is_empty() {
        bail!(CdnEdgeError::Unrecoverable("no candidate endpoints resolved from input".to_owned()));
    }

    let latency_results = latency::measure(
        &groups,
        Duration::from_secs(args.timeout),
        args.workers,
        cancel.clone(),
    )
    .await;

    let mut by_endpoint: HashMap<Endpoint, Group> = HashMap::new();
    for group in groups {
        by_endpoint.insert(group.endpoint, group);
    }

    let alive: Vec<(Group, f64)> = latency_results
        .iter()
        .filter(|result| result.alive)
        .filter_map(|result| {
            let group = by_endpoint.get(&result.endpoint)?.clone();
            Some((group, result.tls_ms?))
        })
        .collect();

    log::info!("{}/{} endpoint(s) alive after latency pass", alive.len(), latency_results.len());

    let dead_rows = dead_export_rows(&latency_results, &by_endpoint);

    let (ranked_uris, mut export_rows) = if args.skip_download {
        rank_by_latency_only(alive)
    } else {
        let rounds = match &args.rounds {
            Some(spec) => speed::parse_rounds_override(spec)
                .with_context(|| format!("invalid --rounds spec: {spec}"))?,
            None => SpeedMode::parse(&args.mode)
                .with_context(|| format!("unknown mode: {}", args.mode))?
                .rounds(),
        };

        let candidates: Vec<SpeedCandidate> = alive
            .iter()
            .map(|(group, tls_ms)| SpeedCandidate {
                endpoint: group.endpoint,
                sni: group.primary_sni().map(str::to_owned).unwrap_or_else(|| group.endpoint.ip.to_string()),
                latency_ms: *tls_ms,
            })
            .collect();

        let limiter = Arc::new(rate_limit::RateLimiter::new());
        let deepest = speed::run(
            candidates,
            &rounds,
            args.speed_workers,
            Duration::from_secs(args.speed_timeout),
            limiter,
            cancel,
        )
        .await;

        rank_by_score(alive, deepest)
    };

    export_rows.extend(dead_rows);

    let results_dir = Path::new("results");
    let prefix = args
        .output
        .as_deref()
        .map(|output| {
            Path::new(output)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "cdnedge".to_owned())
        })
        .unwrap_or_else(|| "cdnedge".to_owned());

    let csv_path = export::write_results_csv(results_dir, &prefix, &export_rows)?;
    log::info!("wrote {} row(s) to {}", export_rows.len(), csv_path.display());

    let top_path = export::write_top_n_uris(results_dir, &prefix, args.top, &ranked_uris)?;
    log::info!("wrote top {} URI(s) to {}", args.top.min(ranked_uris.len()), top_path.display());

    let full_path = export::write_full_sorted_uris(results_dir, &prefix, &ranked_uris)?;
    log::info!("wrote {} sorted URI(s) to {}", ranked_uris.len(), full_path.display());

    if let Some(output_configs) = &args.output_configs {
        std::fs::write(output_configs, ranked_uris.join("\n"))
            .with_context(|| format!("failed to write {output_configs}"))?;
    }

    Ok(())
}

/// Build a zero-scored, `alive: false` row for every endpoint the latency
/// pass marked dead, and log each one by endpoint so the dead-endpoint
/// scenario (spec §8 scenario 1) is actually observable, not just silently
/// dropped from the export (spec §4.7's CSV schema treats `alive` as real
/// per-row data, implying dead endpoints are still recorded).
fn dead_export_rows(
    latency_results: &[LatencyResult],
    by_endpoint: &HashMap<Endpoint, Group>,
) -> Vec<ExportRow> {
    latency_results
        .iter()
        .filter(|result| !result.alive)
        .filter_map(|result| {
            let group = by_endpoint.get(&result.endpoint)?;
            log::info!(
                "{} reported dead after latency pass ({:?})",
                result.endpoint,
                result.error_kind
            );
            Some(ExportRow {
                endpoint: result.endpoint,
                score: Score::DEAD,
                throughput_mbps: 0.0,
                latency_ms: 0.0,
                ttfb_ms: 0.0,
                alive: false,
                n_domains: group.domains.len(),
                n_configs: group.configs.len(),
                via: Via::Direct,
            })
        })
        .collect()
}

/// `--skip-download` path: rank alive groups by ascending TLS handshake
/// time alone (spec scenario 1), with no composite score available.
fn rank_by_latency_only(mut alive: Vec<(Group, f64)>) -> (Vec<String>, Vec<ExportRow>) {
    alive.sort_by(|(a, a_ms), (b, b_ms)| a_ms.total_cmp(b_ms).then_with(|| a.endpoint.ip.cmp(&b.endpoint.ip)));

    let uris = alive
        .iter()
        .filter_map(|(group, _)| group.configs.iter().next().map(|config| config.raw_uri.clone()))
        .collect();

    let rows = alive
        .into_iter()
        .map(|(group, tls_ms)| ExportRow {
            endpoint: group.endpoint,
            score: Score::DEAD,
            throughput_mbps: 0.0,
            latency_ms: tls_ms,
            ttfb_ms: 0.0,
            alive: true,
            n_domains: group.domains.len(),
            n_configs: group.configs.len(),
            via: Via::Direct,
        })
        .collect();

    (uris, rows)
}

/// The full measure path: score every endpoint that completed at least
/// one speed round (spec §3, §4.5's "Final composite"), sort by
/// `(score desc, tls_ms asc, ip asc)`, and export.
fn rank_by_score(
    alive: Vec<(Group, f64)>,
    deepest: HashMap<Endpoint, model::SpeedSample>,
) -> (Vec<String>, Vec<ExportRow>) {
    let completed: Vec<(Group, f64, model::SpeedSample)> = alive
        .iter()
        .filter_map(|(group, tls_ms)| {
            let sample = deepest.get(&group.endpoint)?;
            Some((group.clone(), *tls_ms, sample.clone()))
        })
        .collect();

    let mut scored: Vec<(Group, f64, model::SpeedSample, Score)> = Vec::new();
    if let (Some(throughput_range), Some(latency_range), Some(ttfb_range)) = (
        MinMax::of(completed.iter().map(|(_, _, sample)| sample.throughput_mbps)),
        MinMax::of(completed.iter().map(|(_, tls_ms, _)| *tls_ms)),
        MinMax::of(completed.iter().map(|(_, _, sample)| sample.ttfb_ms)),
    ) {
        for (group, tls_ms, sample) in completed {
            let score = compute_score(
                sample.throughput_mbps,
                tls_ms,
                sample.ttfb_ms,
                throughput_range,
                latency_range,
                ttfb_range,
            );
            scored.push((group, tls_ms, sample, score));
        }
    }

    scored.sort_by(|(a_group, a_ms, _, a_score), (b_group, b_ms, _, b_score)| {
        b_score
            .0
            .partial_cmp(&a_score.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a_ms.total_cmp(b_ms))
            .then_with(|| a_group.endpoint.ip.cmp(&b_group.endpoint.ip))
    });

    let uris = scored
        .iter()
        .filter_map(|(group, _, _, _)| group.configs.iter().next().map(|config| config.raw_uri.clone()))
        .collect();

    let rows = scored
        .into_iter()
        .map(|(group, tls_ms, sample, score)| ExportRow {
            endpoint: group.endpoint,
            score,
            throughput_mbps: sample.throughput_mbps,
            latency_ms: tls_ms,
            ttfb_ms: sample.ttfb_ms,
            alive: true,
            n_domains: group.domains.len(),
            n_configs: group.configs.len(),
            via: sample.via,
        })
        .collect();

    (uris, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpeedSample;
    use std::net::Ipv4Addr;

    #[test]
    fn rank_by_latency_only_sorts_ascending() {
        let a = Group::new(Endpoint::new(Ipv4Addr::new(1, 1, 1, 1), 443));
        let b = Group::new(Endpoint::new(Ipv4Addr::new(8, 8, 8, 8), 443));
        let alive = vec![(b.clone(), 50.0), (a.clone(), 10.0)];
        let (_, rows) = rank_by_latency_only(alive);
        assert_eq!(rows[0].endpoint, a.endpoint);
        assert_eq!(rows[1].endpoint, b.endpoint);
    }

    #[test]
    fn rank_by_score_excludes_groups_with_no_completed_round() {
        let a = Group::new(Endpoint::new(Ipv4Addr::new(1, 1, 1, 1), 443));
        let b = Group::new(Endpoint::new(Ipv4Addr::new(1, 0, 0, 1), 443));
        let alive = vec![(a.clone(), 10.0), (b.clone(), 20.0)];
        let mut deepest = HashMap::new();
        deepest.insert(
            a.endpoint,
            SpeedSample {
                endpoint: a.endpoint,
                round_id: 0,
                bytes_requested: 1_000_000,
                bytes_received: 1_000_000,
                ttfb_ms: 10.0,
                elapsed_ms: 100.0,
                throughput_mbps: 80.0,
                http_status: Some(200),
                via: Via::Direct,
                error_kind: None,
            },
        );
        let (uris, rows) = rank_by_score(alive, deepest);
        assert_eq!(rows.len(), 1);
        assert!(uris.is_empty() || rows.len() == 1);
    }

    #[test]
    fn dead_export_rows_reports_dead_endpoints_with_alive_false() {
        let dead_endpoint = Endpoint::new(Ipv4Addr::new(8, 8, 8, 8), 443);
        let alive_endpoint = Endpoint::new(Ipv4Addr::new(1, 1, 1, 1), 443);
        let mut by_endpoint = HashMap::new();
        by_endpoint.insert(dead_endpoint, Group::new(dead_endpoint));
        by_endpoint.insert(alive_endpoint, Group::new(alive_endpoint));

        let latency_results = vec![
            crate::model::LatencyResult {
                endpoint: alive_endpoint,
                alive: true,
                tcp_ms: Some(10.0),
                tls_ms: Some(20.0),
                error_kind: None,
            },
            crate::model::LatencyResult::dead(dead_endpoint, crate::model::ErrorKind::TlsHandshake),
        ];

        let rows = dead_export_rows(&latency_results, &by_endpoint);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].endpoint, dead_endpoint);
        assert!(!rows[0].alive);
        assert_eq!(rows[0].score.0, 0.0);
    }
}
