//! Exporter (spec §4.7): CSV, top-N and full-sorted URI lists, and the
//! clean-IP list. All filenames are timestamped; existing files are never
//! overwritten.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::CdnEdgeError;
use crate::model::{Endpoint, Score, Via};

/// One exported row, joining a scored endpoint with its group metadata
/// (spec §4.7's CSV column list).
#[derive(Debug, Clone)]
pub struct ExportRow {
    pub endpoint: Endpoint,
    pub score: Score,
    pub throughput_mbps: f64,
    pub latency_ms: f64,
    pub ttfb_ms: f64,
    pub alive: bool,
    pub n_domains: usize,
    pub n_configs: usize,
    pub via: Via,
}

/// Write `{prefix}_results.csv` (spec §4.7, §6's CSV shape: RFC
/// 4180-like, header row, UTF-8, LF endings, numeric fields unquoted).
pub fn write_results_csv(dir: &Path, prefix: &str, rows: &[ExportRow]) -> Result<PathBuf, CdnEdgeError> {
    let path = unique_path(dir, prefix, "results", "csv")?;
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_path(&path)
        .map_err(|err| CdnEdgeError::Unrecoverable(err.to_string()))?;

    writer
        .write_record([
            "ip", "port", "score", "throughput_mbps", "latency_ms", "ttfb_ms", "alive", "n_domains", "n_configs", "via",
        ])
        .map_err(|err| CdnEdgeError::Unrecoverable(err.to_string()))?;

    for row in rows {
        writer
            .write_record([
                row.endpoint.ip.to_string(),
                row.endpoint.port.to_string(),
                format!("{:.4}", row.score.0),
                format!("{:.2}", row.throughput_mbps),
                format!("{:.2}", row.latency_ms),
                format!("{:.2}", row.ttfb_ms),
                row.alive.to_string(),
                row.n_domains.to_string(),
                row.n_configs.to_string(),
                via_str(row.via).to_owned(),
            ])
            .map_err(|err| CdnEdgeError::Unrecoverable(err.to_string()))?;
    }

    writer.flush().map_err(|err| CdnEdgeError::Unrecoverable(err.to_string()))?;
    Ok(path)
}

/// Write `{prefix}_top50.txt` (or whatever `top_n` is): the best `top_n`
/// URIs, best score first.
pub fn write_top_n_uris(dir: &Path, prefix: &str, top_n: usize, sorted_best_first: &[String]) -> Result<PathBuf, CdnEdgeError> {
    let path = unique_path(dir, prefix, &format!("top{top_n}"), "txt")?;
    let body = sorted_best_first.iter().take(top_n).cloned().collect::<Vec<_>>().join("\n");
    fs::write(&path, body)?;
    Ok(path)
}

/// Write `{prefix}_full_sorted.txt`: every URI, best to worst.
pub fn write_full_sorted_uris(dir: &Path, prefix: &str, sorted_best_first: &[String]) -> Result<PathBuf, CdnEdgeError> {
    let path = unique_path(dir, prefix, "full_sorted", "txt")?;
    fs::write(&path, sorted_best_first.join("\n"))?;
    Ok(path)
}

/// Write `clean_ips.txt`: the Sweep Engine's output, one `ip[:port]` per
/// line (spec §4.7, §6's clean-IP output format).
pub fn write_clean_ips(dir: &Path, endpoints: &[Endpoint]) -> Result<PathBuf, CdnEdgeError> {
    let path = unique_path(dir, "clean", "ips", "txt")?;
    let body = endpoints
        .iter()
        .map(Endpoint::display_compact)
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(&path, body)?;
    Ok(path)
}

fn via_str(via: Via) -> &'static str {
    match via {
        Via::Direct => "direct",
        Via::Mirror => "mirror",
    }
}

/// Build a timestamped, collision-free path under `dir` (spec §4.7:
/// "existing files are never overwritten"). `dir` is created if missing.
fn unique_path(dir: &Path, prefix: &str, label: &str, ext: &str) -> Result<PathBuf, CdnEdgeError> {
    fs::create_dir_all(dir)?;
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let mut path = dir.join(format!("{prefix}_{label}_{timestamp}.{ext}"));
    let mut suffix = 1u32;
    while path.exists() {
        path = dir.join(format!("{prefix}_{label}_{timestamp}_{suffix}.{ext}"));
        suffix += 1;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn unique_path_avoids_collision() {
        let dir = std::env::temp_dir().join(format!("cdnedge-export-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let first = unique_path(&dir, "x", "results", "csv").unwrap();
        fs::write(&first, "a").unwrap();
        let second = unique_path(&dir, "x", "results", "csv").unwrap();
        assert_ne!(first, second);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn clean_ips_hides_default_port() {
        let dir = std::env::temp_dir().join(format!("cdnedge-export-test2-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let endpoints = vec![
            Endpoint::new(Ipv4Addr::new(1, 1, 1, 1), 443),
            Endpoint::new(Ipv4Addr::new(1, 1, 1, 2), 8443),
        ];
        let path = write_clean_ips(&dir, &endpoints).unwrap();
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("1.1.1.1\n"));
        assert!(content.contains("1.1.1.2:8443"));
        let _ = fs::remove_dir_all(&dir);
    }
}
