//! Five input shapes, detected in priority order (spec §4.2):
//! template+address list, subscription URL, domain-JSON, text file of URIs,
//! or clean-IP-only (no `ProxyConfig`s at all).

use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::str::FromStr as _;
use std::time::Duration;

use ahash::HashSetExt as _;
use base64::Engine as _;
use serde::Deserialize;

use crate::error::CdnEdgeError;
use crate::model::{Endpoint, ProxyConfig};
use crate::uri_codec;

/// What the loader produced: either a set of parsed proxy configs, or (for
/// clean-IP-only and raw-domain-JSON-without-template shapes) bare
/// endpoints with no associated config.
#[derive(Debug, Default)]
pub enum LoadedInput {
    Configs(Vec<ProxyConfig>),
    BareEndpoints(Vec<Endpoint>),
    #[default]
    None,
}

#[derive(Debug, Default, Clone)]
pub struct LoadArgs {
    pub input_file: Option<String>,
    pub sub_url: Option<String>,
    pub template: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DomainJson {
    data: Vec<DomainEntry>,
}

#[derive(Debug, Deserialize)]
struct DomainEntry {
    #[allow(dead_code)]
    domain: Option<String>,
    ipv4: String,
}

/// Load whichever input shape `args` describes. Malformed lines are
/// counted and logged but never abort the load (spec §7 policy).
pub async fn load(args: &LoadArgs) -> Result<LoadedInput, CdnEdgeError> {
    if let Some(template) = &args.template {
        let Some(input_file) = &args.input_file else {
            return Err(CdnEdgeError::Unrecoverable(
                "--template requires -i/--input".to_owned(),
            ));
        };
        let content = fs::read_to_string(input_file)?;
        return load_template_and_addresses(template, &content);
    }

    if let Some(url) = &args.sub_url {
        let body = fetch_subscription(url).await?;
        let text = decode_subscription_body(&body);
        return Ok(LoadedInput::Configs(parse_uri_lines(&text)));
    }

    if let Some(input_file) = &args.input_file {
        let content = fs::read_to_string(input_file)?;
        if let Ok(domain_json) = serde_json::from_str::<DomainJson>(&content) {
            let endpoints = domain_json
                .data
                .iter()
                .filter_map(|entry| Ipv4Addr::from_str(&entry.ipv4).ok())
                .map(|ip| Endpoint::new(ip, 443))
                .collect();
            return Ok(LoadedInput::BareEndpoints(endpoints));
        }
        return Ok(LoadedInput::Configs(parse_uri_lines(&content)));
    }

    Ok(LoadedInput::None)
}

fn load_template_and_addresses(
    template: &str,
    content: &str,
) -> Result<LoadedInput, CdnEdgeError> {
    if let Ok(domain_json) = serde_json::from_str::<DomainJson>(content) {
        let configs = domain_json
            .data
            .iter()
            .filter_map(|entry| {
                let ip = Ipv4Addr::from_str(&entry.ipv4).ok()?;
                let uri = uri_codec::substitute(template, Endpoint::new(ip, 443)).ok()?;
                uri_codec::parse(&uri).ok()
            })
            .collect();
        return Ok(LoadedInput::Configs(dedup_by_raw_uri(configs)));
    }

    let configs = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| parse_address_line(line))
        .filter_map(|endpoint| {
            let uri = uri_codec::substitute(template, endpoint).ok()?;
            uri_codec::parse(&uri).ok()
        })
        .collect();
    Ok(LoadedInput::Configs(dedup_by_raw_uri(configs)))
}

fn parse_address_line(line: &str) -> Option<Endpoint> {
    if let Some((ip, port)) = line.rsplit_once(':') {
        if let (Ok(ip), Ok(port)) = (Ipv4Addr::from_str(ip), port.parse::<u16>()) {
            return Some(Endpoint::new(ip, port));
        }
    }
    Ipv4Addr::from_str(line).ok().map(|ip| Endpoint::new(ip, 443))
}

fn parse_uri_lines(content: &str) -> Vec<ProxyConfig> {
    let mut malformed = 0usize;
    let configs = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match uri_codec::parse(line) {
            Ok(config) => Some(config),
            Err(_) => {
                malformed += 1;
                log::warn!("skipping malformed proxy URI: {line}");
                None
            }
        })
        .collect();
    if malformed > 0 {
        log::info!("skipped {malformed} malformed URI line(s)");
    }
    dedup_by_raw_uri(configs)
}

fn dedup_by_raw_uri(configs: Vec<ProxyConfig>) -> Vec<ProxyConfig> {
    let mut seen = HashSet::new();
    configs
        .into_iter()
        .filter(|config| seen.insert(config.raw_uri.clone()))
        .collect()
}

async fn fetch_subscription(url: &str) -> Result<String, CdnEdgeError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|err| CdnEdgeError::Unrecoverable(err.to_string()))?;
    client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|err| CdnEdgeError::Unrecoverable(format!("subscription fetch failed: {err}")))?
        .text()
        .await
        .map_err(|err| CdnEdgeError::Unrecoverable(err.to_string()))
}

/// Subscription bodies are either plain text or base64 of such text
/// (standard or url-safe, padding optional). Detection: try to decode as
/// base64 and accept if the result starts with a recognized scheme.
fn decode_subscription_body(body: &str) -> String {
    let candidate = body.trim();
    for engine in [
        &base64::engine::general_purpose::STANDARD,
        &base64::engine::general_purpose::STANDARD_NO_PAD,
        &base64::engine::general_purpose::URL_SAFE,
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
    ] {
        if let Ok(decoded) = engine.decode(candidate) {
            if let Ok(text) = String::from_utf8(decoded) {
                let leading = text.trim_start();
                if leading.starts_with("vless://") || leading.starts_with("vmess://") {
                    return text;
                }
            }
        }
    }
    body.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base64_subscription() {
        let plain = "vless://a@h:443#x\nvless://a@h:443#x\n";
        let encoded = base64::engine::general_purpose::STANDARD.encode(plain);
        let decoded = decode_subscription_body(&encoded);
        assert_eq!(decoded, plain);
    }

    #[test]
    fn plain_subscription_passes_through() {
        let plain = "vless://a@h:443#x\n";
        assert_eq!(decode_subscription_body(plain), plain);
    }

    #[test]
    fn duplicate_uris_collapse_to_one_config() {
        let plain = "vless://a@h:443#x\nvless://a@h:443#x\n";
        let configs = parse_uri_lines(plain);
        assert_eq!(configs.len(), 1);
    }

    #[test]
    fn text_file_skips_comments_and_blanks() {
        let content = "# comment\n\nvless://a@h:443#x\n";
        let configs = parse_uri_lines(content);
        assert_eq!(configs.len(), 1);
    }
}
