//! Parse/emit VLESS and VMess URIs, and host substitution (spec §4.1).
//!
//! VLESS rides on `url::Url` the same way the teacher's `parse_url.rs` does:
//! non-special schemes with a `//` authority still get host/port/userinfo
//! parsing for free. VMess is base64(json) and gets its own codec.

use base64::Engine as _;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CdnEdgeError;
use crate::model::{
    Endpoint, ProtocolPayload, Protocol, ProxyConfig, Security, Transport, VlessExtra, VmessExtra,
};

/// Ordered parameter names VLESS must preserve verbatim (spec §4.1).
const VLESS_PARAM_ORDER: &[&str] = &[
    "type",
    "security",
    "sni",
    "host",
    "path",
    "fp",
    "alpn",
    "pbk",
    "sid",
    "spx",
    "flow",
    "headerType",
    "serviceName",
    "mode",
];

/// Chars we leave unescaped in path/remark, matching the tilde/slash
/// leniency browsers and xray both apply.
const ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

/// Parse any supported proxy URI line into a `ProxyConfig`.
pub fn parse(line: &str) -> Result<ProxyConfig, CdnEdgeError> {
    let trimmed = line.trim();
    if trimmed.starts_with("vless://") {
        parse_vless(trimmed)
    } else if trimmed.starts_with("vmess://") {
        parse_vmess(trimmed)
    } else {
        Err(CdnEdgeError::MalformedUri {
            input: line.to_owned(),
        })
    }
}

/// Re-serialize a `ProxyConfig` back into its wire form.
#[must_use]
pub fn emit(config: &ProxyConfig) -> String {
    match &config.payload {
        ProtocolPayload::Vless(extra) => emit_vless(config, extra),
        ProtocolPayload::Vmess(extra) => emit_vmess(config, extra),
    }
}

/// Replace a template config's host/port with `endpoint`'s, keeping every
/// other field (sni, path, uuid, security, transport, remark) byte-identical
/// (spec §4.1, §8 substitution invariance).
pub fn substitute(template: &str, endpoint: Endpoint) -> Result<String, CdnEdgeError> {
    let mut config = parse(template)?;
    config.host = endpoint.ip.to_string();
    config.port = endpoint.port;
    Ok(emit(&config))
}

fn malformed(line: &str) -> CdnEdgeError {
    CdnEdgeError::MalformedUri {
        input: line.to_owned(),
    }
}

fn parse_vless(line: &str) -> Result<ProxyConfig, CdnEdgeError> {
    let url = Url::parse(line).map_err(|_| malformed(line))?;
    if url.scheme() != "vless" {
        return Err(malformed(line));
    }

    let uuid = url.username().to_owned();
    if uuid.is_empty() {
        return Err(malformed(line));
    }
    let host = url.host_str().ok_or_else(|| malformed(line))?.to_owned();
    let port = url.port().unwrap_or(443);

    let params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let get = |key: &str| {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };

    let transport = get("type").as_deref().map_or(Transport::Tcp, Transport::parse);
    let security = get("security").as_deref().map_or(Security::None, Security::parse);
    let remark = url
        .fragment()
        .map(|frag| percent_encoding::percent_decode_str(frag).decode_utf8_lossy().into_owned())
        .unwrap_or_default();
    let path = get("path").map(|p| percent_encoding::percent_decode_str(&p).decode_utf8_lossy().into_owned());

    let extra = VlessExtra {
        flow: get("flow"),
        pbk: get("pbk"),
        sid: get("sid"),
        spx: get("spx"),
        header_type: get("headerType"),
        service_name: get("serviceName"),
        mode: get("mode"),
    };

    Ok(ProxyConfig {
        protocol: Protocol::Vless,
        uuid,
        host,
        port,
        transport,
        security,
        sni: get("sni"),
        path,
        http_host_header: get("host"),
        fp: get("fp"),
        alpn: get("alpn"),
        remark,
        raw_uri: line.to_owned(),
        payload: ProtocolPayload::Vless(extra),
    })
}

fn emit_vless(config: &ProxyConfig, extra: &VlessExtra) -> String {
    let lookup = |name: &str| -> Option<String> {
        match name {
            "type" => Some(config.transport.as_str().to_owned()),
            "security" => (config.security != Security::None)
                .then(|| config.security.as_str().to_owned()),
            "sni" => config.sni.clone(),
            "host" => config.http_host_header.clone(),
            "path" => config
                .path
                .as_ref()
                .map(|p| utf8_percent_encode(p, ENCODE_SET).to_string()),
            "fp" => config.fp.clone(),
            "alpn" => config.alpn.clone(),
            "pbk" => extra.pbk.clone(),
            "sid" => extra.sid.clone(),
            "spx" => extra.spx.clone(),
            "flow" => extra.flow.clone(),
            "headerType" => extra.header_type.clone(),
            "serviceName" => extra.service_name.clone(),
            "mode" => extra.mode.clone(),
            _ => None,
        }
    };

    let query = VLESS_PARAM_ORDER
        .iter()
        .filter_map(|&name| lookup(name).map(|v| format!("{name}={v}")))
        .collect::<Vec<_>>()
        .join("&");

    let remark = utf8_percent_encode(&config.remark, ENCODE_SET).to_string();

    if query.is_empty() {
        format!(
            "vless://{}@{}:{}#{}",
            config.uuid, config.host, config.port, remark
        )
    } else {
        format!(
            "vless://{}@{}:{}?{}#{}",
            config.uuid, config.host, config.port, query, remark
        )
    }
}

/// The VMess JSON payload (spec §4.1). `port` and `aid` are accepted as
/// either strings or numbers on input, mirroring real-world subscription
/// generators, and always emitted as strings.
#[derive(Debug, Serialize, Deserialize)]
struct VmessJson {
    v: Option<serde_json::Value>,
    ps: Option<String>,
    add: Option<String>,
    port: Option<serde_json::Value>,
    id: Option<String>,
    aid: Option<serde_json::Value>,
    net: Option<String>,
    #[serde(rename = "type")]
    type_field: Option<String>,
    host: Option<String>,
    path: Option<String>,
    tls: Option<String>,
    sni: Option<String>,
    alpn: Option<String>,
    fp: Option<String>,
    scy: Option<String>,
}

fn value_as_string(value: Option<&serde_json::Value>) -> Option<String> {
    value.and_then(|v| v.as_str().map(str::to_owned).or_else(|| v.as_u64().map(|n| n.to_string())))
}

fn decode_base64_tolerant(encoded: &str) -> Option<Vec<u8>> {
    let stripped = encoded.trim();
    base64::engine::general_purpose::STANDARD
        .decode(stripped)
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(stripped))
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(stripped))
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(stripped))
        .ok()
}

fn parse_vmess(line: &str) -> Result<ProxyConfig, CdnEdgeError> {
    let encoded = line.strip_prefix("vmess://").ok_or_else(|| malformed(line))?;
    let decoded = decode_base64_tolerant(encoded).ok_or_else(|| malformed(line))?;
    let text = String::from_utf8(decoded).map_err(|_| malformed(line))?;
    let json: VmessJson = serde_json::from_str(&text).map_err(|_| malformed(line))?;

    let host = json.add.clone().filter(|s| !s.is_empty()).ok_or_else(|| malformed(line))?;
    let uuid = json.id.clone().filter(|s| !s.is_empty()).ok_or_else(|| malformed(line))?;
    let port: u16 = value_as_string(json.port.as_ref())
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| malformed(line))?;
    let aid: u32 = value_as_string(json.aid.as_ref())
        .and_then(|a| a.parse().ok())
        .unwrap_or(0);
    let v = value_as_string(json.v.as_ref()).unwrap_or_else(|| "2".to_owned());

    let transport = json.net.as_deref().map_or(Transport::Tcp, Transport::parse);
    let security = json.tls.as_deref().map_or(Security::None, Security::parse);

    Ok(ProxyConfig {
        protocol: Protocol::Vmess,
        uuid,
        host,
        port,
        transport,
        security,
        sni: json.sni.filter(|s| !s.is_empty()),
        path: json.path.filter(|s| !s.is_empty()),
        http_host_header: json.host.filter(|s| !s.is_empty()),
        fp: json.fp.filter(|s| !s.is_empty()),
        alpn: json.alpn.filter(|s| !s.is_empty()),
        remark: json.ps.unwrap_or_default(),
        raw_uri: line.to_owned(),
        payload: ProtocolPayload::Vmess(VmessExtra {
            v,
            aid,
            scy: json.scy,
            header_type: json.type_field,
        }),
    })
}

fn emit_vmess(config: &ProxyConfig, extra: &VmessExtra) -> String {
    let json = VmessJson {
        v: Some(serde_json::Value::String(extra.v.clone())),
        ps: Some(config.remark.clone()),
        add: Some(config.host.clone()),
        port: Some(serde_json::Value::String(config.port.to_string())),
        id: Some(config.uuid.clone()),
        aid: Some(serde_json::Value::String(extra.aid.to_string())),
        net: Some(config.transport.as_str().to_owned()),
        type_field: extra.header_type.clone(),
        host: config.http_host_header.clone(),
        path: config.path.clone(),
        tls: Some(config.security.as_str().to_owned()).filter(|_| config.security != Security::None),
        sni: config.sni.clone(),
        alpn: config.alpn.clone(),
        fp: config.fp.clone(),
        scy: extra.scy.clone(),
    };

    let body = serde_json::to_string(&json).unwrap_or_default();
    let encoded = base64::engine::general_purpose::STANDARD.encode(body);
    format!("vmess://{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn vless_round_trip() {
        let uri = "vless://uuid-1@s.io:443?type=ws&security=tls&sni=s.io&path=%2Fws#remark%20here";
        let parsed = parse(uri).unwrap();
        assert_eq!(parsed.uuid, "uuid-1");
        assert_eq!(parsed.host, "s.io");
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.transport, Transport::Ws);
        assert_eq!(parsed.security, Security::Tls);
        assert_eq!(parsed.sni.as_deref(), Some("s.io"));
        assert_eq!(parsed.path.as_deref(), Some("/ws"));
        assert_eq!(parsed.remark, "remark here");

        let emitted = emit(&parsed);
        let reparsed = parse(&emitted).unwrap();
        assert_eq!(parsed.uuid, reparsed.uuid);
        assert_eq!(parsed.host, reparsed.host);
        assert_eq!(parsed.port, reparsed.port);
        assert_eq!(parsed.transport, reparsed.transport);
        assert_eq!(parsed.security, reparsed.security);
        assert_eq!(parsed.sni, reparsed.sni);
        assert_eq!(parsed.path, reparsed.path);
        assert_eq!(parsed.remark, reparsed.remark);
    }

    #[test]
    fn vmess_parse_fields() {
        let json = r#"{"v":"2","ps":"t","add":"1.2.3.4","port":"443","id":"uuid","aid":"0","net":"ws","type":"none","host":"s.io","path":"/","tls":"tls","sni":"s.io"}"#;
        let uri = format!(
            "vmess://{}",
            base64::engine::general_purpose::STANDARD.encode(json)
        );
        let parsed = parse(&uri).unwrap();
        assert_eq!(parsed.transport, Transport::Ws);
        assert_eq!(parsed.security, Security::Tls);
        assert_eq!(parsed.host, "1.2.3.4");
        assert_eq!(parsed.uuid, "uuid");
    }

    #[test]
    fn substitution_preserves_other_fields() {
        let template = "vless://uuid-1@template.example:443?type=ws&security=tls&sni=camouflage.example&path=%2Fws#t";
        let endpoint = Endpoint::new(Ipv4Addr::new(1, 1, 1, 1), 443);
        let substituted = substitute(template, endpoint).unwrap();
        let config = parse(&substituted).unwrap();
        assert_eq!(config.host, "1.1.1.1");
        assert_eq!(config.port, 443);
        assert_eq!(config.sni.as_deref(), Some("camouflage.example"));
        assert_eq!(config.path.as_deref(), Some("/ws"));
        assert_eq!(config.uuid, "uuid-1");
        assert_eq!(config.security, Security::Tls);
        assert_eq!(config.transport, Transport::Ws);
    }

    #[test]
    fn malformed_uri_reports_offending_input() {
        let err = parse("not-a-uri").unwrap_err();
        match err {
            CdnEdgeError::MalformedUri { input } => assert_eq!(input, "not-a-uri"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn vmess_tolerates_unpadded_base64() {
        let json = r#"{"add":"h","port":"443","id":"u"}"#;
        let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(json);
        let uri = format!("vmess://{encoded}");
        let parsed = parse(&uri).unwrap();
        assert_eq!(parsed.host, "h");
    }
}
