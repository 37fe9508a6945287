//! Raw TCP-connect + TLS-handshake helper shared by the Sweep and Latency
//! engines (spec §4.3, §4.4): both need precise `tcp_ms`/`tls_ms` timing
//! against an arbitrary `(ip, port)` with an arbitrary SNI, which rules out
//! a pooled HTTP client. Certificate verification is intentionally
//! disabled: we're timing whether *a* TLS handshake completes under a
//! possibly-unrelated SNI, not validating a trust chain for a data
//! channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::CdnEdgeError;
use crate::model::Endpoint;

#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

fn insecure_client_config() -> Arc<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .expect("ALL_VERSIONS is a valid static protocol set")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    Arc::new(config)
}

/// TCP and TLS handshake durations, measured independently (spec §3's
/// `LatencyResult.tcp_ms`/`tls_ms`).
#[derive(Debug, Clone, Copy)]
pub struct HandshakeTiming {
    pub tcp_ms: f64,
    pub tls_ms: f64,
}

/// Connect to `addr`, complete a TLS handshake with SNI `sni`, and return
/// the established stream plus timing. `endpoint` is only used to label
/// errors. The whole operation is bounded by `budget`.
pub async fn connect_and_handshake(
    addr: SocketAddr,
    sni: &str,
    budget: Duration,
    endpoint: Endpoint,
) -> Result<(HandshakeTiming, TlsStream<TcpStream>), CdnEdgeError> {
    let tcp_start = Instant::now();
    let tcp = timeout(budget, TcpStream::connect(addr))
        .await
        .map_err(|_| CdnEdgeError::ProbeTimeout { endpoint })?
        .map_err(|_| CdnEdgeError::ProbeRefused { endpoint })?;
    let tcp_ms = tcp_start.elapsed().as_secs_f64() * 1000.0;

    let remaining = budget.saturating_sub(tcp_start.elapsed());
    let server_name = ServerName::try_from(sni.to_owned())
        .map_err(|_| CdnEdgeError::MalformedUri { input: sni.to_owned() })?;
    let connector = TlsConnector::from(insecure_client_config());

    let tls_start = Instant::now();
    let stream = timeout(remaining, connector.connect(server_name, tcp))
        .await
        .map_err(|_| CdnEdgeError::ProbeTimeout { endpoint })?
        .map_err(|err| CdnEdgeError::TlsHandshake {
            endpoint,
            reason: err.to_string(),
        })?;
    let tls_ms = tls_start.elapsed().as_secs_f64() * 1000.0;

    Ok((HandshakeTiming { tcp_ms, tls_ms }, stream))
}

/// A minimal HTTP/1.1 response head: status code and header list
/// (lowercased names, trimmed values), shared by the Sweep engine's
/// header-verification step and the Speed engine's download probe.
pub async fn read_http_head<S>(reader: &mut BufReader<S>) -> std::io::Result<(u16, Vec<(String, String)>)>
where
    S: AsyncRead + Unpin,
{
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| std::io::Error::other("malformed HTTP status line"))?;

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if let Some((name, value)) = line.trim_end().split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
        }
    }
    Ok((status, headers))
}
