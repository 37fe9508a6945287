use std::time::Duration;

use crate::model::Endpoint;

/// Errors surfaced by the engines. Per-endpoint and per-input errors are
/// always recoverable data, never propagated with `?` past the owning
/// engine; only `Unrecoverable` should reach `main` as a hard failure.
#[derive(Debug, thiserror::Error)]
pub enum CdnEdgeError {
    #[error("malformed proxy URI: {input}")]
    MalformedUri { input: String },

    #[error("DNS resolution failed for {host}")]
    DnsFailure { host: String },

    #[error("probe to {endpoint} timed out")]
    ProbeTimeout { endpoint: Endpoint },

    #[error("probe to {endpoint} was refused")]
    ProbeRefused { endpoint: Endpoint },

    #[error("TLS handshake with {endpoint} failed: {reason}")]
    TlsHandshake { endpoint: Endpoint, reason: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("blocked for requested size ({size} bytes)")]
    BlockedSize { size: usize },

    #[error("unrecoverable error: {0}")]
    Unrecoverable(String),
}

impl From<std::io::Error> for CdnEdgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Unrecoverable(err.to_string())
    }
}

/// Maps a top-level failure to the process exit code defined in the CLI
/// contract: 0 success, 1 malformed input, 2 runtime error, 130 interrupted.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(CdnEdgeError::MalformedUri { .. }) = err.downcast_ref::<CdnEdgeError>() {
        return 1;
    }
    2
}
